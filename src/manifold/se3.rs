//! SE(3) rigid body transformations.
//!
//! An element is stored as a rotation matrix and a translation so it can be exchanged with
//! the pose parameter block without conversions. The tangent vector is ordered
//! `[θ; ρ]` (rotation first):
//!
//! ```text
//! Exp([θ; ρ]) = [ Exp(θ)  Jl(θ)ρ ]
//!               [   0       1    ]
//! ```

use super::LieGroup;
use super::so3;
use nalgebra::{Matrix3, Matrix4, Vector3, Vector6};
use serde::{Deserialize, Serialize};

/// Rigid transformation `x ↦ R·x + t`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SE3 {
    /// Rotation part
    pub rotation: Matrix3<f64>,
    /// Translation part
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Create a transformation from rotation and translation.
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Create a transformation from a rotation vector and a translation.
    pub fn from_rotation_vector(rotation: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Self::new(so3::exp(&rotation), translation)
    }

    /// Homogeneous 4×4 matrix.
    pub fn to_homogeneous(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Build from a homogeneous 4×4 matrix, re-orthonormalizing the rotation block.
    pub fn from_homogeneous(m: &Matrix4<f64>) -> Self {
        let rotation = so3::normalize_rotation(&m.fixed_view::<3, 3>(0, 0).into_owned());
        Self::new(rotation, m.fixed_view::<3, 1>(0, 3).into_owned())
    }
}

impl LieGroup for SE3 {
    type Tangent = Vector6<f64>;
    const DOF: usize = 6;

    fn identity() -> Self {
        Self::new(Matrix3::identity(), Vector3::zeros())
    }

    fn inverse(&self) -> Self {
        let rt = self.rotation.transpose();
        Self::new(rt, -(rt * self.translation))
    }

    fn compose(&self, other: &Self) -> Self {
        Self::new(
            self.rotation * other.rotation,
            self.rotation * other.translation + self.translation,
        )
    }

    fn exp(tangent: &Vector6<f64>) -> Self {
        let theta = tangent.fixed_rows::<3>(0).into_owned();
        let rho = tangent.fixed_rows::<3>(3).into_owned();
        Self::new(so3::exp(&theta), so3::left_jacobian(&theta) * rho)
    }

    fn log(&self) -> Vector6<f64> {
        let theta = so3::log(&self.rotation);
        let rho = so3::inverse_left_jacobian(&theta) * self.translation;
        let mut tangent = Vector6::zeros();
        tangent.fixed_rows_mut::<3>(0).copy_from(&theta);
        tangent.fixed_rows_mut::<3>(3).copy_from(&rho);
        tangent
    }

    fn act(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }
}
