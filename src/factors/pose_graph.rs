//! Relative-pose factors of the loop-closing pose graphs and the two-view alignment.

use nalgebra::{Matrix2, Matrix3, Matrix6, SMatrix, Vector2, Vector3, Vector6};

use super::{camera_transform_at, sim3_at};
use crate::core::{ProblemResult, Vertex};
use crate::manifold::{LieGroup, SE3, Sim3, Vector7, so3};
use crate::sensors::PinholeCamera;

/// Relative pose between two 4-DoF poses.
///
/// With `Rij = Ri·Rjᵀ` and `tij = Ri·(-Rjᵀ·tj) + ti` built from the world-to-camera poses,
/// `e = [Log(Rij·ΔRᵀ); tij - Δt]`. Vertices: `[pose i, pose j]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseGraph4DofFactor {
    /// Measured `Tij = Tiw · Tjw⁻¹`
    pub t_ij: SE3,
    pub information: Matrix6<f64>,
}

impl PoseGraph4DofFactor {
    /// Factor with unit information.
    pub fn new(t_ij: SE3) -> Self {
        Self {
            t_ij,
            information: Matrix6::identity(),
        }
    }

    pub(crate) fn error(&self, vertices: &[&Vertex]) -> ProblemResult<Vector6<f64>> {
        let t_iw = camera_transform_at(vertices, 0, "PoseGraph4Dof")?;
        let t_jw = camera_transform_at(vertices, 1, "PoseGraph4Dof")?;
        let r_ij: Matrix3<f64> = t_iw.rotation * t_jw.rotation.transpose();
        let t_ij = t_iw.rotation * (-(t_jw.rotation.transpose() * t_jw.translation))
            + t_iw.translation;

        let mut error = Vector6::zeros();
        error
            .fixed_rows_mut::<3>(0)
            .copy_from(&so3::log(&(r_ij * self.t_ij.rotation.transpose())));
        error
            .fixed_rows_mut::<3>(3)
            .copy_from(&(t_ij - self.t_ij.translation));
        Ok(error)
    }
}

/// Relative similarity between two keyframes, `e = log(Sji · Siw · Sjw⁻¹)`.
///
/// Vertices: `[Sim3 i, Sim3 j]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityFactor {
    /// Measured `Sji = Sjw · Siw⁻¹`
    pub s_ji: Sim3,
    pub information: SMatrix<f64, 7, 7>,
}

impl SimilarityFactor {
    /// Factor with unit information.
    pub fn new(s_ji: Sim3) -> Self {
        Self {
            s_ji,
            information: SMatrix::identity(),
        }
    }

    pub(crate) fn error(&self, vertices: &[&Vertex]) -> ProblemResult<Vector7<f64>> {
        let s_iw = sim3_at(vertices, 0, "Similarity")?;
        let s_jw = sim3_at(vertices, 1, "Similarity")?;
        Ok(self.s_ji.compose(s_iw).compose(&s_jw.inverse()).log())
    }
}

/// Projection of a matched point through a two-view similarity `S12`.
///
/// The forward direction maps a point of camera 2 into camera 1, `e = obs₁ - π₁(S12·X₂)`;
/// the inverse direction maps a point of camera 1 into camera 2, `e = obs₂ - π₂(S12⁻¹·X₁)`.
/// Vertices: `[S12]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityProjectionFactor {
    pub obs: Vector2<f64>,
    /// Point in the frame of the other camera
    pub point: Vector3<f64>,
    /// Intrinsics of the observing camera
    pub camera: PinholeCamera,
    pub inverse: bool,
    pub information: Matrix2<f64>,
}

impl SimilarityProjectionFactor {
    /// Observation in camera 1 of a point of camera 2.
    pub fn forward(obs: Vector2<f64>, point: Vector3<f64>, camera: PinholeCamera, inv_sigma2: f64) -> Self {
        Self {
            obs,
            point,
            camera,
            inverse: false,
            information: Matrix2::identity() * inv_sigma2,
        }
    }

    /// Observation in camera 2 of a point of camera 1.
    pub fn inverse(obs: Vector2<f64>, point: Vector3<f64>, camera: PinholeCamera, inv_sigma2: f64) -> Self {
        Self {
            inverse: true,
            ..Self::forward(obs, point, camera, inv_sigma2)
        }
    }

    /// Point in the observing camera.
    pub fn transformed_point(&self, s12: &Sim3) -> Vector3<f64> {
        if self.inverse {
            s12.inverse().act(&self.point)
        } else {
            s12.act(&self.point)
        }
    }

    pub(crate) fn error(&self, vertices: &[&Vertex]) -> ProblemResult<Vector2<f64>> {
        let s12 = sim3_at(vertices, 0, "SimilarityProjection")?;
        Ok(self.obs - self.camera.project(&self.transformed_point(s12)))
    }
}
