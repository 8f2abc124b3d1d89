//! Sim(3) similarity transformations.
//!
//! Used by the 7-DoF essential graph and by the two-view similarity refinement, where the
//! scale drift of a monocular map must be estimated together with the rigid motion.
//!
//! The tangent vector is `[θ; ρ; σ]` with `s = e^σ`. The exponential follows the closed form
//!
//! ```text
//! Exp([θ; ρ; σ]) = [ e^σ Exp(θ)   W(θ, σ) ρ ]
//!                  [     0            1     ]
//! W = A [θ]x + B [θ]x² + C I
//! ```
//!
//! with the coefficients `A`, `B`, `C` switching to their limits when `θ` or `σ` vanish.

use super::LieGroup;
use super::se3::SE3;
use super::so3;
use nalgebra::{Matrix3, SVector, Vector3};
use serde::{Deserialize, Serialize};

const EPS: f64 = 1e-5;

/// Tangent vector of Sim(3).
pub type Vector7<T> = SVector<T, 7>;

/// Similarity transformation `x ↦ s·R·x + t`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sim3 {
    /// Rotation part
    pub rotation: Matrix3<f64>,
    /// Translation part
    pub translation: Vector3<f64>,
    /// Positive scale factor
    pub scale: f64,
}

impl Sim3 {
    /// Create a similarity from its parts.
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        Self {
            rotation,
            translation,
            scale,
        }
    }

    /// Lift a rigid transformation to a similarity with unit scale.
    pub fn from_se3(pose: &SE3) -> Self {
        Self::new(pose.rotation, pose.translation, 1.0)
    }

    /// Rigid transformation with the scale divided out of the translation.
    ///
    /// For a world-to-camera similarity `Scw` this yields the metric camera pose `Tcw`.
    pub fn to_se3(&self) -> SE3 {
        SE3::new(self.rotation, self.translation / self.scale)
    }
}

/// The `W(θ, σ)` matrix coupling translation tangent and group translation.
fn translation_jacobian(theta: &Vector3<f64>, sigma: f64) -> Matrix3<f64> {
    let s = sigma.exp();
    let th = theta.norm();
    let omega = so3::skew(theta);
    let omega2 = omega * omega;

    let (a, b, c);
    if sigma.abs() < EPS {
        c = 1.0;
        if th < EPS {
            a = 0.5;
            b = 1.0 / 6.0;
        } else {
            let th2 = th * th;
            a = (1.0 - th.cos()) / th2;
            b = (th - th.sin()) / (th2 * th);
        }
    } else {
        c = (s - 1.0) / sigma;
        if th < EPS {
            let sigma2 = sigma * sigma;
            a = ((sigma - 1.0) * s + 1.0) / sigma2;
            b = ((0.5 * sigma2 - sigma + 1.0) * s - 1.0) / (sigma2 * sigma);
        } else {
            let sin_term = s * th.sin();
            let cos_term = s * th.cos();
            let denom = th * th + sigma * sigma;
            a = (sin_term * sigma + (1.0 - cos_term) * th) / (th * denom);
            b = (c - ((cos_term - 1.0) * sigma + sin_term * th) / denom) / (th * th);
        }
    }
    a * omega + b * omega2 + c * Matrix3::identity()
}

impl LieGroup for Sim3 {
    type Tangent = Vector7<f64>;
    const DOF: usize = 7;

    fn identity() -> Self {
        Self::new(Matrix3::identity(), Vector3::zeros(), 1.0)
    }

    fn inverse(&self) -> Self {
        let rt = self.rotation.transpose();
        let inv_scale = 1.0 / self.scale;
        Self::new(rt, -(inv_scale * (rt * self.translation)), inv_scale)
    }

    fn compose(&self, other: &Self) -> Self {
        Self::new(
            self.rotation * other.rotation,
            self.scale * (self.rotation * other.translation) + self.translation,
            self.scale * other.scale,
        )
    }

    fn exp(tangent: &Vector7<f64>) -> Self {
        let theta = tangent.fixed_rows::<3>(0).into_owned();
        let rho = tangent.fixed_rows::<3>(3).into_owned();
        let sigma = tangent[6];
        let w = translation_jacobian(&theta, sigma);
        Self::new(so3::exp(&theta), w * rho, sigma.exp())
    }

    fn log(&self) -> Vector7<f64> {
        let theta = so3::log(&self.rotation);
        let sigma = self.scale.ln();
        let w = translation_jacobian(&theta, sigma);
        let rho = w
            .try_inverse()
            .map_or(self.translation, |w_inv| w_inv * self.translation);

        let mut tangent = Vector7::zeros();
        tangent.fixed_rows_mut::<3>(0).copy_from(&theta);
        tangent.fixed_rows_mut::<3>(3).copy_from(&rho);
        tangent[6] = sigma;
        tangent
    }

    fn act(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * point) + self.translation
    }
}
