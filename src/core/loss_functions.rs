//! Robust loss functions for outlier rejection.
//!
//! With a robust loss ρ the cost of a factor becomes `ρ(χ²)` instead of `χ² = eᵀΩe`.
//! The solver applies the loss in iteratively reweighted form: the information of every
//! factor is scaled by `ρ'(χ²)` at linearization time and the objective is `Σ ρ(χ²)`.
//!
//! # Available Loss Functions
//!
//! - [`HuberLoss`]: Quadratic for inliers, linear for outliers
//! - [`CauchyLoss`]: Heavier suppression of large residuals
//!
//! # Example
//!
//! ```
//! use fusion_solver::core::loss_functions::{HuberLoss, Loss};
//!
//! // Chi-square threshold of a 2-D reprojection at 95%
//! let huber = HuberLoss::new(5.991f64.sqrt()).unwrap();
//!
//! let [rho, rho_prime, _] = huber.evaluate(1.0);
//! assert_eq!(rho, 1.0);
//! assert_eq!(rho_prime, 1.0);
//!
//! let [_, rho_prime, _] = huber.evaluate(50.0);
//! assert!(rho_prime < 1.0);
//! ```

use std::fmt::Debug;

use super::{ProblemError, ProblemResult};

/// Robust loss evaluated on the squared Mahalanobis error `s = eᵀΩe`.
///
/// `evaluate` returns `[ρ(s), ρ'(s), ρ''(s)]`. Implementations satisfy `ρ(0) = 0` and
/// `ρ'(0) = 1`.
pub trait Loss: Send + Sync + Debug {
    fn evaluate(&self, s: f64) -> [f64; 3];
}

/// Huber loss.
///
/// ```text
/// ρ(s) = s              if s ≤ δ²
///        2δ√s - δ²      otherwise
/// ```
///
/// The visual factors use `δ = √χ²₉₅`, so the kernel switches to the linear branch exactly
/// where an observation stops being an inlier.
#[derive(Debug, Clone)]
pub struct HuberLoss {
    scale: f64,
    scale2: f64,
}

impl HuberLoss {
    /// Create a Huber loss with threshold `scale` (must be positive).
    pub fn new(scale: f64) -> ProblemResult<Self> {
        if scale <= 0.0 || !scale.is_finite() {
            return Err(ProblemError::InvalidInput(format!(
                "Huber scale must be positive, got {scale}"
            )));
        }
        Ok(HuberLoss {
            scale,
            scale2: scale * scale,
        })
    }

    /// The threshold δ.
    pub fn scale(&self) -> f64 {
        self.scale
    }
}

impl Loss for HuberLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        if s > self.scale2 {
            let r = s.sqrt();
            let rho1 = (self.scale / r).max(f64::MIN_POSITIVE);
            [2.0 * self.scale * r - self.scale2, rho1, -rho1 / (2.0 * s)]
        } else {
            [s, 1.0, 0.0]
        }
    }
}

/// Cauchy loss.
///
/// ```text
/// ρ(s)   = δ² ln(1 + s/δ²)
/// ρ'(s)  = 1 / (1 + s/δ²)
/// ρ''(s) = -1 / (δ² (1 + s/δ²)²)
/// ```
#[derive(Debug, Clone)]
pub struct CauchyLoss {
    scale2: f64,
    c: f64,
}

impl CauchyLoss {
    /// Create a Cauchy loss with scale `scale` (must be positive).
    pub fn new(scale: f64) -> ProblemResult<Self> {
        if scale <= 0.0 || !scale.is_finite() {
            return Err(ProblemError::InvalidInput(format!(
                "Cauchy scale must be positive, got {scale}"
            )));
        }
        let scale2 = scale * scale;
        Ok(CauchyLoss {
            scale2,
            c: 1.0 / scale2,
        })
    }
}

impl Loss for CauchyLoss {
    fn evaluate(&self, s: f64) -> [f64; 3] {
        let sum = 1.0 + s * self.c;
        let inv = 1.0 / sum;
        [
            self.scale2 * sum.ln(),
            inv.max(f64::MIN_POSITIVE),
            -self.c * (inv * inv),
        ]
    }
}
