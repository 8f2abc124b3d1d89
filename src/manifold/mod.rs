//! Manifold representations for estimation on non-Euclidean spaces.
//!
//! The kernel is organised around the three groups a visual-inertial back-end needs:
//! - **SO(3)**: rotations, as free functions over `Matrix3` in [`so3`]
//! - **SE(3)**: rigid body transformations in [`se3`]
//! - **Sim(3)**: similarity transformations in [`sim3`], used by pose-graph correction
//!
//! Lie group M,° | size | dim | X ∈ M            | Constraint | T_X M      | Exp(T)        | Comp.   | Action
//! ------------- | ---- | --- | ---------------- | ---------- | ---------- | ------------- | ------- | ------
//! Rotation      | 9    | 3   | R                | RᵀR = I    | θ ∈ R³     | R = exp([θ]x) | R₁R₂    | Rx
//! Rigid motion  | 16   | 6   | M = [R t; 0 1]   | RᵀR = I    | [θ; ρ] ∈ R⁶ | Exp([θ; ρ])  | M₁M₂    | Rx+t
//! Similarity    | 16   | 7   | M = [sR t; 0 1]  | RᵀR = I    | [θ; ρ; σ] ∈ R⁷ | Exp([θ; ρ; σ]) | M₁M₂ | sRx+t
//!
//! Tangent vectors always place the rotational part first. This matches the body-frame
//! perturbation `[δθ; δt]` used by the pose parameter block, so Jacobians computed in one
//! place can be reused in another without permutation.

use nalgebra::Vector3;
use std::fmt::Debug;

pub mod se3;
pub mod sim3;
pub mod so3;

pub use se3::SE3;
pub use sim3::{Sim3, Vector7};

/// Common interface of the matrix Lie groups used by the factors.
pub trait LieGroup: Clone + Debug + PartialEq {
    /// Tangent space representation
    type Tangent;

    /// Degrees of freedom of the group
    const DOF: usize;

    /// Identity element
    fn identity() -> Self;

    /// Group inverse
    fn inverse(&self) -> Self;

    /// Group composition `self ∘ other`
    fn compose(&self, other: &Self) -> Self;

    /// Exponential map from the tangent space
    fn exp(tangent: &Self::Tangent) -> Self;

    /// Logarithmic map to the tangent space
    fn log(&self) -> Self::Tangent;

    /// Group action on a 3-D point
    fn act(&self, point: &Vector3<f64>) -> Vector3<f64>;

    /// Relative element `self⁻¹ ∘ other`
    fn between(&self, other: &Self) -> Self {
        self.inverse().compose(other)
    }
}
