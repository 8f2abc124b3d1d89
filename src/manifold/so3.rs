//! SO(3) kernel: exponential and logarithmic maps, right Jacobians and helpers.
//!
//! Rotations are represented as plain `Matrix3<f64>`. Every factor in the crate builds its
//! Jacobians from these few functions, so they are written as free functions operating on
//! nalgebra values rather than behind a wrapper type.
//!
//! # Small-angle handling
//!
//! All closed forms divide by powers of the rotation angle `θ = |ω|`. Below
//! [`SMALL_ANGLE_THRESHOLD`] the exponential switches to its second-order Taylor expansion
//! and both right Jacobians fall back to the identity.
//!
//! ```text
//! Exp(ω)   = I + sin(θ)/θ [ω]x + (1 - cos θ)/θ² [ω]x²
//! Jr(ω)    = I - (1 - cos θ)/θ² [ω]x + (θ - sin θ)/θ³ [ω]x²
//! Jr⁻¹(ω)  = I + ½[ω]x + (1/θ² - (1 + cos θ)/(2θ sin θ)) [ω]x²
//! ```

use nalgebra::{Matrix3, Vector3};

/// Angle below which the Taylor / identity fallbacks are used.
pub const SMALL_ANGLE_THRESHOLD: f64 = 1e-5;

/// Skew-symmetric matrix `[v]x` such that `[v]x * u = v × u`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Project a nearly orthonormal matrix onto the closest rotation (`U·Vᵀ` of its SVD).
///
/// A reflection in the input is corrected by flipping the sign of the last singular
/// direction, so the result always has determinant +1.
pub fn normalize_rotation(r: &Matrix3<f64>) -> Matrix3<f64> {
    let svd = r.svd(true, true);
    match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => {
            let mut projected = u * v_t;
            if projected.determinant() < 0.0 {
                let mut u_flipped = u;
                u_flipped.column_mut(2).neg_mut();
                projected = u_flipped * v_t;
            }
            projected
        }
        _ => *r,
    }
}

/// Exponential map `so(3) → SO(3)`.
///
/// The result is re-orthonormalized before it is returned.
pub fn exp(w: &Vector3<f64>) -> Matrix3<f64> {
    // Exact zero maps to the exact identity.
    if w.x == 0.0 && w.y == 0.0 && w.z == 0.0 {
        return Matrix3::identity();
    }

    let d2 = w.norm_squared();
    let d = d2.sqrt();
    let big_w = skew(w);
    let r = if d < SMALL_ANGLE_THRESHOLD {
        Matrix3::identity() + big_w + 0.5 * big_w * big_w
    } else {
        Matrix3::identity() + big_w * (d.sin() / d) + big_w * big_w * ((1.0 - d.cos()) / d2)
    };
    normalize_rotation(&r)
}

/// Logarithmic map `SO(3) → so(3)`.
///
/// When the angle is degenerate (cosine outside `[-1, 1]` from round-off, or `sin θ ≈ 0`)
/// the antisymmetric part of `R` is returned unscaled. It is exactly zero at the identity
/// and vanishes together with the angle.
pub fn log(r: &Matrix3<f64>) -> Vector3<f64> {
    let tr = r.trace();
    let w = Vector3::new(
        (r[(2, 1)] - r[(1, 2)]) * 0.5,
        (r[(0, 2)] - r[(2, 0)]) * 0.5,
        (r[(1, 0)] - r[(0, 1)]) * 0.5,
    );
    let cos_theta = (tr - 1.0) * 0.5;
    if !(-1.0..=1.0).contains(&cos_theta) {
        return w;
    }
    let theta = cos_theta.acos();
    let s = theta.sin();
    if s.abs() < SMALL_ANGLE_THRESHOLD {
        w
    } else {
        theta * w / s
    }
}

/// Right Jacobian of SO(3).
pub fn right_jacobian(w: &Vector3<f64>) -> Matrix3<f64> {
    let d2 = w.norm_squared();
    let d = d2.sqrt();
    if d < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity();
    }
    let big_w = skew(w);
    Matrix3::identity() - big_w * ((1.0 - d.cos()) / d2) + big_w * big_w * ((d - d.sin()) / (d2 * d))
}

/// Inverse of the right Jacobian of SO(3).
pub fn inverse_right_jacobian(w: &Vector3<f64>) -> Matrix3<f64> {
    let d2 = w.norm_squared();
    let d = d2.sqrt();
    if d < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity();
    }
    let big_w = skew(w);
    Matrix3::identity()
        + big_w * 0.5
        + big_w * big_w * (1.0 / d2 - (1.0 + d.cos()) / (2.0 * d * d.sin()))
}

/// Left Jacobian of SO(3), `Jl(ω) = Jr(-ω)`.
pub fn left_jacobian(w: &Vector3<f64>) -> Matrix3<f64> {
    right_jacobian(&(-w))
}

/// Inverse of the left Jacobian of SO(3).
pub fn inverse_left_jacobian(w: &Vector3<f64>) -> Matrix3<f64> {
    inverse_right_jacobian(&(-w))
}
