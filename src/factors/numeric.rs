//! Central-difference Jacobians through the vertex update.
//!
//! Column `k` of the Jacobian of slot `i` is
//!
//! ```text
//! (e(x_i ⊞ h·e_k) - e(x_i ⊞ -h·e_k)) / 2h
//! ```
//!
//! with the same `⊞` the solver applies, so the derivative is always taken in the tangent
//! space the update lives in (body frame for 6-DoF poses, world yaw and translation for
//! 4-DoF poses, left-multiplied for similarities).

use nalgebra::{DMatrix, DVector};

use crate::core::{ProblemResult, Vertex};

/// Perturbation step.
pub const NUMERIC_DELTA: f64 = 1e-6;

/// Jacobians of `error` with respect to every vertex of `vertices`.
pub fn central_difference<F>(
    vertices: &[&Vertex],
    residual_dim: usize,
    error: F,
) -> ProblemResult<Vec<DMatrix<f64>>>
where
    F: Fn(&[&Vertex]) -> ProblemResult<DVector<f64>>,
{
    let mut jacobians = Vec::with_capacity(vertices.len());
    for slot in 0..vertices.len() {
        let dim = vertices[slot].dimension();
        let mut jacobian = DMatrix::zeros(residual_dim, dim);

        for k in 0..dim {
            let mut step = vec![0.0; dim];

            step[k] = NUMERIC_DELTA;
            let mut plus = vertices[slot].clone();
            plus.oplus(&step);

            step[k] = -NUMERIC_DELTA;
            let mut minus = vertices[slot].clone();
            minus.oplus(&step);

            let mut perturbed: Vec<&Vertex> = vertices.to_vec();
            perturbed[slot] = &plus;
            let e_plus = error(&perturbed)?;
            perturbed[slot] = &minus;
            let e_minus = error(&perturbed)?;

            jacobian.set_column(k, &((e_plus - e_minus) / (2.0 * NUMERIC_DELTA)));
        }
        jacobians.push(jacobian);
    }
    Ok(jacobians)
}
