//! Schur-complement marginalization of a block of a joint Hessian.
//!
//! Given a joint information matrix partitioned into an eliminated block `b` and the
//! retained rest `r`:
//!
//! ```text
//! H = [ H_rr  H_rb ]      H_rr' = H_rr - H_rb · H_bb⁺ · H_br
//!     [ H_br  H_bb ]
//! ```
//!
//! `H_bb⁺` is the eigen-decomposition pseudo-inverse of the eliminated block; directions
//! with eigenvalue below [`MARGINALIZATION_EIGEN_THRESHOLD`] are unobservable and excluded.
//! The result keeps the input layout: the eliminated rows and columns are zero-filled, so
//! retained variables keep their indices.

use nalgebra::DMatrix;
use std::ops::Range;

use super::information::pseudo_inverse;
use super::{LinAlgError, LinAlgResult};

/// Eigenvalues of the eliminated block below this value are ignored by the pseudo-inverse.
pub const MARGINALIZATION_EIGEN_THRESHOLD: f64 = 1e-8;

/// Marginalize the variables in `eliminated` out of the Hessian `h`.
///
/// # Arguments
///
/// * `h` - Square joint Hessian
/// * `eliminated` - Contiguous index range of the block to eliminate (may be empty)
///
/// # Returns
///
/// A matrix of the same size as `h` holding the Schur complement on the retained indices
/// and zeros on the eliminated rows and columns.
///
/// # Example
///
/// ```
/// use fusion_solver::linalg::marginalize;
/// use nalgebra::DMatrix;
///
/// let h = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 2.0]);
/// let prior = marginalize(&h, 1..2).unwrap();
/// assert!((prior[(0, 0)] - 1.5).abs() < 1e-12);
/// assert_eq!(prior[(1, 1)], 0.0);
/// ```
pub fn marginalize(h: &DMatrix<f64>, eliminated: Range<usize>) -> LinAlgResult<DMatrix<f64>> {
    let n = h.nrows();
    if !h.is_square() {
        return Err(LinAlgError::DimensionMismatch(format!(
            "cannot marginalize a {}x{} matrix",
            h.nrows(),
            h.ncols()
        )));
    }
    if eliminated.start > eliminated.end || eliminated.end > n {
        return Err(LinAlgError::DimensionMismatch(format!(
            "marginalization range {eliminated:?} outside of a {n}x{n} matrix"
        )));
    }
    if eliminated.is_empty() {
        return Ok(h.clone());
    }

    let kept: Vec<usize> = (0..n).filter(|i| !eliminated.contains(i)).collect();
    let removed: Vec<usize> = eliminated.clone().collect();

    let h_kk = h.select_rows(&kept).select_columns(&kept);
    let h_kb = h.select_rows(&kept).select_columns(&removed);
    let h_bb = h.select_rows(&removed).select_columns(&removed);

    let h_bb_inv = pseudo_inverse(&h_bb, MARGINALIZATION_EIGEN_THRESHOLD);
    let reduced = &h_kk - &h_kb * h_bb_inv * h_kb.transpose();

    let mut result = DMatrix::zeros(n, n);
    for (ri, &row) in kept.iter().enumerate() {
        for (ci, &col) in kept.iter().enumerate() {
            result[(row, col)] = reduced[(ri, ci)];
        }
    }
    Ok(result)
}
