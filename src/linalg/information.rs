//! Conditioning of information and covariance matrices.
//!
//! Information matrices coming from preintegration or marginalization are only
//! approximately symmetric positive semi-definite. Before use they are symmetrized and
//! every eigenvalue below [`INFORMATION_EIGEN_FLOOR`] is clamped to zero, so that a
//! numerically negative direction can never turn a factor into a reward for divergence.

use nalgebra::{DMatrix, DVector};

/// Eigenvalues of an information matrix below this value are set to zero.
pub const INFORMATION_EIGEN_FLOOR: f64 = 1e-12;

/// Symmetric part `(M + Mᵀ) / 2`.
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    (m + m.transpose()) * 0.5
}

/// Symmetrize and clamp eigenvalues below [`INFORMATION_EIGEN_FLOOR`] to zero.
pub fn floor_information(m: &DMatrix<f64>) -> DMatrix<f64> {
    if m.nrows() == 0 {
        return m.clone();
    }
    let eigen = symmetrize(m).symmetric_eigen();
    let floored = eigen
        .eigenvalues
        .map(|lambda| if lambda < INFORMATION_EIGEN_FLOOR { 0.0 } else { lambda });
    &eigen.eigenvectors * DMatrix::from_diagonal(&floored) * eigen.eigenvectors.transpose()
}

/// Pseudo-inverse of a symmetric matrix through its eigen-decomposition.
///
/// Eigenvalues below `threshold` are treated as unobservable directions and excluded.
pub fn pseudo_inverse(m: &DMatrix<f64>, threshold: f64) -> DMatrix<f64> {
    if m.nrows() == 0 {
        return m.clone();
    }
    let eigen = symmetrize(m).symmetric_eigen();
    let inverted: DVector<f64> = eigen
        .eigenvalues
        .map(|lambda| if lambda > threshold { 1.0 / lambda } else { 0.0 });
    &eigen.eigenvectors * DMatrix::from_diagonal(&inverted) * eigen.eigenvectors.transpose()
}

/// Information matrix from a covariance: inverse, symmetrized, eigenvalue-floored.
///
/// A singular covariance falls back to the pseudo-inverse, which leaves the unobserved
/// directions without weight instead of producing non-finite values.
pub fn information_from_covariance(covariance: &DMatrix<f64>) -> DMatrix<f64> {
    let symmetric = symmetrize(covariance);
    let inverse = symmetric
        .clone()
        .try_inverse()
        .filter(|inv| inv.iter().all(|v| v.is_finite()))
        .unwrap_or_else(|| pseudo_inverse(&symmetric, INFORMATION_EIGEN_FLOOR));
    floor_information(&inverse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_removes_negative_eigenvalues() {
        // eigenvalues 3 and -1
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        let floored = floor_information(&m);
        let eigen = floored.symmetric_eigen();
        assert!(eigen.eigenvalues.iter().all(|&l| l > -1e-12));
        assert!((eigen.eigenvalues.max() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_floor_keeps_positive_definite_matrix() {
        let m = DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]);
        assert!((floor_information(&m) - &m).norm() < 1e-12);
    }

    #[test]
    fn test_information_from_diagonal_covariance() {
        let cov = DMatrix::from_diagonal(&DVector::from_vec(vec![0.25, 4.0, 1.0]));
        let info = information_from_covariance(&cov);
        assert!((info[(0, 0)] - 4.0).abs() < 1e-12);
        assert!((info[(1, 1)] - 0.25).abs() < 1e-12);
        assert!((info[(2, 2)] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_singular_covariance_gives_finite_information() {
        let cov = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 0.0]));
        let info = information_from_covariance(&cov);
        assert!(info.iter().all(|v| v.is_finite()));
        assert!((info[(0, 0)] - 1.0).abs() < 1e-12);
        assert!(info[(1, 1)].abs() < 1e-12);
    }

    #[test]
    fn test_pseudo_inverse_excludes_small_eigenvalues() {
        let m = DMatrix::from_diagonal(&DVector::from_vec(vec![2.0, 1e-10]));
        let pinv = pseudo_inverse(&m, 1e-8);
        assert!((pinv[(0, 0)] - 0.5).abs() < 1e-12);
        assert_eq!(pinv[(1, 1)], 0.0);
    }
}
