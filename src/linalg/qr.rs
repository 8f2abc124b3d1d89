use nalgebra::{DMatrix, DVector};

use super::{LinAlgError, LinAlgResult, LinearSolver, check_system};

/// Dense Householder QR solver.
///
/// Used when the damped system may be only semi-definite, e.g. plain Gauss-Newton on a
/// gauge-free graph.
#[derive(Debug, Clone, Default)]
pub struct DenseQrSolver;

impl DenseQrSolver {
    pub fn new() -> Self {
        Self
    }
}

impl LinearSolver for DenseQrSolver {
    fn solve(&mut self, matrix: &DMatrix<f64>, rhs: &DVector<f64>) -> LinAlgResult<DVector<f64>> {
        check_system(matrix, rhs)?;
        if matrix.nrows() == 0 {
            return Ok(DVector::zeros(0));
        }
        matrix
            .clone()
            .qr()
            .solve(rhs)
            .ok_or_else(|| LinAlgError::FactorizationFailed("QR system is singular".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qr_matches_direct_solution() -> Result<(), Box<dyn std::error::Error>> {
        let a = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 3.0]);
        let b = DVector::from_vec(vec![3.0, 5.0]);
        let x = DenseQrSolver::new().solve(&a, &b)?;
        assert!((&a * &x - b).norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_singular_system_fails() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 0.0]);
        let b = DVector::from_vec(vec![1.0, 2.0]);
        assert!(DenseQrSolver::new().solve(&a, &b).is_err());
    }
}
