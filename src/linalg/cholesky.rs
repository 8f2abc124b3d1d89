use nalgebra::{DMatrix, DVector};

use super::{LinAlgError, LinAlgResult, LinearSolver, check_system};

/// Dense LLᵀ solver for the (reduced) normal equations.
#[derive(Debug, Clone, Default)]
pub struct DenseCholeskySolver {
    factorizations: usize,
}

impl DenseCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful factorizations performed so far.
    pub fn factorizations(&self) -> usize {
        self.factorizations
    }
}

impl LinearSolver for DenseCholeskySolver {
    fn solve(&mut self, matrix: &DMatrix<f64>, rhs: &DVector<f64>) -> LinAlgResult<DVector<f64>> {
        check_system(matrix, rhs)?;
        if matrix.nrows() == 0 {
            return Ok(DVector::zeros(0));
        }
        let cholesky = matrix.clone().cholesky().ok_or_else(|| {
            LinAlgError::FactorizationFailed(format!(
                "{}x{} system is not positive definite",
                matrix.nrows(),
                matrix.ncols()
            ))
        })?;
        self.factorizations += 1;
        Ok(cholesky.solve(rhs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solve_spd_system() -> Result<(), Box<dyn std::error::Error>> {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.5, 1.0, 3.0, 0.2, 0.5, 0.2, 2.0]);
        let x_true = DVector::from_vec(vec![1.0, -2.0, 0.5]);
        let b = &a * &x_true;
        let mut solver = DenseCholeskySolver::new();
        let x = solver.solve(&a, &b)?;
        assert!((x - x_true).norm() < 1e-12);
        assert_eq!(solver.factorizations(), 1);
        Ok(())
    }

    #[test]
    fn test_indefinite_matrix_is_rejected() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -1.0]);
        let b = DVector::from_vec(vec![1.0, 1.0]);
        let mut solver = DenseCholeskySolver::new();
        assert!(matches!(
            solver.solve(&a, &b),
            Err(LinAlgError::FactorizationFailed(_))
        ));
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = DMatrix::<f64>::identity(3, 3);
        let b = DVector::from_vec(vec![1.0, 1.0]);
        let mut solver = DenseCholeskySolver::new();
        assert!(matches!(
            solver.solve(&a, &b),
            Err(LinAlgError::DimensionMismatch(_))
        ));
    }
}
