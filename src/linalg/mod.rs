//! Linear algebra for the normal equations of the factor graph.
//!
//! This module provides:
//! - Dense linear system solvers (Cholesky and QR) behind the [`LinearSolver`] trait
//! - Schur complement elimination of landmark blocks ([`schur`])
//! - Marginalization of a Hessian block into a prior ([`marginalization`])
//! - Information matrix conditioning: symmetrization and eigenvalue flooring ([`information`])
//!
//! Problems handled by this crate are windowed (a handful to a few hundred keyframes), so
//! the reduced camera system is small enough for dense factorizations once landmarks have
//! been eliminated.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub mod cholesky;
pub mod information;
pub mod marginalization;
pub mod qr;
pub mod schur;

pub use cholesky::DenseCholeskySolver;
pub use information::{floor_information, information_from_covariance, pseudo_inverse};
pub use marginalization::marginalize;
pub use qr::DenseQrSolver;
pub use schur::{BlockSystem, LandmarkBlock};

/// Linear algebra error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Matrix factorization failed (not positive definite, rank deficient, ...)
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// A small diagonal block could not be inverted
    #[error("Singular block: {0}")]
    SingularBlock(String),

    /// Dimensions of the operands do not agree
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Type of dense solver used for the reduced system
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinearSolverType {
    /// Cholesky factorization (LLᵀ), requires a positive definite matrix
    #[default]
    DenseCholesky,
    /// Householder QR, slower but tolerant to semi-definite systems
    DenseQr,
}

impl fmt::Display for LinearSolverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinearSolverType::DenseCholesky => write!(f, "Dense Cholesky"),
            LinearSolverType::DenseQr => write!(f, "Dense QR"),
        }
    }
}

/// Common interface for dense symmetric linear system solvers.
pub trait LinearSolver: Send + Sync {
    /// Solve `A x = b` for a symmetric system matrix `A`.
    fn solve(&mut self, matrix: &DMatrix<f64>, rhs: &DVector<f64>) -> LinAlgResult<DVector<f64>>;
}

/// Create the solver selected by `solver_type`.
pub fn create_linear_solver(solver_type: LinearSolverType) -> Box<dyn LinearSolver> {
    match solver_type {
        LinearSolverType::DenseCholesky => Box::new(DenseCholeskySolver::new()),
        LinearSolverType::DenseQr => Box::new(DenseQrSolver::new()),
    }
}

fn check_system(matrix: &DMatrix<f64>, rhs: &DVector<f64>) -> LinAlgResult<()> {
    if !matrix.is_square() || matrix.nrows() != rhs.len() {
        return Err(LinAlgError::DimensionMismatch(format!(
            "system matrix is {}x{}, right-hand side has {} rows",
            matrix.nrows(),
            matrix.ncols(),
            rhs.len()
        )));
    }
    Ok(())
}
