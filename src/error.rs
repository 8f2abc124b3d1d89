//! Error types for the fusion-solver library
//!
//! This module provides the crate-level error and result types returned by the
//! optimization drivers. Module errors convert into [`FusionError`] through `From`, so
//! driver code propagates them with `?`.

use crate::{core::ProblemError, linalg::LinAlgError, optimizer::OptimizerError};
use thiserror::Error;

/// Main result type used throughout the fusion-solver library
pub type FusionResult<T> = Result<T, FusionError>;

/// Main error type for the fusion-solver library
#[derive(Debug, Clone, Error)]
pub enum FusionError {
    /// Factor graph construction or evaluation errors
    #[error("Problem error: {0}")]
    Problem(String),

    /// Linear algebra related errors
    #[error("Linear algebra error: {0}")]
    LinearAlgebra(String),

    /// Solver related errors
    #[error("Solver error: {0}")]
    Solver(String),

    /// An observation names a landmark missing from the snapshot
    #[error("Unknown landmark {0}")]
    UnknownLandmark(usize),

    /// A keyframe reference names a keyframe missing from the snapshot
    #[error("Unknown keyframe {0}")]
    UnknownKeyFrame(usize),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<ProblemError> for FusionError {
    fn from(err: ProblemError) -> Self {
        FusionError::Problem(err.to_string())
    }
}

impl From<LinAlgError> for FusionError {
    fn from(err: LinAlgError) -> Self {
        FusionError::LinearAlgebra(err.to_string())
    }
}

impl From<OptimizerError> for FusionError {
    fn from(err: OptimizerError) -> Self {
        match err {
            OptimizerError::Problem(inner) => inner.into(),
            other => FusionError::Solver(other.to_string()),
        }
    }
}
