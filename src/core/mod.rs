//! Core optimization components.
//!
//! This module contains the building blocks of the per-call factor graph:
//! - Parameter blocks (vertices) and their manifold updates
//! - The IMU-camera pose state shared by all visual and inertial factors
//! - Robust loss functions
//! - The [`problem::Problem`] arena that owns vertices and factors and assembles the
//!   normal equations

use thiserror::Error;

pub mod loss_functions;
pub mod pose;
pub mod problem;
pub mod variable;

pub use loss_functions::{CauchyLoss, HuberLoss, Loss};
pub use pose::ImuCamPose;
pub use problem::Problem;
pub use variable::{FactorId, GravityDirection, InvDepthPoint, Vertex, VertexId, VertexKind};

/// Errors raised while building or evaluating a factor graph.
#[derive(Debug, Clone, Error)]
pub enum ProblemError {
    /// A factor was wired to a vertex of the wrong kind
    #[error("Vertex kind mismatch for {factor}: expected {expected:?}, found {found:?}")]
    VertexMismatch {
        factor: &'static str,
        expected: VertexKind,
        found: VertexKind,
    },

    /// A handle does not refer to a vertex of this problem
    #[error("Unknown vertex {0}")]
    UnknownVertex(usize),

    /// A handle does not refer to a factor of this problem
    #[error("Unknown factor {0}")]
    UnknownFactor(usize),

    /// A Hessian was requested before the factor was linearized
    #[error("Factor {0} has not been linearized")]
    NotLinearized(usize),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for factor graph operations
pub type ProblemResult<T> = Result<T, ProblemError>;
