//! Iterative solvers for the factor graph.
//!
//! This module provides the two nonlinear least squares algorithms used by the drivers:
//! - Levenberg-Marquardt algorithm (default)
//! - Gauss-Newton algorithm
//!
//! Both solvers run on a [`Problem`]: every iteration linearizes the active factors,
//! assembles the robustly weighted normal equations, eliminates the marginalized blocks by
//! Schur complement and applies the solved step on the manifold. A caller-supplied
//! [`AtomicBool`] is polled before each iteration and ends the run with
//! [`OptimizationStatus::Cancelled`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::core::{Problem, ProblemError};
use crate::linalg::LinearSolverType;

pub mod gauss_newton;
pub mod levenberg_marquardt;

pub use gauss_newton::GaussNewton;
pub use levenberg_marquardt::LevenbergMarquardt;

/// Type of optimization solver algorithm to use
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerType {
    /// Levenberg-Marquardt algorithm (robust, adaptive damping)
    #[default]
    LevenbergMarquardt,
    /// Gauss-Newton algorithm (fast convergence, may be unstable)
    GaussNewton,
}

impl fmt::Display for OptimizerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerType::LevenbergMarquardt => write!(f, "Levenberg-Marquardt"),
            OptimizerType::GaussNewton => write!(f, "Gauss-Newton"),
        }
    }
}

/// Solver configuration shared by both algorithms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Type of optimizer algorithm to use
    pub optimizer_type: OptimizerType,
    /// Type of linear solver for the reduced system
    pub linear_solver_type: LinearSolverType,
    /// Maximum number of iterations
    pub max_iterations: usize,
    /// Relative cost decrease below which the run stops
    pub cost_tolerance: f64,
    /// Step norm below which the run stops
    pub parameter_tolerance: f64,
    /// Gradient norm below which the run stops
    pub gradient_tolerance: f64,
    /// Timeout duration
    pub timeout: Option<Duration>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            optimizer_type: OptimizerType::default(),
            linear_solver_type: LinearSolverType::default(),
            max_iterations: 10,
            cost_tolerance: 1e-12,
            parameter_tolerance: 1e-12,
            gradient_tolerance: 1e-12,
            timeout: None,
        }
    }
}

impl SolverConfig {
    /// Create a new solver configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the optimizer algorithm type
    pub fn with_optimizer_type(mut self, optimizer_type: OptimizerType) -> Self {
        self.optimizer_type = optimizer_type;
        self
    }

    /// Set the linear solver type
    pub fn with_linear_solver_type(mut self, linear_solver_type: LinearSolverType) -> Self {
        self.linear_solver_type = linear_solver_type;
        self
    }

    /// Set the maximum number of iterations
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the cost tolerance
    pub fn with_cost_tolerance(mut self, cost_tolerance: f64) -> Self {
        self.cost_tolerance = cost_tolerance;
        self
    }

    /// Set the parameter tolerance
    pub fn with_parameter_tolerance(mut self, parameter_tolerance: f64) -> Self {
        self.parameter_tolerance = parameter_tolerance;
        self
    }

    /// Set the gradient tolerance
    pub fn with_gradient_tolerance(mut self, gradient_tolerance: f64) -> Self {
        self.gradient_tolerance = gradient_tolerance;
        self
    }

    /// Set the timeout duration
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Status of an optimization process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationStatus {
    /// No step could lower the cost any further
    Converged,
    /// Maximum number of iterations reached
    MaxIterationsReached,
    /// Cost function tolerance reached
    CostToleranceReached,
    /// Parameter tolerance reached
    ParameterToleranceReached,
    /// Gradient tolerance reached
    GradientToleranceReached,
    /// The linear system could not be solved
    NumericalFailure,
    /// The stop flag was raised
    Cancelled,
    /// Timeout reached
    Timeout,
}

impl OptimizationStatus {
    /// Whether the estimates are usable.
    pub fn is_success(&self) -> bool {
        !matches!(
            self,
            OptimizationStatus::NumericalFailure | OptimizationStatus::Cancelled
        )
    }
}

impl fmt::Display for OptimizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStatus::Converged => write!(f, "Converged"),
            OptimizationStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            OptimizationStatus::CostToleranceReached => write!(f, "Cost tolerance reached"),
            OptimizationStatus::ParameterToleranceReached => {
                write!(f, "Parameter tolerance reached")
            }
            OptimizationStatus::GradientToleranceReached => write!(f, "Gradient tolerance reached"),
            OptimizationStatus::NumericalFailure => write!(f, "Numerical failure"),
            OptimizationStatus::Cancelled => write!(f, "Cancelled"),
            OptimizationStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

/// Summary statistics of one solver run.
#[derive(Debug, Clone)]
pub struct SolverSummary {
    pub optimizer_type: OptimizerType,
    pub status: OptimizationStatus,
    /// Cost `Σ ρ(χ²)` before the first iteration
    pub initial_cost: f64,
    pub final_cost: f64,
    /// Number of iterations performed
    pub iterations: usize,
    /// Number of accepted steps
    pub successful_steps: usize,
    /// Number of rejected steps
    pub unsuccessful_steps: usize,
    /// Damping at exit, `None` for Gauss-Newton
    pub final_damping: Option<f64>,
    pub final_gradient_norm: f64,
    pub final_parameter_update_norm: f64,
    /// Total time elapsed
    pub total_time: Duration,
}

impl fmt::Display for SolverSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== {} Optimization Summary ===", self.optimizer_type)?;
        writeln!(f, "Status:                    {}", self.status)?;
        writeln!(f, "Initial cost:              {:.6e}", self.initial_cost)?;
        writeln!(f, "Final cost:                {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "Cost reduction:            {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            100.0 * (self.initial_cost - self.final_cost) / self.initial_cost.max(1e-12)
        )?;
        writeln!(f, "Total iterations:          {}", self.iterations)?;
        writeln!(f, "Successful steps:          {}", self.successful_steps)?;
        writeln!(f, "Unsuccessful steps:        {}", self.unsuccessful_steps)?;
        if let Some(damping) = self.final_damping {
            writeln!(f, "Final damping parameter:   {damping:.6e}")?;
        }
        writeln!(
            f,
            "Final gradient norm:       {:.6e}",
            self.final_gradient_norm
        )?;
        writeln!(
            f,
            "Final param update norm:   {:.6e}",
            self.final_parameter_update_norm
        )?;
        writeln!(f, "Total time:                {:?}", self.total_time)?;
        Ok(())
    }
}

/// Errors raised by the solvers.
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// The factor graph could not be evaluated
    #[error(transparent)]
    Problem(#[from] ProblemError),

    /// Invalid solver configuration
    #[error("Invalid solver configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for solver runs
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Core trait for optimization solvers.
pub trait Solver {
    /// Minimize the cost of `problem` in place.
    ///
    /// The estimates held by `problem` are updated; rejected steps are undone before the
    /// call returns.
    fn minimize(
        &mut self,
        problem: &mut Problem,
        stop: Option<&AtomicBool>,
    ) -> OptimizerResult<SolverSummary>;
}

/// Run the solver selected by `config.optimizer_type`.
pub fn minimize(
    problem: &mut Problem,
    config: &SolverConfig,
    stop: Option<&AtomicBool>,
) -> OptimizerResult<SolverSummary> {
    match config.optimizer_type {
        OptimizerType::LevenbergMarquardt => {
            LevenbergMarquardt::with_config(config.clone()).minimize(problem, stop)
        }
        OptimizerType::GaussNewton => GaussNewton::with_config(config.clone()).minimize(problem, stop),
    }
}

/// Whether the stop flag has been raised.
pub fn stop_requested(stop: Option<&AtomicBool>) -> bool {
    stop.is_some_and(|flag| flag.load(Ordering::Relaxed))
}

/// Norm of the full right-hand side `[b_p; b_l]`.
pub(crate) fn gradient_norm(system: &crate::linalg::BlockSystem) -> f64 {
    let landmarks: f64 = system
        .landmarks
        .iter()
        .map(|l| l.b_l.norm_squared())
        .sum();
    (system.b_p.norm_squared() + landmarks).sqrt()
}

/// Norm of the full step `[δp; δl]`.
pub(crate) fn step_norm(dx_p: &nalgebra::DVector<f64>, dx_l: &[nalgebra::DVector<f64>]) -> f64 {
    let landmarks: f64 = dx_l.iter().map(|d| d.norm_squared()).sum();
    (dx_p.norm_squared() + landmarks).sqrt()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = SolverConfig::new()
            .with_optimizer_type(OptimizerType::GaussNewton)
            .with_max_iterations(25)
            .with_cost_tolerance(1e-6)
            .with_timeout(Duration::from_millis(10));
        assert_eq!(config.optimizer_type, OptimizerType::GaussNewton);
        assert_eq!(config.max_iterations, 25);
        assert_eq!(config.cost_tolerance, 1e-6);
        assert_eq!(config.timeout, Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_stop_flag() {
        let flag = AtomicBool::new(false);
        assert!(!stop_requested(None));
        assert!(!stop_requested(Some(&flag)));
        flag.store(true, Ordering::Relaxed);
        assert!(stop_requested(Some(&flag)));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(OptimizationStatus::Cancelled.to_string(), "Cancelled");
        assert!(!OptimizationStatus::NumericalFailure.is_success());
        assert!(OptimizationStatus::MaxIterationsReached.is_success());
        assert_eq!(OptimizerType::GaussNewton.to_string(), "Gauss-Newton");
    }
}
