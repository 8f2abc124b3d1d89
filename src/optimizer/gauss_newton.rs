//! Gauss-Newton optimization algorithm implementation
//!
//! Every step of the undamped system `H δ = b` is accepted. A system that cannot be
//! factorized ends the run with [`OptimizationStatus::NumericalFailure`], keeping the
//! estimates of the last completed iteration.

use std::sync::atomic::AtomicBool;
use std::time::Instant;
use tracing::{debug, warn};

use crate::core::Problem;
use crate::linalg::create_linear_solver;
use crate::optimizer::{
    OptimizationStatus, OptimizerResult, OptimizerType, Solver, SolverConfig, SolverSummary,
    gradient_norm, step_norm, stop_requested,
};

/// Gauss-Newton solver for nonlinear least squares optimization.
#[derive(Debug, Clone)]
pub struct GaussNewton {
    config: SolverConfig,
    min_step_norm: f64,
}

impl GaussNewton {
    /// Create a new Gauss-Newton solver with default configuration.
    pub fn new() -> Self {
        Self::with_config(SolverConfig::default())
    }

    /// Create a new Gauss-Newton solver with the given configuration.
    pub fn with_config(config: SolverConfig) -> Self {
        Self {
            config,
            min_step_norm: 1e-12,
        }
    }

    /// Set the minimum step size to avoid stagnation.
    pub fn with_min_step_norm(mut self, min_step_norm: f64) -> Self {
        self.min_step_norm = min_step_norm;
        self
    }
}

impl Default for GaussNewton {
    fn default() -> Self {
        Self::new()
    }
}

impl Solver for GaussNewton {
    fn minimize(
        &mut self,
        problem: &mut Problem,
        stop: Option<&AtomicBool>,
    ) -> OptimizerResult<SolverSummary> {
        let start_time = Instant::now();
        let mut linear_solver = create_linear_solver(self.config.linear_solver_type);

        let initial_cost = problem.total_cost()?;
        let mut current_cost = initial_cost;
        let mut final_gradient_norm = 0.0;
        let mut final_parameter_update_norm = 0.0;
        let mut iterations = 0;
        let mut status = OptimizationStatus::MaxIterationsReached;

        while iterations < self.config.max_iterations {
            if stop_requested(stop) {
                status = OptimizationStatus::Cancelled;
                break;
            }
            if let Some(timeout) = self.config.timeout
                && start_time.elapsed() >= timeout
            {
                status = OptimizationStatus::Timeout;
                break;
            }

            problem.linearize()?;
            let (system, layout) = problem.build_block_system()?;
            final_gradient_norm = gradient_norm(&system);
            if final_gradient_norm < self.config.gradient_tolerance {
                status = OptimizationStatus::GradientToleranceReached;
                break;
            }

            let (dx_p, dx_l) = match system.solve(0.0, linear_solver.as_mut()) {
                Ok(step) => step,
                Err(err) => {
                    warn!(iteration = iterations + 1, %err, "Gauss-Newton system not solvable");
                    status = OptimizationStatus::NumericalFailure;
                    break;
                }
            };
            iterations += 1;
            final_parameter_update_norm = step_norm(&dx_p, &dx_l);
            problem.apply_update(&layout, &dx_p, &dx_l)?;

            let new_cost = problem.total_cost()?;
            debug!(
                iteration = iterations,
                cost = new_cost,
                step_norm = final_parameter_update_norm,
                "Gauss-Newton step"
            );
            if !new_cost.is_finite() {
                status = OptimizationStatus::NumericalFailure;
                current_cost = new_cost;
                break;
            }
            let relative_change =
                ((current_cost - new_cost) / current_cost.max(f64::MIN_POSITIVE)).abs();
            current_cost = new_cost;

            if relative_change < self.config.cost_tolerance {
                status = OptimizationStatus::CostToleranceReached;
                break;
            }
            if final_parameter_update_norm < self.config.parameter_tolerance.max(self.min_step_norm)
            {
                status = OptimizationStatus::ParameterToleranceReached;
                break;
            }
        }

        let summary = SolverSummary {
            optimizer_type: OptimizerType::GaussNewton,
            status,
            initial_cost,
            final_cost: current_cost,
            iterations,
            successful_steps: iterations,
            unsuccessful_steps: 0,
            final_damping: None,
            final_gradient_norm,
            final_parameter_update_norm,
            total_time: start_time.elapsed(),
        };
        debug!("{summary}");
        Ok(summary)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::core::Vertex;
    use crate::factors::{BiasPriorFactor, Factor, RandomWalkFactor};
    use nalgebra::{Matrix3, Vector3};

    #[test]
    fn test_gauss_newton_creation() {
        let solver = GaussNewton::new();
        assert!(solver.min_step_norm > 0.0);
    }

    #[test]
    fn test_min_step_configuration() {
        let solver = GaussNewton::new().with_min_step_norm(1e-15);

        assert_eq!(solver.min_step_norm, 1e-15);
    }

    #[test]
    fn test_linear_problem_solved_in_one_step() {
        let mut problem = Problem::new();
        let a = problem.add_vertex(Vertex::AccBias(Vector3::zeros()));
        let b = problem.add_vertex(Vertex::AccBias(Vector3::new(1.0, 1.0, 1.0)));
        let walk = RandomWalkFactor::new(Matrix3::identity());
        problem.add_factor(Factor::AccRandomWalk(walk), &[a, b]).unwrap();
        let prior = BiasPriorFactor::new(Vector3::new(0.5, 0.0, -0.5), 1.0);
        problem.add_factor(Factor::PriorAccBias(prior), &[a]).unwrap();

        let config = SolverConfig::new()
            .with_optimizer_type(OptimizerType::GaussNewton)
            .with_max_iterations(5);
        let summary = GaussNewton::with_config(config).minimize(&mut problem, None).unwrap();
        assert!(summary.final_cost < 1e-20);
        assert!(summary.iterations <= 2);
        let estimate = problem.vertex(b).unwrap().as_vector3().unwrap();
        assert!((estimate - Vector3::new(0.5, 0.0, -0.5)).norm() < 1e-9);
    }

    #[test]
    fn test_singular_system_is_numerical_failure() {
        let mut problem = Problem::new();
        let a = problem.add_vertex(Vertex::GyroBias(Vector3::zeros()));
        let b = problem.add_vertex(Vertex::GyroBias(Vector3::new(1.0, 0.0, 0.0)));
        let walk = RandomWalkFactor::new(Matrix3::identity());
        problem.add_factor(Factor::GyroRandomWalk(walk), &[a, b]).unwrap();

        let summary = GaussNewton::new().minimize(&mut problem, None).unwrap();
        assert_eq!(summary.status, OptimizationStatus::NumericalFailure);
        assert_eq!(summary.iterations, 0);
    }
}
