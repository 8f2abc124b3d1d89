//! Levenberg-Marquardt algorithm implementation.
//!
//! The damped system `(H + λI) δ = b` is solved with the marginalized blocks eliminated by
//! Schur complement, λ being added to every diagonal entry. The step quality is
//!
//! ```text
//! ρ = (F(x) - F(x ⊞ δ)) / δᵀ(λδ + b)
//! ```
//!
//! A step with `ρ > 0` is accepted, and λ shrinks when `ρ` exceeds the good-step
//! threshold. A rejected step is undone and λ grows; up to `max_trials` damped systems
//! are tried per iteration. A failed factorization counts as a rejection.

use std::sync::atomic::AtomicBool;
use std::time::Instant;
use tracing::{debug, warn};

use crate::core::Problem;
use crate::linalg::create_linear_solver;
use crate::optimizer::{
    OptimizationStatus, OptimizerError, OptimizerResult, OptimizerType, Solver, SolverConfig,
    SolverSummary, gradient_norm, step_norm, stop_requested,
};

/// Levenberg-Marquardt solver for nonlinear least squares optimization.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardt {
    config: SolverConfig,
    initial_damping_factor: f64,
    damping_min: f64,
    damping_max: f64,
    damping_increase_factor: f64,
    damping_decrease_factor: f64,
    good_step_quality: f64,
    max_trials: usize,
}

impl LevenbergMarquardt {
    /// Create a new Levenberg-Marquardt solver with default configuration.
    pub fn new() -> Self {
        Self::with_config(SolverConfig::default())
    }

    /// Create a new Levenberg-Marquardt solver with the given configuration.
    pub fn with_config(config: SolverConfig) -> Self {
        Self {
            config,
            initial_damping_factor: 1e-5,
            damping_min: 1e-12,
            damping_max: 1e12,
            damping_increase_factor: 10.0,
            damping_decrease_factor: 0.3,
            good_step_quality: 0.75,
            max_trials: 10,
        }
    }

    /// Set the initial damping as a fraction of the largest Hessian diagonal entry.
    pub fn with_initial_damping_factor(mut self, factor: f64) -> Self {
        self.initial_damping_factor = factor;
        self
    }

    /// Set the damping parameter bounds.
    pub fn with_damping_bounds(mut self, min: f64, max: f64) -> Self {
        self.damping_min = min;
        self.damping_max = max;
        self
    }

    /// Set the damping adjustment factors.
    pub fn with_damping_factors(mut self, increase: f64, decrease: f64) -> Self {
        self.damping_increase_factor = increase;
        self.damping_decrease_factor = decrease;
        self
    }

    /// Set the number of damped systems tried per iteration.
    pub fn with_max_trials(mut self, max_trials: usize) -> Self {
        self.max_trials = max_trials;
        self
    }

    fn increase_damping(&self, damping: f64) -> f64 {
        (damping * self.damping_increase_factor).min(self.damping_max)
    }

    /// Damping after an accepted step of quality `rho`.
    fn decrease_damping(&self, damping: f64, rho: f64) -> f64 {
        if rho > self.good_step_quality {
            (damping * self.damping_decrease_factor).max(self.damping_min)
        } else {
            damping
        }
    }

    /// Compute step quality ratio (actual vs predicted reduction)
    fn compute_step_quality(current_cost: f64, new_cost: f64, predicted_reduction: f64) -> f64 {
        let actual_reduction = current_cost - new_cost;
        if predicted_reduction.abs() < 1e-15 {
            if actual_reduction > 0.0 { 1.0 } else { 0.0 }
        } else {
            actual_reduction / predicted_reduction
        }
    }

    fn validate(&self) -> OptimizerResult<()> {
        if self.max_trials == 0 {
            return Err(OptimizerError::InvalidConfig(
                "Levenberg-Marquardt needs at least one trial per iteration".to_string(),
            ));
        }
        if !(self.damping_increase_factor > 1.0 && self.damping_decrease_factor < 1.0) {
            return Err(OptimizerError::InvalidConfig(format!(
                "damping factors must grow and shrink, got {} and {}",
                self.damping_increase_factor, self.damping_decrease_factor
            )));
        }
        Ok(())
    }
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self::new()
    }
}

impl Solver for LevenbergMarquardt {
    fn minimize(
        &mut self,
        problem: &mut Problem,
        stop: Option<&AtomicBool>,
    ) -> OptimizerResult<SolverSummary> {
        self.validate()?;
        let start_time = Instant::now();
        let mut linear_solver = create_linear_solver(self.config.linear_solver_type);

        let initial_cost = problem.total_cost()?;
        let mut current_cost = initial_cost;
        let mut damping: Option<f64> = None;
        let mut successful_steps = 0;
        let mut unsuccessful_steps = 0;
        let mut final_gradient_norm = 0.0;
        let mut final_parameter_update_norm = 0.0;
        let mut iterations = 0;
        let mut status = OptimizationStatus::MaxIterationsReached;

        debug!(
            initial_cost,
            max_iterations = self.config.max_iterations,
            vertices = problem.num_vertices(),
            factors = problem.num_factors(),
            "starting Levenberg-Marquardt"
        );

        'outer: while iterations < self.config.max_iterations {
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

            let mut lambda = damping.unwrap_or_else(|| {
                (self.initial_damping_factor * system.max_diagonal()).max(self.damping_min)
            });
            let backup = problem.backup();
            iterations += 1;

            for _ in 0..self.max_trials {
                let (dx_p, dx_l) = match system.solve(lambda, linear_solver.as_mut()) {
                    Ok(step) => step,
                    Err(err) => {
                        warn!(iteration = iterations, damping = lambda, %err, "damped system not solvable");
                        unsuccessful_steps += 1;
                        lambda = self.increase_damping(lambda);
                        continue;
                    }
                };

                let predicted_reduction = dx_p.dot(&(&dx_p * lambda + &system.b_p))
                    + dx_l
                        .iter()
                        .zip(&system.landmarks)
                        .map(|(dx, block)| dx.dot(&(dx * lambda + &block.b_l)))
                        .sum::<f64>();
                final_parameter_update_norm = step_norm(&dx_p, &dx_l);

                problem.apply_update(&layout, &dx_p, &dx_l)?;
                let new_cost = problem.total_cost()?;
                let rho = Self::compute_step_quality(current_cost, new_cost, predicted_reduction);

                if new_cost.is_finite() && rho > 0.0 {
                    let relative_change = (current_cost - new_cost) / current_cost.max(f64::MIN_POSITIVE);
                    debug!(
                        iteration = iterations,
                        cost = new_cost,
                        damping = lambda,
                        step_norm = final_parameter_update_norm,
                        rho,
                        "step accepted"
                    );
                    current_cost = new_cost;
                    successful_steps += 1;
                    damping = Some(self.decrease_damping(lambda, rho));

                    if relative_change < self.config.cost_tolerance {
                        status = OptimizationStatus::CostToleranceReached;
                        break 'outer;
                    }
                    if final_parameter_update_norm < self.config.parameter_tolerance {
                        status = OptimizationStatus::ParameterToleranceReached;
                        break 'outer;
                    }
                    continue 'outer;
                }

                debug!(
                    iteration = iterations,
                    cost = new_cost,
                    damping = lambda,
                    rho,
                    "step rejected"
                );
                problem.restore(&backup);
                unsuccessful_steps += 1;
                lambda = self.increase_damping(lambda);
            }

            // no trial lowered the cost
            damping = Some(lambda);
            status = OptimizationStatus::Converged;
            break;
        }

        let summary = SolverSummary {
            optimizer_type: OptimizerType::LevenbergMarquardt,
            status,
            initial_cost,
            final_cost: current_cost,
            iterations,
            successful_steps,
            unsuccessful_steps,
            final_damping: damping,
            final_gradient_norm,
            final_parameter_update_norm,
            total_time: start_time.elapsed(),
        };
        debug!("{summary}");
        Ok(summary)
    }
}
