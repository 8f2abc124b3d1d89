//! Two-view similarity refinement for loop and merge candidates.

use nalgebra::SMatrix;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use tracing::{info, warn};

use super::snapshot::Sim3Alignment;
use super::{DriverStatus, bail_if_stopped, huber, run_solver};
use crate::core::{FactorId, Problem, Vertex};
use crate::error::{FusionError, FusionResult};
use crate::factors::{Factor, SimilarityProjectionFactor};
use crate::manifold::Sim3;
use crate::optimizer::{SolverConfig, SolverSummary};

/// Minimum number of correspondences surviving the outlier pass.
const MIN_INLIERS: usize = 10;

/// Configuration of [`optimize_sim3`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sim3Config {
    /// Chi-square threshold of each projection, also the squared Huber delta
    pub th2: f64,
    /// Hold the scale (stereo and RGB-D maps)
    pub fix_scale: bool,
    /// Iterations before the outlier pass
    pub iterations: usize,
    pub solver: SolverConfig,
}

impl Default for Sim3Config {
    fn default() -> Self {
        Self {
            th2: 10.0,
            fix_scale: false,
            iterations: 5,
            solver: SolverConfig::default(),
        }
    }
}

impl Sim3Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_th2(mut self, th2: f64) -> Self {
        self.th2 = th2;
        self
    }

    pub fn with_fix_scale(mut self, fix_scale: bool) -> Self {
        self.fix_scale = fix_scale;
        self
    }

    pub fn with_solver(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }
}

/// Outcome of [`optimize_sim3`].
#[derive(Debug, Clone)]
pub struct Sim3Outcome {
    pub s12: Sim3,
    /// Inlier flag per match
    pub inliers: Vec<bool>,
    /// 0 when too few matches survived the outlier pass
    pub num_inliers: usize,
    /// Hessian of `S12` over the inlier projections; the scale row and column are zero
    /// when the scale is fixed
    pub information: SMatrix<f64, 7, 7>,
    pub summary: Option<SolverSummary>,
}

impl Sim3Outcome {
    fn rejected(alignment: &Sim3Alignment, summary: Option<SolverSummary>) -> Self {
        Self {
            s12: alignment.s12,
            inliers: vec![false; alignment.matches.len()],
            num_inliers: 0,
            information: SMatrix::zeros(),
            summary,
        }
    }
}

/// Refine `S12` from matched points projected into both cameras.
pub fn optimize_sim3(
    alignment: &Sim3Alignment,
    config: &Sim3Config,
    stop: Option<&AtomicBool>,
) -> FusionResult<DriverStatus<Sim3Outcome>> {
    bail_if_stopped!(stop);
    let mut problem = Problem::new();
    let s12 = problem.add_vertex(Vertex::Sim3 {
        estimate: alignment.s12,
        fix_scale: config.fix_scale,
    });

    let mut pairs: Vec<(FactorId, FactorId)> = Vec::with_capacity(alignment.matches.len());
    for m in &alignment.matches {
        let forward = problem.add_factor(
            Factor::SimilarityProjection(SimilarityProjectionFactor::forward(
                m.pixel1,
                m.point2,
                alignment.camera1,
                m.inv_sigma2_1,
            )),
            &[s12],
        )?;
        let inverse = problem.add_factor(
            Factor::SimilarityProjection(SimilarityProjectionFactor::inverse(
                m.pixel2,
                m.point1,
                alignment.camera2,
                m.inv_sigma2_2,
            )),
            &[s12],
        )?;
        problem.set_robust(forward, Some(huber(config.th2)?))?;
        problem.set_robust(inverse, Some(huber(config.th2)?))?;
        pairs.push((forward, inverse));
    }

    let Some(first) = run_solver(&mut problem, &config.solver, config.iterations, stop)? else {
        return Ok(DriverStatus::Cancelled);
    };
    bail_if_stopped!(stop);

    let mut inliers = vec![true; pairs.len()];
    let num_bad = reject_outliers(&mut problem, &pairs, &mut inliers, config.th2)?;
    let remaining = pairs.len() - num_bad;
    if remaining < MIN_INLIERS {
        warn!(remaining, "too few correspondences after the outlier pass");
        return Ok(DriverStatus::Completed(Sim3Outcome::rejected(alignment, Some(first))));
    }

    let more = if num_bad > 0 { 2 * config.iterations } else { config.iterations };
    let Some(summary) = run_solver(&mut problem, &config.solver, more, stop)? else {
        return Ok(DriverStatus::Cancelled);
    };
    bail_if_stopped!(stop);

    let num_bad = reject_outliers(&mut problem, &pairs, &mut inliers, config.th2)?;
    let num_inliers = pairs.len() - num_bad;

    problem.linearize()?;
    let h = problem.joint_hessian(&[s12])?;
    let mut information = SMatrix::<f64, 7, 7>::zeros();
    information
        .view_mut((0, 0), h.shape())
        .copy_from(&h);

    let estimate = problem
        .vertex(s12)?
        .as_sim3()
        .copied()
        .ok_or_else(|| FusionError::InvalidInput(format!("vertex {s12} is not a similarity")))?;

    info!(
        matches = pairs.len(),
        num_inliers,
        scale = estimate.scale,
        "two-view similarity refined"
    );
    Ok(DriverStatus::Completed(Sim3Outcome {
        s12: estimate,
        inliers,
        num_inliers,
        information,
        summary: Some(summary),
    }))
}

/// Deactivate both projections of every active pair where either exceeds `th2`.
///
/// Returns the number of rejected pairs so far.
fn reject_outliers(
    problem: &mut Problem,
    pairs: &[(FactorId, FactorId)],
    inliers: &mut [bool],
    th2: f64,
) -> FusionResult<usize> {
    let mut num_bad = 0;
    for (k, &(forward, inverse)) in pairs.iter().enumerate() {
        if !inliers[k] {
            num_bad += 1;
            continue;
        }
        if problem.chi2(forward)? > th2 || problem.chi2(inverse)? > th2 {
            problem.set_active(forward, false)?;
            problem.set_active(inverse, false)?;
            inliers[k] = false;
            num_bad += 1;
        }
    }
    Ok(num_bad)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::drivers::snapshot::Sim3Match;
    use crate::manifold::{LieGroup, so3};
    use crate::sensors::PinholeCamera;
    use nalgebra::Vector3;

    fn alignment(truth: &Sim3, guess: Sim3, count: usize) -> Sim3Alignment {
        let camera = PinholeCamera::new(500.0, 500.0, 320.0, 240.0);
        let matches = (0..count)
            .map(|k| {
                let f = k as f64;
                let point2 = Vector3::new((f * 0.9).sin(), (f * 0.5).cos() * 0.8, 3.0 + (f * 0.3).sin());
                let point1 = truth.act(&point2);
                Sim3Match {
                    point1,
                    point2,
                    pixel1: camera.project(&point1),
                    pixel2: camera.project(&point2),
                    inv_sigma2_1: 1.0,
                    inv_sigma2_2: 1.0,
                }
            })
            .collect();
        Sim3Alignment {
            camera1: camera,
            camera2: camera,
            matches,
            s12: guess,
        }
    }

    fn truth() -> Sim3 {
        Sim3::new(so3::exp(&Vector3::new(0.05, -0.1, 0.02)), Vector3::new(0.2, -0.1, 0.3), 1.5)
    }

    #[test]
    fn test_sim3_recovers_scale() {
        let truth = truth();
        let guess = Sim3::new(truth.rotation, truth.translation + Vector3::new(0.02, 0.0, 0.0), 1.4);
        let mut input = alignment(&truth, guess, 30);
        input.matches[4].pixel1.x += 60.0;

        let outcome = optimize_sim3(&input, &Sim3Config::default(), None)
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(outcome.num_inliers, 29);
        assert!(!outcome.inliers[4]);
        assert!((outcome.s12.scale - 1.5).abs() < 1e-4);
        let eigen = outcome.information.symmetric_eigen();
        assert!(eigen.eigenvalues.iter().all(|&v| v > 0.0));
    }

    #[test]
    fn test_sim3_with_too_few_matches_is_rejected() {
        let truth = truth();
        let outcome = optimize_sim3(&alignment(&truth, truth, 8), &Sim3Config::default(), None)
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(outcome.num_inliers, 0);
        assert_eq!(outcome.s12, truth);
        assert_eq!(outcome.information, SMatrix::<f64, 7, 7>::zeros());
    }

    #[test]
    fn test_fixed_scale_leaves_scale_row_empty() {
        let truth = Sim3::from_se3(&crate::manifold::SE3::identity());
        let config = Sim3Config::new().with_fix_scale(true);
        let outcome = optimize_sim3(&alignment(&truth, truth, 20), &config, None)
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(outcome.num_inliers, 20);
        assert_eq!(outcome.s12.scale, 1.0);
        assert_eq!(outcome.information[(6, 6)], 0.0);
    }
}
