//! Optimization drivers.
//!
//! A driver turns a snapshot of collaborator state into a [`Problem`], runs the solver in
//! one or more phases with outlier passes in between, and copies the converged estimates
//! into an outcome value. Drivers never hold references into the caller's map: everything
//! they read is copied in and everything they produce is returned.
//!
//! | Driver | Module |
//! |--------|--------|
//! | Global and local visual bundle adjustment | [`bundle_adjustment`] |
//! | Full inertial bundle adjustment, IMU initialization | [`inertial`] |
//! | Pose-only and pose-inertial tracking | [`pose`] |
//! | Essential graph (Sim3 and 4-DoF) | [`essential_graph`] |
//! | Two-view similarity | [`sim3`] |
//!
//! Every driver takes an optional stop flag. It is polled before each solver iteration
//! and between phases; once raised the driver returns [`DriverStatus::Cancelled`] and
//! nothing is handed back.

use nalgebra::Vector3;
use std::sync::atomic::AtomicBool;

use crate::core::{HuberLoss, ImuCamPose, Loss, Problem, VertexId};
use crate::error::{FusionError, FusionResult};
use crate::factors::{Factor, IcpFactor, MonoFactor, StereoFactor};
use crate::optimizer::{self, OptimizationStatus, SolverConfig, SolverSummary};

pub mod bundle_adjustment;
pub mod essential_graph;
pub mod inertial;
pub mod pose;
pub mod sim3;
pub mod snapshot;

pub use bundle_adjustment::{
    BundleAdjustmentConfig, GlobalBundleAdjustment, LocalBundleAdjustment,
    global_bundle_adjustment, local_bundle_adjustment,
};
pub use essential_graph::{
    CorrectedKeyFrame, EssentialGraphConfig, EssentialGraphOutcome, optimize_essential_graph,
    optimize_essential_graph_4dof,
};
pub use inertial::{
    FullInertialConfig, FullInertialOutcome, GravityScale, GyroBiasOutcome, InertialInitConfig,
    InertialInitOutcome, InertialKeyFrame, ScaleRefinementConfig, ScaleRefinementOutcome,
    estimate_gyro_bias, full_inertial_bundle_adjustment, inertial_initialization,
    refine_gravity_and_scale,
};
pub use pose::{
    InertialReference, PoseConfig, PoseInertialOutcome, PoseOutcome, ReferenceState,
    pose_icp_optimization, pose_inertial_icp_optimization, pose_inertial_optimization,
    pose_optimization,
};
pub use sim3::{Sim3Config, Sim3Outcome, optimize_sim3};
pub use snapshot::*;

/// 95% chi-square quantile with 2 degrees of freedom.
pub const CHI2_MONO: f64 = 5.991;
/// 95% chi-square quantile with 3 degrees of freedom.
pub const CHI2_STEREO: f64 = 7.815;
/// 95% chi-square quantile with 9 degrees of freedom.
pub const CHI2_INERTIAL: f64 = 16.92;

/// Result of a driver call.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverStatus<T> {
    /// The driver ran to the end and produced an outcome
    Completed(T),
    /// The stop flag was raised; no estimates are returned
    Cancelled,
}

impl<T> DriverStatus<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DriverStatus::Cancelled)
    }

    /// The outcome, `None` when cancelled.
    pub fn completed(self) -> Option<T> {
        match self {
            DriverStatus::Completed(outcome) => Some(outcome),
            DriverStatus::Cancelled => None,
        }
    }

    pub fn as_completed(&self) -> Option<&T> {
        match self {
            DriverStatus::Completed(outcome) => Some(outcome),
            DriverStatus::Cancelled => None,
        }
    }
}

/// Return `DriverStatus::Cancelled` from the enclosing driver when the flag is raised.
macro_rules! bail_if_stopped {
    ($stop:expr) => {
        if $crate::optimizer::stop_requested($stop) {
            tracing::debug!("stop flag raised, abandoning optimization");
            return Ok($crate::drivers::DriverStatus::Cancelled);
        }
    };
}
pub(crate) use bail_if_stopped;

/// Run `iterations` solver iterations with `config`.
///
/// `None` means the run was cancelled.
pub(crate) fn run_solver(
    problem: &mut Problem,
    config: &SolverConfig,
    iterations: usize,
    stop: Option<&AtomicBool>,
) -> FusionResult<Option<SolverSummary>> {
    let config = config.clone().with_max_iterations(iterations);
    let summary = optimizer::minimize(problem, &config, stop)?;
    if summary.status == OptimizationStatus::Cancelled {
        return Ok(None);
    }
    Ok(Some(summary))
}

/// Huber kernel with threshold `sqrt(chi2)`.
pub(crate) fn huber(chi2: f64) -> FusionResult<Box<dyn Loss>> {
    Ok(Box::new(HuberLoss::new(chi2.sqrt())?))
}

/// Reprojection factor of one observation of a map point by a pose vertex.
///
/// Stereo observations need a rig with `bf`; otherwise they fall back to the monocular
/// factor.
pub(crate) fn observation_factor(observation: &snapshot::Observation, stereo_rig: bool) -> Factor {
    match observation.right_u {
        Some(right_u) if stereo_rig => Factor::Stereo(StereoFactor::new(
            Vector3::new(observation.pixel.x, observation.pixel.y, right_u),
            observation.camera,
            observation.inv_sigma2,
        )),
        _ => Factor::Mono(MonoFactor::new(
            observation.pixel,
            observation.camera,
            observation.inv_sigma2,
        )),
    }
}

/// Chi-square threshold of `factor` out of a (mono, stereo) pair.
pub(crate) fn threshold_for(factor: &Factor, mono: f64, stereo: f64) -> f64 {
    if factor.dimension() == 3 { stereo } else { mono }
}

/// Add one ICP factor per registration link, `pose_vertex` resolving each keyframe.
pub(crate) fn add_icp_factors(
    problem: &mut Problem,
    links: &[snapshot::IcpLink],
    pose_vertex: impl Fn(snapshot::KeyFrameId) -> FusionResult<VertexId>,
) -> FusionResult<usize> {
    for link in links {
        let from = pose_vertex(link.from)?;
        let to = pose_vertex(link.to)?;
        problem.add_factor(
            Factor::Icp(IcpFactor::new(link.t_12, link.information)),
            &[from, to],
        )?;
    }
    Ok(links.len())
}

/// IMU-camera pose held by vertex `id`.
pub(crate) fn pose_of(problem: &Problem, id: VertexId) -> FusionResult<&ImuCamPose> {
    problem
        .vertex(id)?
        .as_pose()
        .ok_or_else(|| FusionError::InvalidInput(format!("vertex {id} is not a pose")))
}

/// 3-vector held by vertex `id` (point, velocity or bias).
pub(crate) fn vector_of(problem: &Problem, id: VertexId) -> FusionResult<Vector3<f64>> {
    problem
        .vertex(id)?
        .as_vector3()
        .copied()
        .ok_or_else(|| FusionError::InvalidInput(format!("vertex {id} is not a 3-vector")))
}

/// Whether the point of vertex `point` lies in front of camera `cam` of vertex `pose`.
pub(crate) fn depth_positive(
    problem: &Problem,
    point: VertexId,
    pose: VertexId,
    cam: usize,
) -> FusionResult<bool> {
    let xw = vector_of(problem, point)?;
    Ok(pose_of(problem, pose)?.is_depth_positive(&xw, cam))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use nalgebra::Vector2;

    #[test]
    fn test_driver_status_accessors() {
        let done = DriverStatus::Completed(3);
        assert!(!done.is_cancelled());
        assert_eq!(done.as_completed(), Some(&3));
        assert_eq!(done.completed(), Some(3));
        let cancelled: DriverStatus<i32> = DriverStatus::Cancelled;
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.completed(), None);
    }

    #[test]
    fn test_observation_factor_kind() {
        let mut observation = snapshot::Observation::mono(4, Vector2::new(10.0, 20.0), 0, 1.0);
        assert_eq!(observation_factor(&observation, true).name(), "Mono");
        observation.right_u = Some(5.0);
        assert_eq!(observation_factor(&observation, true).name(), "Stereo");
        assert_eq!(observation_factor(&observation, false).name(), "Mono");
        let stereo = observation_factor(&observation, true);
        assert_eq!(threshold_for(&stereo, CHI2_MONO, CHI2_STEREO), CHI2_STEREO);
    }
}
