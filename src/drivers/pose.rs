//! Pose-only tracking of the current frame.
//!
//! Map points are held and only the frame state moves. Observations are re-classified
//! after every round: those above the round threshold are switched off for the next
//! round and may come back once the pose has improved. The ICP variants add the scan
//! registration against the previous frame as a relative-pose factor.

use nalgebra::{SMatrix, Vector3};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::{debug, info, warn};

use super::snapshot::{FrameObservation, FrameSnapshot, IcpMeasurement};
use super::{
    CHI2_MONO, CHI2_STEREO, DriverStatus, bail_if_stopped, huber, pose_of, run_solver,
    threshold_for, vector_of,
};
use crate::core::{FactorId, ImuCamPose, Problem, Vertex, VertexId};
use crate::error::{FusionError, FusionResult};
use crate::factors::{
    Factor, IcpFactor, InertialFactor, LidarPointToPlaneFactor, MonoOnlyPoseFactor, PoseImuPrior,
    PosePrior, RandomWalkFactor, StereoOnlyPoseFactor,
};
use crate::linalg::marginalize;
use crate::manifold::SE3;
use crate::optimizer::{SolverConfig, SolverSummary};
use crate::sensors::{ImuBias, RigCalibration};

/// Configuration of the pose-only drivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseConfig {
    /// Solver iterations per round
    pub iterations: usize,
    /// Mono chi-square threshold of each round
    pub chi2_mono: [f64; 4],
    /// Stereo chi-square threshold of each round
    pub chi2_stereo: [f64; 4],
    /// Index of the last round run with Huber kernels
    pub last_robust_round: usize,
    /// Stop early when fewer observations remain active
    pub min_active: usize,
    /// Below this many inliers the pose-inertial driver re-counts with the relaxed thresholds
    pub min_inliers: usize,
    /// Relaxed (mono, stereo) thresholds of the final re-count
    pub relaxed_chi2: (f64, f64),
    pub solver: SolverConfig,
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            chi2_mono: [CHI2_MONO; 4],
            chi2_stereo: [CHI2_STEREO; 4],
            last_robust_round: 2,
            min_active: 10,
            min_inliers: 30,
            relaxed_chi2: (18.0, 24.0),
            solver: SolverConfig::default(),
        }
    }
}

impl PoseConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Thresholds used when the frame is tied to an IMU reference, loose in early rounds.
    pub fn inertial() -> Self {
        Self {
            chi2_mono: [12.0, 7.5, CHI2_MONO, CHI2_MONO],
            chi2_stereo: [15.6, 9.8, CHI2_STEREO, CHI2_STEREO],
            ..Self::default()
        }
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_thresholds(mut self, chi2_mono: [f64; 4], chi2_stereo: [f64; 4]) -> Self {
        self.chi2_mono = chi2_mono;
        self.chi2_stereo = chi2_stereo;
        self
    }

    pub fn with_min_active(mut self, min_active: usize) -> Self {
        self.min_active = min_active;
        self
    }

    pub fn with_solver(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }
}

/// Outcome of [`pose_optimization`].
#[derive(Debug, Clone)]
pub struct PoseOutcome {
    pub t_wb: SE3,
    /// Inlier flag per observation of the frame
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
    /// Summary of the last solver round, `None` when too few correspondences were given
    pub summary: Option<SolverSummary>,
}

/// Pose, velocity and biases of the frame the current one is tied to.
#[derive(Debug, Clone)]
pub struct ReferenceState {
    pub t_wb: SE3,
    pub velocity: Vector3<f64>,
    pub bias: ImuBias,
    pub rig: Arc<RigCalibration>,
}

/// Inertial reference of the current frame.
#[derive(Debug, Clone)]
pub enum InertialReference {
    /// The last keyframe, held fixed
    KeyFrame(ReferenceState),
    /// The previous frame, optimized under the prior it was left with
    Frame {
        state: ReferenceState,
        prior: PoseImuPrior,
    },
}

impl InertialReference {
    pub fn state(&self) -> &ReferenceState {
        match self {
            InertialReference::KeyFrame(state) => state,
            InertialReference::Frame { state, .. } => state,
        }
    }
}

/// Outcome of [`pose_inertial_optimization`].
#[derive(Debug, Clone)]
pub struct PoseInertialOutcome {
    pub t_wb: SE3,
    pub velocity: Vector3<f64>,
    pub bias: ImuBias,
    pub inliers: Vec<bool>,
    pub num_inliers: usize,
    /// Prior on the frame state for tracking the next frame
    pub prior: PoseImuPrior,
    pub summary: SolverSummary,
}

/// Only-pose reprojection factor of one matched map point.
fn only_pose_factor(matched: &FrameObservation, stereo_rig: bool) -> Factor {
    let observation = &matched.observation;
    match observation.right_u {
        Some(right_u) if stereo_rig => Factor::StereoOnlyPose(StereoOnlyPoseFactor::new(
            Vector3::new(observation.pixel.x, observation.pixel.y, right_u),
            matched.point,
            observation.camera,
            observation.inv_sigma2,
        )),
        _ => Factor::MonoOnlyPose(MonoOnlyPoseFactor::new(
            observation.pixel,
            matched.point,
            observation.camera,
            observation.inv_sigma2,
        )),
    }
}

fn is_depth_positive(factor: &Factor, pose: &ImuCamPose) -> bool {
    match factor {
        Factor::MonoOnlyPose(f) => f.is_depth_positive(pose),
        Factor::StereoOnlyPose(f) => f.is_depth_positive(pose),
        _ => true,
    }
}

/// Add one robust only-pose factor per observation and the optional lidar and prior terms.
fn add_frame_factors(
    problem: &mut Problem,
    frame: &FrameSnapshot,
    pose: VertexId,
    config: &PoseConfig,
) -> FusionResult<Vec<FactorId>> {
    let stereo_rig = frame.rig.bf.is_some();
    let mut edges = Vec::with_capacity(frame.observations.len());
    for matched in &frame.observations {
        let factor = only_pose_factor(matched, stereo_rig);
        let threshold = threshold_for(&factor, config.chi2_mono[0], config.chi2_stereo[0]);
        let fid = problem.add_factor(factor, &[pose])?;
        problem.set_robust(fid, Some(huber(threshold)?))?;
        edges.push(fid);
    }
    for plane in &frame.planes {
        problem.add_factor(
            Factor::LidarPointToPlane(LidarPointToPlaneFactor::new(
                plane.point,
                plane.normal,
                plane.offset,
                plane.weight,
                plane.sensor,
            )),
            &[pose],
        )?;
    }
    if let Some((t_wc, information)) = &frame.pose_prior {
        problem.add_factor(Factor::PriorPose(PosePrior::new(*t_wc, information)), &[pose])?;
    }
    Ok(edges)
}

/// Classify every observation against the thresholds of `round`.
///
/// Returns the number of outliers. Outliers are deactivated, inliers re-activated.
fn classify(
    problem: &mut Problem,
    edges: &[FactorId],
    inliers: &mut [bool],
    pose: VertexId,
    thresholds: (f64, f64),
    check_depth: bool,
) -> FusionResult<usize> {
    let mut num_bad = 0;
    for (k, &fid) in edges.iter().enumerate() {
        let chi2 = problem.chi2(fid)?;
        let factor = problem.factor(fid)?;
        let threshold = threshold_for(factor, thresholds.0, thresholds.1);
        let behind = check_depth && !is_depth_positive(factor, pose_of(problem, pose)?);
        let inlier = chi2 <= threshold && !behind;
        inliers[k] = inlier;
        problem.set_active(fid, inlier)?;
        if !inlier {
            num_bad += 1;
        }
    }
    Ok(num_bad)
}

/// ICP measurement of `frame`, required by the ICP drivers.
fn icp_measurement(frame: &FrameSnapshot) -> FusionResult<&IcpMeasurement> {
    frame.icp.as_ref().ok_or_else(|| {
        FusionError::InvalidInput("frame has no registration against the previous frame".to_string())
    })
}

/// Estimate the body pose of `frame` from its matches with the map.
///
/// Runs up to four rounds; each restarts from the input pose. Frames with fewer than three
/// correspondences and no lidar planes are returned untouched with no inliers.
pub fn pose_optimization(
    frame: &FrameSnapshot,
    config: &PoseConfig,
    stop: Option<&AtomicBool>,
) -> FusionResult<DriverStatus<PoseOutcome>> {
    track_pose(frame, None, config, stop)
}

/// [`pose_optimization`] with an ICP factor to the previous frame, held at `previous_t_wb`.
///
/// The previous frame shares the rig of `frame`. Fails when `frame.icp` is not set.
pub fn pose_icp_optimization(
    frame: &FrameSnapshot,
    previous_t_wb: &SE3,
    config: &PoseConfig,
    stop: Option<&AtomicBool>,
) -> FusionResult<DriverStatus<PoseOutcome>> {
    let icp = icp_measurement(frame)?;
    track_pose(frame, Some((previous_t_wb, icp)), config, stop)
}

fn track_pose(
    frame: &FrameSnapshot,
    previous: Option<(&SE3, &IcpMeasurement)>,
    config: &PoseConfig,
    stop: Option<&AtomicBool>,
) -> FusionResult<DriverStatus<PoseOutcome>> {
    bail_if_stopped!(stop);
    let n = frame.observations.len();
    if n < 3 && frame.planes.is_empty() && previous.is_none() {
        warn!(correspondences = n, "too few correspondences for pose optimization");
        return Ok(DriverStatus::Completed(PoseOutcome {
            t_wb: frame.t_wb,
            inliers: vec![false; n],
            num_inliers: 0,
            summary: None,
        }));
    }

    let initial = ImuCamPose::from_body_pose(&frame.t_wb, &frame.rig);
    let mut problem = Problem::new();
    let pose = problem.add_vertex(Vertex::Pose(initial.clone()));
    let edges = add_frame_factors(&mut problem, frame, pose, config)?;
    if let Some((previous_t_wb, icp)) = previous {
        let anchor = problem.add_vertex(Vertex::Pose(ImuCamPose::from_body_pose(
            previous_t_wb,
            &frame.rig,
        )));
        problem.set_fixed(anchor, true)?;
        problem.add_factor(
            Factor::Icp(IcpFactor::new(icp.t_12, icp.information)),
            &[anchor, pose],
        )?;
    }

    let mut inliers = vec![true; n];
    let mut num_bad = 0;
    let mut last = None;
    for (round, (&mono, &stereo)) in config.chi2_mono.iter().zip(&config.chi2_stereo).enumerate() {
        problem.set_estimate(pose, Vertex::Pose(initial.clone()))?;
        let Some(summary) = run_solver(&mut problem, &config.solver, config.iterations, stop)?
        else {
            return Ok(DriverStatus::Cancelled);
        };
        last = Some(summary);

        num_bad = classify(&mut problem, &edges, &mut inliers, pose, (mono, stereo), false)?;
        if round == config.last_robust_round {
            problem.clear_robust();
        }
        debug!(round, outliers = num_bad, "pose optimization round");
        if n - num_bad < config.min_active {
            break;
        }
    }
    bail_if_stopped!(stop);

    let num_inliers = n - num_bad;
    info!(
        num_inliers,
        outliers = num_bad,
        icp = previous.is_some(),
        "pose optimization finished"
    );
    Ok(DriverStatus::Completed(PoseOutcome {
        t_wb: pose_of(&problem, pose)?.body_pose(),
        inliers,
        num_inliers,
        summary: last,
    }))
}

/// Vertices of one inertial state.
#[derive(Debug, Clone, Copy)]
struct InertialVertices {
    pose: VertexId,
    velocity: VertexId,
    gyro: VertexId,
    acc: VertexId,
}

impl InertialVertices {
    fn add(
        problem: &mut Problem,
        t_wb: &SE3,
        rig: &RigCalibration,
        velocity: Vector3<f64>,
        bias: &ImuBias,
    ) -> Self {
        Self {
            pose: problem.add_vertex(Vertex::Pose(ImuCamPose::from_body_pose(t_wb, rig))),
            velocity: problem.add_vertex(Vertex::Velocity(velocity)),
            gyro: problem.add_vertex(Vertex::GyroBias(bias.gyro)),
            acc: problem.add_vertex(Vertex::AccBias(bias.acc)),
        }
    }

    fn set_fixed(&self, problem: &mut Problem, fixed: bool) -> FusionResult<()> {
        for id in self.ids() {
            problem.set_fixed(id, fixed)?;
        }
        Ok(())
    }

    fn ids(&self) -> [VertexId; 4] {
        [self.pose, self.velocity, self.gyro, self.acc]
    }
}

/// Estimate pose, velocity and biases of `frame` tied to `reference` by its IMU delta.
///
/// After the last round the joint Hessian of reference and frame is computed; the
/// reference block is marginalized (or dropped when the reference is a fixed keyframe) and
/// the remainder becomes the prior returned for the next call.
pub fn pose_inertial_optimization(
    frame: &FrameSnapshot,
    reference: &InertialReference,
    config: &PoseConfig,
    stop: Option<&AtomicBool>,
) -> FusionResult<DriverStatus<PoseInertialOutcome>> {
    track_inertial(frame, reference, None, config, stop)
}

/// [`pose_inertial_optimization`] with an ICP factor between the reference and the frame.
///
/// The registration in `frame.icp` must be measured against the reference. The ICP factor
/// joins the Hessian the next prior is marginalized from. Fails when `frame.icp` is not set.
pub fn pose_inertial_icp_optimization(
    frame: &FrameSnapshot,
    reference: &InertialReference,
    config: &PoseConfig,
    stop: Option<&AtomicBool>,
) -> FusionResult<DriverStatus<PoseInertialOutcome>> {
    let icp = icp_measurement(frame)?;
    track_inertial(frame, reference, Some(icp), config, stop)
}

fn track_inertial(
    frame: &FrameSnapshot,
    reference: &InertialReference,
    icp: Option<&IcpMeasurement>,
    config: &PoseConfig,
    stop: Option<&AtomicBool>,
) -> FusionResult<DriverStatus<PoseInertialOutcome>> {
    bail_if_stopped!(stop);
    let preintegrated = frame.preintegrated.clone().ok_or_else(|| {
        FusionError::InvalidInput("frame has no preintegrated delta to its reference".to_string())
    })?;

    let mut problem = Problem::new();
    let current = InertialVertices::add(
        &mut problem,
        &frame.t_wb,
        &frame.rig,
        frame.velocity,
        &frame.bias,
    );
    let edges = add_frame_factors(&mut problem, frame, current.pose, config)?;

    let state = reference.state();
    let previous =
        InertialVertices::add(&mut problem, &state.t_wb, &state.rig, state.velocity, &state.bias);
    match reference {
        InertialReference::KeyFrame(_) => previous.set_fixed(&mut problem, true)?,
        InertialReference::Frame { prior, .. } => {
            problem.add_factor(Factor::PriorPoseImu(prior.clone()), &previous.ids())?;
        }
    }

    problem.add_factor(
        Factor::GyroRandomWalk(RandomWalkFactor::new(preintegrated.gyro_walk_information())),
        &[previous.gyro, current.gyro],
    )?;
    problem.add_factor(
        Factor::AccRandomWalk(RandomWalkFactor::new(preintegrated.acc_walk_information())),
        &[previous.acc, current.acc],
    )?;
    problem.add_factor(
        Factor::Inertial(InertialFactor::new(preintegrated)),
        &[
            previous.pose,
            previous.velocity,
            previous.gyro,
            previous.acc,
            current.pose,
            current.velocity,
        ],
    )?;
    if let Some(icp) = icp {
        problem.add_factor(
            Factor::Icp(IcpFactor::new(icp.t_12, icp.information)),
            &[previous.pose, current.pose],
        )?;
    }

    let n = frame.observations.len();
    let mut inliers = vec![true; n];
    let mut num_bad = 0;
    let mut last = None;
    for (round, (&mono, &stereo)) in config.chi2_mono.iter().zip(&config.chi2_stereo).enumerate() {
        let Some(summary) = run_solver(&mut problem, &config.solver, config.iterations, stop)?
        else {
            return Ok(DriverStatus::Cancelled);
        };
        last = Some(summary);

        num_bad = classify(&mut problem, &edges, &mut inliers, current.pose, (mono, stereo), true)?;
        if round == config.last_robust_round {
            problem.clear_robust();
        }
        debug!(round, outliers = num_bad, "pose-inertial optimization round");
        if n - num_bad < config.min_active {
            break;
        }
    }
    let Some(summary) = last else {
        return Err(FusionError::InvalidInput("pose config has no rounds".to_string()));
    };

    if n - num_bad < config.min_inliers {
        let (mono, stereo) = config.relaxed_chi2;
        num_bad = 0;
        for (k, &fid) in edges.iter().enumerate() {
            let threshold = threshold_for(problem.factor(fid)?, mono, stereo);
            inliers[k] = problem.chi2(fid)? < threshold;
            if !inliers[k] {
                num_bad += 1;
            }
        }
    }
    bail_if_stopped!(stop);

    problem.linearize()?;
    let order: Vec<VertexId> = previous.ids().into_iter().chain(current.ids()).collect();
    let h = problem.joint_hessian(&order)?;
    let h = match reference {
        InertialReference::KeyFrame(_) => h,
        InertialReference::Frame { .. } => marginalize(&h, 0..15)?,
    };
    let information =
        SMatrix::<f64, 15, 15>::from_iterator(h.view((15, 15), (15, 15)).iter().copied());

    let pose = pose_of(&problem, current.pose)?;
    let velocity = vector_of(&problem, current.velocity)?;
    let bias = ImuBias::new(
        vector_of(&problem, current.gyro)?,
        vector_of(&problem, current.acc)?,
    );
    let prior = PoseImuPrior::at_pose(pose, velocity, bias, &information);

    let num_inliers = n - num_bad;
    info!(
        num_inliers,
        outliers = num_bad,
        icp = icp.is_some(),
        "pose-inertial optimization finished"
    );
    Ok(DriverStatus::Completed(PoseInertialOutcome {
        t_wb: pose.body_pose(),
        velocity,
        bias,
        inliers,
        num_inliers,
        prior,
        summary,
    }))
}
