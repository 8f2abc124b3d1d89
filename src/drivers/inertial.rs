//! Visual-inertial bundle adjustment and IMU initialization.
//!
//! Each keyframe contributes a pose, a velocity and either its own bias pair linked to its
//! predecessor by random-walk factors, or a bias pair shared by the whole window when the
//! IMU is still being initialized. Consecutive keyframes are tied by an inertial factor
//! built on the preintegrated delta between them.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use tracing::{debug, info};

use super::bundle_adjustment::VisualGraph;
use super::snapshot::{KeyFrameId, KeyFrameSnapshot, LandmarkId, MapSnapshot};
use super::{
    CHI2_INERTIAL, CHI2_MONO, CHI2_STEREO, DriverStatus, add_icp_factors, bail_if_stopped, huber,
    pose_of, run_solver, vector_of,
};
use crate::core::{GravityDirection, ImuCamPose, Problem, Vertex, VertexId};
use crate::error::{FusionError, FusionResult};
use crate::factors::{
    BiasPriorFactor, Factor, GyroOnlyFactor, InertialFactor, InertialGravityScaleFactor,
    RandomWalkFactor,
};
use crate::manifold::SE3;
use crate::optimizer::{OptimizerType, SolverConfig, SolverSummary};
use crate::sensors::ImuBias;

/// Gravity direction and map scale refined together with the window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GravityScale {
    /// Rotation from the gravity frame to the world
    pub rwg: Matrix3<f64>,
    pub scale: f64,
    /// Keep the scale at its initial value
    pub fix_scale: bool,
}

impl Default for GravityScale {
    fn default() -> Self {
        Self {
            rwg: Matrix3::identity(),
            scale: 1.0,
            fix_scale: false,
        }
    }
}

/// Configuration of [`full_inertial_bundle_adjustment`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullInertialConfig {
    pub iterations: usize,
    /// Share one bias pair across the window, anchored by zero-mean priors
    pub init: bool,
    /// Weight of the gyroscope bias prior in init mode
    pub prior_gyro: f64,
    /// Weight of the accelerometer bias prior in init mode
    pub prior_acc: f64,
    /// Fix the pose of the keyframe with the lowest id
    pub fix_first_pose: bool,
    /// Attach Huber kernels to the visual and inertial factors
    pub robust: bool,
    /// Refine gravity direction and scale as well
    pub gravity_scale: Option<GravityScale>,
    /// Add the snapshot's scan registrations as ICP factors
    pub use_icp: bool,
    pub chi2_mono: f64,
    pub chi2_stereo: f64,
    pub solver: SolverConfig,
}

impl Default for FullInertialConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            init: false,
            prior_gyro: 1e2,
            prior_acc: 1e10,
            fix_first_pose: true,
            robust: true,
            gravity_scale: None,
            use_icp: true,
            chi2_mono: CHI2_MONO,
            chi2_stereo: CHI2_STEREO,
            solver: SolverConfig::default(),
        }
    }
}

impl FullInertialConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    /// Switch to the shared-bias init mode with the given prior weights.
    pub fn with_init_priors(mut self, prior_gyro: f64, prior_acc: f64) -> Self {
        self.init = true;
        self.prior_gyro = prior_gyro;
        self.prior_acc = prior_acc;
        self
    }

    pub fn with_fix_first_pose(mut self, fix_first_pose: bool) -> Self {
        self.fix_first_pose = fix_first_pose;
        self
    }

    pub fn with_robust(mut self, robust: bool) -> Self {
        self.robust = robust;
        self
    }

    pub fn with_gravity_scale(mut self, gravity_scale: GravityScale) -> Self {
        self.gravity_scale = Some(gravity_scale);
        self
    }

    pub fn with_icp(mut self, use_icp: bool) -> Self {
        self.use_icp = use_icp;
        self
    }

    pub fn with_solver(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }
}

/// Estimated state of one keyframe.
#[derive(Debug, Clone, PartialEq)]
pub struct InertialKeyFrame {
    pub id: KeyFrameId,
    pub t_wb: SE3,
    pub velocity: Vector3<f64>,
    pub bias: ImuBias,
}

/// Outcome of [`full_inertial_bundle_adjustment`].
#[derive(Debug, Clone)]
pub struct FullInertialOutcome {
    pub keyframes: Vec<InertialKeyFrame>,
    pub landmarks: Vec<(LandmarkId, Vector3<f64>)>,
    /// Refined `(Rwg, scale)` when gravity and scale were optimized
    pub gravity_scale: Option<(Matrix3<f64>, f64)>,
    pub icp_edges: usize,
    pub summary: SolverSummary,
}

/// Configuration of [`inertial_initialization`] and [`estimate_gyro_bias`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InertialInitConfig {
    pub iterations: usize,
    pub prior_gyro: f64,
    pub prior_acc: f64,
    /// Initial gravity direction, scale and whether the scale is held
    pub gravity_scale: GravityScale,
    pub solver: SolverConfig,
}

impl Default for InertialInitConfig {
    fn default() -> Self {
        Self {
            iterations: 200,
            prior_gyro: 1e2,
            prior_acc: 1e10,
            gravity_scale: GravityScale::default(),
            solver: SolverConfig::default(),
        }
    }
}

impl InertialInitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_priors(mut self, prior_gyro: f64, prior_acc: f64) -> Self {
        self.prior_gyro = prior_gyro;
        self.prior_acc = prior_acc;
        self
    }

    pub fn with_gravity_scale(mut self, gravity_scale: GravityScale) -> Self {
        self.gravity_scale = gravity_scale;
        self
    }

    pub fn with_solver(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }
}

/// Outcome of [`inertial_initialization`].
#[derive(Debug, Clone)]
pub struct InertialInitOutcome {
    pub rwg: Matrix3<f64>,
    pub scale: f64,
    pub bias: ImuBias,
    pub velocities: Vec<(KeyFrameId, Vector3<f64>)>,
    pub summary: SolverSummary,
}

/// Configuration of [`refine_gravity_and_scale`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleRefinementConfig {
    pub iterations: usize,
    /// Starting gravity direction and scale
    pub gravity_scale: GravityScale,
    pub solver: SolverConfig,
}

impl Default for ScaleRefinementConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            gravity_scale: GravityScale::default(),
            solver: SolverConfig::default().with_optimizer_type(OptimizerType::GaussNewton),
        }
    }
}

impl ScaleRefinementConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_gravity_scale(mut self, gravity_scale: GravityScale) -> Self {
        self.gravity_scale = gravity_scale;
        self
    }

    pub fn with_solver(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }
}

/// Outcome of [`refine_gravity_and_scale`].
#[derive(Debug, Clone)]
pub struct ScaleRefinementOutcome {
    pub rwg: Matrix3<f64>,
    pub scale: f64,
    pub summary: SolverSummary,
}

/// Outcome of [`estimate_gyro_bias`].
#[derive(Debug, Clone)]
pub struct GyroBiasOutcome {
    pub gyro: Vector3<f64>,
    pub summary: SolverSummary,
}

/// Vertices of one keyframe.
#[derive(Debug, Clone, Copy)]
struct StateVertices {
    pose: VertexId,
    velocity: VertexId,
    gyro: VertexId,
    acc: VertexId,
}

/// Pairs `(previous, current)` of keyframes linked by a preintegrated delta.
///
/// Keyframes whose predecessor is outside the snapshot are skipped.
fn inertial_links(map: &MapSnapshot) -> Vec<(&KeyFrameSnapshot, &KeyFrameSnapshot)> {
    map.keyframes
        .iter()
        .filter(|kf| kf.preintegrated.is_some())
        .filter_map(|kf| {
            let previous = kf.previous?;
            match map.keyframe(previous) {
                Ok(prev) => Some((prev, kf)),
                Err(_) => {
                    debug!(keyframe = kf.id, previous, "predecessor not in window, no inertial link");
                    None
                }
            }
        })
        .collect()
}

/// The keyframe with the lowest id, whose bias seeds the shared bias pair.
fn first_keyframe(map: &MapSnapshot) -> FusionResult<&KeyFrameSnapshot> {
    map.keyframes
        .iter()
        .min_by_key(|kf| kf.id)
        .ok_or_else(|| FusionError::InvalidInput("snapshot has no keyframes".to_string()))
}

/// Shared gyro and acc bias vertices with their zero-mean priors.
fn add_shared_bias(
    problem: &mut Problem,
    bias: &ImuBias,
    prior_gyro: f64,
    prior_acc: f64,
) -> FusionResult<(VertexId, VertexId)> {
    let gyro = problem.add_vertex(Vertex::GyroBias(bias.gyro));
    let acc = problem.add_vertex(Vertex::AccBias(bias.acc));
    problem.add_factor(
        Factor::PriorGyroBias(BiasPriorFactor::new(Vector3::zeros(), prior_gyro)),
        &[gyro],
    )?;
    problem.add_factor(
        Factor::PriorAccBias(BiasPriorFactor::new(Vector3::zeros(), prior_acc)),
        &[acc],
    )?;
    Ok((gyro, acc))
}

/// Visual-inertial bundle adjustment over every keyframe and landmark of `map`.
pub fn full_inertial_bundle_adjustment(
    map: &MapSnapshot,
    config: &FullInertialConfig,
    stop: Option<&AtomicBool>,
) -> FusionResult<DriverStatus<FullInertialOutcome>> {
    bail_if_stopped!(stop);
    let first = first_keyframe(map)?;
    let mut problem = Problem::new();

    let shared = if config.init {
        Some(add_shared_bias(
            &mut problem,
            &first.bias,
            config.prior_gyro,
            config.prior_acc,
        )?)
    } else {
        None
    };

    let mut states: HashMap<KeyFrameId, StateVertices> = HashMap::new();
    let mut order = Vec::with_capacity(map.keyframes.len());
    for kf in &map.keyframes {
        let pose = problem.add_vertex(Vertex::Pose(ImuCamPose::from_body_pose(&kf.t_wb, &kf.rig)));
        let velocity = problem.add_vertex(Vertex::Velocity(kf.velocity));
        let (gyro, acc) = match shared {
            Some(pair) => pair,
            None => (
                problem.add_vertex(Vertex::GyroBias(kf.bias.gyro)),
                problem.add_vertex(Vertex::AccBias(kf.bias.acc)),
            ),
        };
        let fixed_pose = kf.fixed || (config.fix_first_pose && kf.id == first.id);
        problem.set_fixed(pose, fixed_pose)?;
        if kf.fixed {
            problem.set_fixed(velocity, true)?;
            if shared.is_none() {
                problem.set_fixed(gyro, true)?;
                problem.set_fixed(acc, true)?;
            }
        }
        states.insert(
            kf.id,
            StateVertices {
                pose,
                velocity,
                gyro,
                acc,
            },
        );
        order.push(kf.id);
    }

    let gravity_scale = match &config.gravity_scale {
        Some(gs) => {
            let gravity = problem.add_vertex(Vertex::GravityDirection(GravityDirection::new(gs.rwg)));
            let scale = problem.add_vertex(Vertex::Scale(gs.scale));
            problem.set_fixed(scale, gs.fix_scale)?;
            Some((gravity, scale))
        }
        None => None,
    };

    let mut inertial_edges = 0;
    for (prev, kf) in inertial_links(map) {
        let Some(preintegrated) = kf.preintegrated.clone() else {
            continue;
        };
        let (Some(s1), Some(s2)) = (states.get(&prev.id), states.get(&kf.id)) else {
            continue;
        };

        if shared.is_none() {
            problem.add_factor(
                Factor::GyroRandomWalk(RandomWalkFactor::new(preintegrated.gyro_walk_information())),
                &[s1.gyro, s2.gyro],
            )?;
            problem.add_factor(
                Factor::AccRandomWalk(RandomWalkFactor::new(preintegrated.acc_walk_information())),
                &[s1.acc, s2.acc],
            )?;
        }

        let mut vertices = vec![s1.pose, s1.velocity, s1.gyro, s1.acc, s2.pose, s2.velocity];
        let factor = match gravity_scale {
            Some((gravity, scale)) => {
                vertices.extend([gravity, scale]);
                Factor::InertialGravityScale(InertialGravityScaleFactor::new(preintegrated))
            }
            None => Factor::Inertial(InertialFactor::new(preintegrated)),
        };
        let fid = problem.add_factor(factor, &vertices)?;
        if config.robust {
            problem.set_robust(fid, Some(huber(CHI2_INERTIAL)?))?;
        }
        inertial_edges += 1;
    }

    let poses: HashMap<KeyFrameId, VertexId> =
        states.iter().map(|(id, s)| (*id, s.pose)).collect();
    let icp_edges = if config.use_icp {
        add_icp_factors(&mut problem, &map.icp_links, |id| {
            poses.get(&id).copied().ok_or(FusionError::UnknownKeyFrame(id))
        })?
    } else {
        0
    };
    let (landmarks, edges) = VisualGraph::add_observations(
        &mut problem,
        map,
        &poses,
        (config.chi2_mono, config.chi2_stereo),
        config.robust,
    )?;

    let Some(summary) = run_solver(&mut problem, &config.solver, config.iterations, stop)? else {
        return Ok(DriverStatus::Cancelled);
    };
    bail_if_stopped!(stop);

    let mut keyframes = Vec::with_capacity(order.len());
    for id in order {
        let Some(s) = states.get(&id) else { continue };
        keyframes.push(InertialKeyFrame {
            id,
            t_wb: pose_of(&problem, s.pose)?.body_pose(),
            velocity: vector_of(&problem, s.velocity)?,
            bias: ImuBias::new(vector_of(&problem, s.gyro)?, vector_of(&problem, s.acc)?),
        });
    }
    let landmarks = landmarks
        .iter()
        .map(|&(lm, id)| Ok((lm, vector_of(&problem, id)?)))
        .collect::<FusionResult<Vec<_>>>()?;
    let gravity_scale = match gravity_scale {
        Some((gravity, scale)) => Some(gravity_and_scale(&problem, gravity, scale)?),
        None => None,
    };

    info!(
        keyframes = keyframes.len(),
        inertial_edges,
        visual_edges = edges.len(),
        icp_edges,
        final_cost = summary.final_cost,
        "inertial bundle adjustment finished"
    );
    Ok(DriverStatus::Completed(FullInertialOutcome {
        keyframes,
        landmarks,
        gravity_scale,
        icp_edges,
        summary,
    }))
}

fn gravity_and_scale(
    problem: &Problem,
    gravity: VertexId,
    scale: VertexId,
) -> FusionResult<(Matrix3<f64>, f64)> {
    let rwg = problem
        .vertex(gravity)?
        .as_gravity()
        .map(|g| g.rwg)
        .ok_or_else(|| FusionError::InvalidInput(format!("vertex {gravity} is not a gravity direction")))?;
    let scale = problem
        .vertex(scale)?
        .as_scale()
        .ok_or_else(|| FusionError::InvalidInput(format!("vertex {scale} is not a scale")))?;
    Ok((rwg, scale))
}

/// Estimate velocities, one bias pair, gravity direction and scale with the poses held.
///
/// Fails when no keyframe of `map` carries a preintegrated delta to a keyframe of `map`.
pub fn inertial_initialization(
    map: &MapSnapshot,
    config: &InertialInitConfig,
    stop: Option<&AtomicBool>,
) -> FusionResult<DriverStatus<InertialInitOutcome>> {
    bail_if_stopped!(stop);
    let links = inertial_links(map);
    if links.is_empty() {
        return Err(FusionError::InvalidInput(
            "inertial initialization needs at least one preintegrated link".to_string(),
        ));
    }
    let first = first_keyframe(map)?;
    let mut problem = Problem::new();

    let mut poses = HashMap::new();
    let mut velocities = Vec::with_capacity(map.keyframes.len());
    for kf in &map.keyframes {
        let pose = problem.add_vertex(Vertex::Pose(ImuCamPose::from_body_pose(&kf.t_wb, &kf.rig)));
        problem.set_fixed(pose, true)?;
        let velocity = problem.add_vertex(Vertex::Velocity(kf.velocity));
        poses.insert(kf.id, (pose, velocity));
        velocities.push((kf.id, velocity));
    }

    let (gyro, acc) = add_shared_bias(&mut problem, &first.bias, config.prior_gyro, config.prior_acc)?;
    let gs = &config.gravity_scale;
    let gravity = problem.add_vertex(Vertex::GravityDirection(GravityDirection::new(gs.rwg)));
    let scale = problem.add_vertex(Vertex::Scale(gs.scale));
    problem.set_fixed(scale, gs.fix_scale)?;

    for (prev, kf) in &links {
        let (Some(&(p1, v1)), Some(&(p2, v2)), Some(preintegrated)) =
            (poses.get(&prev.id), poses.get(&kf.id), kf.preintegrated.clone())
        else {
            continue;
        };
        problem.add_factor(
            Factor::InertialGravityScale(InertialGravityScaleFactor::new(preintegrated)),
            &[p1, v1, gyro, acc, p2, v2, gravity, scale],
        )?;
    }

    let Some(summary) = run_solver(&mut problem, &config.solver, config.iterations, stop)? else {
        return Ok(DriverStatus::Cancelled);
    };
    bail_if_stopped!(stop);

    let (rwg, scale) = gravity_and_scale(&problem, gravity, scale)?;
    let bias = ImuBias::new(vector_of(&problem, gyro)?, vector_of(&problem, acc)?);
    let velocities = velocities
        .iter()
        .map(|&(id, v)| Ok((id, vector_of(&problem, v)?)))
        .collect::<FusionResult<Vec<_>>>()?;

    info!(
        links = links.len(),
        scale,
        gyro_bias = ?bias.gyro,
        acc_bias = ?bias.acc,
        "inertial initialization finished"
    );
    Ok(DriverStatus::Completed(InertialInitOutcome {
        rwg,
        scale,
        bias,
        velocities,
        summary,
    }))
}

/// Estimate a single gyroscope bias from the relative rotations of fixed poses.
pub fn estimate_gyro_bias(
    map: &MapSnapshot,
    config: &InertialInitConfig,
    stop: Option<&AtomicBool>,
) -> FusionResult<DriverStatus<GyroBiasOutcome>> {
    bail_if_stopped!(stop);
    let links = inertial_links(map);
    if links.is_empty() {
        return Err(FusionError::InvalidInput(
            "gyroscope bias estimation needs at least one preintegrated link".to_string(),
        ));
    }
    let first = first_keyframe(map)?;
    let mut problem = Problem::new();

    let mut poses = HashMap::new();
    for kf in &map.keyframes {
        let pose = problem.add_vertex(Vertex::Pose(ImuCamPose::from_body_pose(&kf.t_wb, &kf.rig)));
        problem.set_fixed(pose, true)?;
        poses.insert(kf.id, pose);
    }
    let gyro = problem.add_vertex(Vertex::GyroBias(first.bias.gyro));
    problem.add_factor(
        Factor::PriorGyroBias(BiasPriorFactor::new(Vector3::zeros(), config.prior_gyro)),
        &[gyro],
    )?;
    for (prev, kf) in &links {
        let (Some(&p1), Some(&p2), Some(preintegrated)) =
            (poses.get(&prev.id), poses.get(&kf.id), kf.preintegrated.clone())
        else {
            continue;
        };
        problem.add_factor(
            Factor::GyroOnly(GyroOnlyFactor::new(preintegrated)),
            &[p1, p2, gyro],
        )?;
    }

    let Some(summary) = run_solver(&mut problem, &config.solver, config.iterations, stop)? else {
        return Ok(DriverStatus::Cancelled);
    };
    bail_if_stopped!(stop);
    let gyro = vector_of(&problem, gyro)?;
    debug!(gyro_bias = ?gyro, "gyroscope bias estimated");
    Ok(DriverStatus::Completed(GyroBiasOutcome { gyro, summary }))
}

/// Refine only gravity direction and scale; poses, velocities and biases are held.
///
/// Each keyframe keeps its own bias pair, read by the inertial factor that starts at it.
pub fn refine_gravity_and_scale(
    map: &MapSnapshot,
    config: &ScaleRefinementConfig,
    stop: Option<&AtomicBool>,
) -> FusionResult<DriverStatus<ScaleRefinementOutcome>> {
    bail_if_stopped!(stop);
    let links = inertial_links(map);
    if links.is_empty() {
        return Err(FusionError::InvalidInput(
            "scale refinement needs at least one preintegrated link".to_string(),
        ));
    }
    let mut problem = Problem::new();

    let mut states: HashMap<KeyFrameId, StateVertices> = HashMap::new();
    for kf in &map.keyframes {
        let vertices = StateVertices {
            pose: problem.add_vertex(Vertex::Pose(ImuCamPose::from_body_pose(&kf.t_wb, &kf.rig))),
            velocity: problem.add_vertex(Vertex::Velocity(kf.velocity)),
            gyro: problem.add_vertex(Vertex::GyroBias(kf.bias.gyro)),
            acc: problem.add_vertex(Vertex::AccBias(kf.bias.acc)),
        };
        for id in [vertices.pose, vertices.velocity, vertices.gyro, vertices.acc] {
            problem.set_fixed(id, true)?;
        }
        states.insert(kf.id, vertices);
    }

    let gs = &config.gravity_scale;
    let gravity = problem.add_vertex(Vertex::GravityDirection(GravityDirection::new(gs.rwg)));
    let scale = problem.add_vertex(Vertex::Scale(gs.scale));
    problem.set_fixed(scale, gs.fix_scale)?;

    for (prev, kf) in &links {
        let (Some(s1), Some(s2), Some(preintegrated)) =
            (states.get(&prev.id), states.get(&kf.id), kf.preintegrated.clone())
        else {
            continue;
        };
        problem.add_factor(
            Factor::InertialGravityScale(InertialGravityScaleFactor::new(preintegrated)),
            &[s1.pose, s1.velocity, s1.gyro, s1.acc, s2.pose, s2.velocity, gravity, scale],
        )?;
    }

    let Some(summary) = run_solver(&mut problem, &config.solver, config.iterations, stop)? else {
        return Ok(DriverStatus::Cancelled);
    };
    bail_if_stopped!(stop);

    let (rwg, scale) = gravity_and_scale(&problem, gravity, scale)?;
    info!(links = links.len(), scale, "gravity and scale refined");
    Ok(DriverStatus::Completed(ScaleRefinementOutcome {
        rwg,
        scale,
        summary,
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::drivers::snapshot::IcpLink;
    use crate::manifold::LieGroup;
    use nalgebra::Matrix6;
    use crate::sensors::{GRAVITY_MAGNITUDE, ImuNoise, PinholeCamera, Preintegrated, RigCalibration};
    use std::sync::Arc;

    const DT: f64 = 0.005;
    const SAMPLES: usize = 40;

    /// Keyframes moving at constant velocity along x with a constant yaw rate.
    fn window(gyro_bias: Vector3<f64>) -> (MapSnapshot, Vec<Vector3<f64>>) {
        let rig = Arc::new(RigCalibration::monocular(
            PinholeCamera::new(400.0, 400.0, 320.0, 240.0),
            SE3::identity(),
        ));
        let velocity = Vector3::new(1.0, 0.0, 0.0);
        let rate = Vector3::new(0.0, 0.0, 0.3);
        let span = DT * SAMPLES as f64;
        let mut map = MapSnapshot::default();
        let mut velocities = Vec::new();
        for k in 0..4 {
            let t = span * k as f64;
            let t_wb = SE3::from_rotation_vector(rate * t, velocity * t);
            let mut kf = KeyFrameSnapshot::new(k, t_wb, rig.clone());
            kf.velocity = velocity;
            if k > 0 {
                let prev_t = span * (k - 1) as f64;
                let mut preintegrated = Preintegrated::new(ImuBias::default(), &ImuNoise::default());
                for i in 0..SAMPLES {
                    let rwb = crate::manifold::so3::exp(&(rate * (prev_t + DT * i as f64)));
                    let acc = rwb.transpose() * Vector3::new(0.0, 0.0, GRAVITY_MAGNITUDE);
                    preintegrated.integrate_measurement(&acc, &(rate + gyro_bias), DT);
                }
                kf = kf.with_imu(k - 1, Arc::new(preintegrated));
            }
            map.keyframes.push(kf);
            velocities.push(velocity);
        }
        (map, velocities)
    }

    #[test]
    fn test_full_inertial_ba_keeps_consistent_states() {
        let (map, velocities) = window(Vector3::zeros());
        let config = FullInertialConfig::new().with_robust(false);
        let outcome = full_inertial_bundle_adjustment(&map, &config, None)
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(outcome.keyframes.len(), 4);
        assert!(outcome.summary.final_cost < 1e-6);
        for (state, truth) in outcome.keyframes.iter().zip(&velocities) {
            assert!((state.velocity - truth).norm() < 1e-3);
        }
        assert!(outcome.gravity_scale.is_none());
    }

    #[test]
    fn test_initialization_recovers_velocities() {
        let (mut map, velocities) = window(Vector3::zeros());
        for kf in &mut map.keyframes {
            kf.velocity = Vector3::zeros();
        }
        let config = InertialInitConfig::new().with_gravity_scale(GravityScale {
            fix_scale: true,
            ..GravityScale::default()
        });
        let outcome = inertial_initialization(&map, &config, None)
            .unwrap()
            .completed()
            .unwrap();
        assert!((outcome.scale - 1.0).abs() < 1e-12);
        for ((_, v), truth) in outcome.velocities.iter().zip(&velocities) {
            assert!((v - truth).norm() < 1e-2, "velocity {v:?}");
        }
    }

    #[test]
    fn test_initialization_without_links_is_an_error() {
        let (mut map, _) = window(Vector3::zeros());
        for kf in &mut map.keyframes {
            kf.preintegrated = None;
        }
        let result = inertial_initialization(&map, &InertialInitConfig::default(), None);
        assert!(matches!(result, Err(FusionError::InvalidInput(_))));
    }

    #[test]
    fn test_full_inertial_ba_accepts_consistent_icp_link() {
        let (mut map, _) = window(Vector3::zeros());
        let camera = |kf: &KeyFrameSnapshot| ImuCamPose::from_body_pose(&kf.t_wb, &kf.rig).camera_pose(0);
        map.icp_links.push(IcpLink {
            from: 1,
            to: 2,
            t_12: camera(&map.keyframes[1]).compose(&camera(&map.keyframes[2]).inverse()),
            information: Matrix6::identity(),
        });
        let config = FullInertialConfig::new().with_robust(false);
        let outcome = full_inertial_bundle_adjustment(&map, &config, None)
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(outcome.icp_edges, 1);
        assert!(outcome.summary.final_cost < 1e-6);

        let without = full_inertial_bundle_adjustment(&map, &config.with_icp(false), None)
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(without.icp_edges, 0);
    }

    #[test]
    fn test_scale_refinement_without_links_is_an_error() {
        let (mut map, _) = window(Vector3::zeros());
        for kf in &mut map.keyframes {
            kf.preintegrated = None;
        }
        let result = refine_gravity_and_scale(&map, &ScaleRefinementConfig::default(), None);
        assert!(matches!(result, Err(FusionError::InvalidInput(_))));
    }

    #[test]
    fn test_scale_refinement_keeps_consistent_state() {
        let (map, _) = window(Vector3::zeros());
        let config = ScaleRefinementConfig::default();
        assert_eq!(config.solver.optimizer_type, OptimizerType::GaussNewton);
        let outcome = refine_gravity_and_scale(&map, &config, None)
            .unwrap()
            .completed()
            .unwrap();
        assert!((outcome.scale - 1.0).abs() < 1e-9);
        assert!((outcome.rwg * Vector3::z() - Vector3::z()).norm() < 1e-9);
    }

    #[test]
    fn test_gyro_bias_is_recovered() {
        let bias = Vector3::new(0.01, -0.02, 0.005);
        let (map, _) = window(bias);
        let config = InertialInitConfig::new().with_priors(1e-6, 1e10).with_iterations(20);
        let outcome = estimate_gyro_bias(&map, &config, None)
            .unwrap()
            .completed()
            .unwrap();
        assert!((outcome.gyro - bias).norm() < 1e-3, "gyro bias {:?}", outcome.gyro);
    }
}
