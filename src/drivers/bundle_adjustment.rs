//! Visual bundle adjustment over keyframe poses and map points.
//!
//! Points are Schur-eliminated; each observation becomes a mono or stereo reprojection
//! factor. The local variant follows the usual two-phase scheme: a few robust iterations,
//! an outlier pass that deactivates observations failing the chi-square test or lying
//! behind the camera, then more iterations without the robust kernel. Scan registrations
//! between keyframes of a local window add ICP factors on the pose pairs they link.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use tracing::info;

use super::snapshot::{KeyFrameId, LandmarkId, MapSnapshot};
use super::{
    CHI2_MONO, CHI2_STEREO, DriverStatus, add_icp_factors, bail_if_stopped, depth_positive,
    huber, observation_factor, pose_of, run_solver, threshold_for, vector_of,
};
use crate::core::{FactorId, ImuCamPose, Problem, Vertex, VertexId};
use crate::error::{FusionError, FusionResult};
use crate::manifold::SE3;
use crate::optimizer::{SolverConfig, SolverSummary};

/// Configuration of the bundle adjustment drivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleAdjustmentConfig {
    /// Iterations of the global run, or of the robust phase of the local run
    pub iterations: usize,
    /// Iterations of the local run after the outlier pass
    pub refine_iterations: usize,
    /// Attach Huber kernels to the reprojection factors
    pub robust: bool,
    pub chi2_mono: f64,
    pub chi2_stereo: f64,
    /// Add the snapshot's scan registrations to the local run
    pub use_icp: bool,
    pub solver: SolverConfig,
}

impl Default for BundleAdjustmentConfig {
    fn default() -> Self {
        Self {
            iterations: 5,
            refine_iterations: 10,
            robust: true,
            use_icp: true,
            chi2_mono: CHI2_MONO,
            chi2_stereo: CHI2_STEREO,
            solver: SolverConfig::default(),
        }
    }
}

impl BundleAdjustmentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_refine_iterations(mut self, refine_iterations: usize) -> Self {
        self.refine_iterations = refine_iterations;
        self
    }

    pub fn with_robust(mut self, robust: bool) -> Self {
        self.robust = robust;
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

/// Outcome of [`global_bundle_adjustment`].
#[derive(Debug, Clone)]
pub struct GlobalBundleAdjustment {
    /// Body pose `Twb` of every keyframe
    pub keyframes: Vec<(KeyFrameId, SE3)>,
    /// Position of every optimized landmark
    pub landmarks: Vec<(LandmarkId, Vector3<f64>)>,
    /// Landmarks without any observation, left untouched
    pub not_optimized: Vec<LandmarkId>,
    pub summary: SolverSummary,
}

/// Outcome of [`local_bundle_adjustment`].
#[derive(Debug, Clone)]
pub struct LocalBundleAdjustment {
    /// Body pose `Twb` of every free keyframe
    pub keyframes: Vec<(KeyFrameId, SE3)>,
    pub landmarks: Vec<(LandmarkId, Vector3<f64>)>,
    /// Observations to erase from the map, as (keyframe, landmark)
    pub outliers: Vec<(KeyFrameId, LandmarkId)>,
    /// Number of ICP factors between keyframes of the window
    pub icp_edges: usize,
    /// One summary per solver phase
    pub summaries: Vec<SolverSummary>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct VisualEdge {
    pub factor: FactorId,
    pub keyframe: KeyFrameId,
    pub landmark: LandmarkId,
    pub point: VertexId,
    pub pose: VertexId,
    pub camera: usize,
}

/// Poses, points and reprojection factors of a map snapshot.
pub(crate) struct VisualGraph {
    pub problem: Problem,
    pub keyframes: Vec<(KeyFrameId, VertexId, bool)>,
    pub landmarks: Vec<(LandmarkId, VertexId)>,
    pub edges: Vec<VisualEdge>,
}

impl VisualGraph {
    /// Add every observation of `map` to `problem`, whose pose vertices are given per keyframe.
    ///
    /// `thresholds` holds the (mono, stereo) chi-square values used for the Huber deltas.
    pub(crate) fn add_observations(
        problem: &mut Problem,
        map: &MapSnapshot,
        poses: &HashMap<KeyFrameId, VertexId>,
        thresholds: (f64, f64),
        robust: bool,
    ) -> FusionResult<(Vec<(LandmarkId, VertexId)>, Vec<VisualEdge>)> {
        let (chi2_mono, chi2_stereo) = thresholds;
        let index = map.landmark_index();
        let mut point_ids: HashMap<LandmarkId, VertexId> = HashMap::new();
        let mut landmarks = Vec::new();
        let mut edges = Vec::new();

        for kf in &map.keyframes {
            let pose = *poses
                .get(&kf.id)
                .ok_or(FusionError::UnknownKeyFrame(kf.id))?;
            for observation in &kf.observations {
                let point = match point_ids.get(&observation.landmark) {
                    Some(&id) => id,
                    None => {
                        let &slot = index
                            .get(&observation.landmark)
                            .ok_or(FusionError::UnknownLandmark(observation.landmark))?;
                        let id = problem.add_vertex(Vertex::Point(map.landmarks[slot].position));
                        problem.set_marginalized(id, true)?;
                        point_ids.insert(observation.landmark, id);
                        landmarks.push((observation.landmark, id));
                        id
                    }
                };

                let factor = observation_factor(observation, kf.rig.bf.is_some());
                let threshold = threshold_for(&factor, chi2_mono, chi2_stereo);
                let fid = problem.add_factor(factor, &[point, pose])?;
                if robust {
                    problem.set_robust(fid, Some(huber(threshold)?))?;
                }
                edges.push(VisualEdge {
                    factor: fid,
                    keyframe: kf.id,
                    landmark: observation.landmark,
                    point,
                    pose,
                    camera: observation.camera,
                });
            }
        }
        Ok((landmarks, edges))
    }

    fn build(
        map: &MapSnapshot,
        config: &BundleAdjustmentConfig,
        fix_first: bool,
    ) -> FusionResult<Self> {
        let mut problem = Problem::new();
        let first = map.keyframes.iter().map(|kf| kf.id).min();
        let mut keyframes = Vec::with_capacity(map.keyframes.len());
        let mut poses = HashMap::new();
        for kf in &map.keyframes {
            let id = problem.add_vertex(Vertex::Pose(ImuCamPose::from_body_pose(&kf.t_wb, &kf.rig)));
            let fixed = kf.fixed || (fix_first && Some(kf.id) == first);
            problem.set_fixed(id, fixed)?;
            keyframes.push((kf.id, id, fixed));
            poses.insert(kf.id, id);
        }
        let (landmarks, edges) = Self::add_observations(
            &mut problem,
            map,
            &poses,
            (config.chi2_mono, config.chi2_stereo),
            config.robust,
        )?;
        Ok(Self {
            problem,
            keyframes,
            landmarks,
            edges,
        })
    }

    /// Whether `edge` fails the chi-square test or sees its point behind the camera.
    pub(crate) fn is_outlier(
        problem: &Problem,
        edge: &VisualEdge,
        config: &BundleAdjustmentConfig,
    ) -> FusionResult<bool> {
        let threshold = threshold_for(problem.factor(edge.factor)?, config.chi2_mono, config.chi2_stereo);
        Ok(problem.chi2(edge.factor)? > threshold
            || !depth_positive(problem, edge.point, edge.pose, edge.camera)?)
    }

    fn keyframe_poses(&self, free_only: bool) -> FusionResult<Vec<(KeyFrameId, SE3)>> {
        self.keyframes
            .iter()
            .filter(|(_, _, fixed)| !(free_only && *fixed))
            .map(|&(kf, id, _)| Ok((kf, pose_of(&self.problem, id)?.body_pose())))
            .collect()
    }

    fn landmark_positions(&self) -> FusionResult<Vec<(LandmarkId, Vector3<f64>)>> {
        self.landmarks
            .iter()
            .map(|&(lm, id)| Ok((lm, vector_of(&self.problem, id)?)))
            .collect()
    }
}

/// Bundle adjustment over every keyframe and landmark of `map`.
///
/// The keyframe with the lowest id is fixed to remove the gauge freedom, as is every
/// keyframe flagged `fixed`. Runs `config.iterations` iterations with no outlier pass.
pub fn global_bundle_adjustment(
    map: &MapSnapshot,
    config: &BundleAdjustmentConfig,
    stop: Option<&AtomicBool>,
) -> FusionResult<DriverStatus<GlobalBundleAdjustment>> {
    bail_if_stopped!(stop);
    let mut graph = VisualGraph::build(map, config, true)?;
    let Some(summary) = run_solver(&mut graph.problem, &config.solver, config.iterations, stop)?
    else {
        return Ok(DriverStatus::Cancelled);
    };
    bail_if_stopped!(stop);

    let observed: HashSet<LandmarkId> = graph.landmarks.iter().map(|(lm, _)| *lm).collect();
    let not_optimized = map
        .landmarks
        .iter()
        .map(|lm| lm.id)
        .filter(|id| !observed.contains(id))
        .collect();

    info!(
        keyframes = graph.keyframes.len(),
        landmarks = graph.landmarks.len(),
        initial_cost = summary.initial_cost,
        final_cost = summary.final_cost,
        "global bundle adjustment finished"
    );
    Ok(DriverStatus::Completed(GlobalBundleAdjustment {
        keyframes: graph.keyframe_poses(false)?,
        landmarks: graph.landmark_positions()?,
        not_optimized,
        summary,
    }))
}

/// Local bundle adjustment of the free keyframes of `map` and the landmarks they observe.
///
/// Keyframes flagged `fixed` only contribute their observations. With `config.use_icp`
/// every scan registration of the snapshot becomes an ICP factor; links naming a keyframe
/// outside the snapshot are an error.
pub fn local_bundle_adjustment(
    map: &MapSnapshot,
    config: &BundleAdjustmentConfig,
    stop: Option<&AtomicBool>,
) -> FusionResult<DriverStatus<LocalBundleAdjustment>> {
    bail_if_stopped!(stop);
    let mut graph = VisualGraph::build(map, config, false)?;
    let icp_edges = if config.use_icp {
        let poses: HashMap<KeyFrameId, VertexId> =
            graph.keyframes.iter().map(|&(kf, id, _)| (kf, id)).collect();
        add_icp_factors(&mut graph.problem, &map.icp_links, |id| {
            poses.get(&id).copied().ok_or(FusionError::UnknownKeyFrame(id))
        })?
    } else {
        0
    };
    let mut summaries = Vec::with_capacity(2);

    let Some(summary) = run_solver(&mut graph.problem, &config.solver, config.iterations, stop)?
    else {
        return Ok(DriverStatus::Cancelled);
    };
    summaries.push(summary);
    bail_if_stopped!(stop);

    let mut deactivated = 0;
    for edge in &graph.edges {
        if VisualGraph::is_outlier(&graph.problem, edge, config)? {
            graph.problem.set_active(edge.factor, false)?;
            deactivated += 1;
        }
    }
    graph.problem.clear_robust();

    let Some(summary) =
        run_solver(&mut graph.problem, &config.solver, config.refine_iterations, stop)?
    else {
        return Ok(DriverStatus::Cancelled);
    };
    summaries.push(summary);

    let mut outliers = Vec::new();
    for edge in &graph.edges {
        if VisualGraph::is_outlier(&graph.problem, edge, config)? {
            outliers.push((edge.keyframe, edge.landmark));
        }
    }
    bail_if_stopped!(stop);

    info!(
        keyframes = graph.keyframes.len(),
        landmarks = graph.landmarks.len(),
        deactivated,
        outliers = outliers.len(),
        icp_edges,
        "local bundle adjustment finished"
    );
    Ok(DriverStatus::Completed(LocalBundleAdjustment {
        keyframes: graph.keyframe_poses(true)?,
        landmarks: graph.landmark_positions()?,
        outliers,
        icp_edges,
        summaries,
    }))
}
