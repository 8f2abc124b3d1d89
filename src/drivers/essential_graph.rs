//! Loop-closing optimization of the essential graph.
//!
//! The graph holds the spanning tree, the loop edges found so far, the strong covisibility
//! links and the connections created by the current loop fusion. Relative measurements
//! along the new loop connections come from the corrected poses; every other edge keeps
//! the relative pose the map had before the correction, so the loop error spreads along
//! the tree. Map points then follow the correction of their reference keyframe.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use tracing::info;

use super::snapshot::{EssentialGraph, EssentialKeyFrame, KeyFrameId, LandmarkId};
use super::{DriverStatus, add_icp_factors, bail_if_stopped, pose_of, run_solver};
use crate::core::{ImuCamPose, Problem, Vertex, VertexId};
use crate::error::{FusionError, FusionResult};
use crate::factors::{Factor, PoseGraph4DofFactor, SimilarityFactor};
use crate::manifold::{LieGroup, SE3, Sim3};
use crate::optimizer::{SolverConfig, SolverSummary};

/// Configuration of the essential graph drivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EssentialGraphConfig {
    pub iterations: usize,
    /// Hold the scale of every similarity vertex (stereo and RGB-D maps)
    pub fix_scale: bool,
    /// Covisibility weight above which a link becomes an edge
    pub min_covisibility_weight: usize,
    /// Add the scan-registration links of the graph
    pub use_icp: bool,
    pub solver: SolverConfig,
}

impl Default for EssentialGraphConfig {
    fn default() -> Self {
        Self {
            iterations: 20,
            fix_scale: false,
            min_covisibility_weight: 100,
            use_icp: true,
            solver: SolverConfig::default(),
        }
    }
}

impl EssentialGraphConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_fix_scale(mut self, fix_scale: bool) -> Self {
        self.fix_scale = fix_scale;
        self
    }

    pub fn with_min_covisibility_weight(mut self, weight: usize) -> Self {
        self.min_covisibility_weight = weight;
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

/// Corrected pose of one keyframe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectedKeyFrame {
    pub id: KeyFrameId,
    /// Corrected world-to-camera similarity
    pub s_iw: Sim3,
    /// Corrected camera pose with the scale divided out
    pub t_cw: SE3,
}

/// Outcome of the essential graph drivers.
#[derive(Debug, Clone)]
pub struct EssentialGraphOutcome {
    pub keyframes: Vec<CorrectedKeyFrame>,
    pub landmarks: Vec<(LandmarkId, Vector3<f64>)>,
    pub num_edges: usize,
    pub summary: SolverSummary,
}

/// One relative constraint between keyframes at indices `i` and `j`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edge {
    i: usize,
    j: usize,
    /// Measured from the corrected poses rather than the pre-correction ones
    corrected: bool,
}

impl Edge {
    /// `Sji = Sjw · Siw⁻¹` from the poses the edge is measured on.
    fn measurement(&self, keyframes: &[EssentialKeyFrame]) -> Sim3 {
        let (ki, kj) = (&keyframes[self.i], &keyframes[self.j]);
        if self.corrected {
            kj.initial().compose(&ki.initial().inverse())
        } else {
            kj.uncorrected().compose(&ki.uncorrected().inverse())
        }
    }
}

fn ordered(a: KeyFrameId, b: KeyFrameId) -> (KeyFrameId, KeyFrameId) {
    (a.min(b), a.max(b))
}

fn lookup(index: &HashMap<KeyFrameId, usize>, id: KeyFrameId) -> FusionResult<usize> {
    index.get(&id).copied().ok_or(FusionError::UnknownKeyFrame(id))
}

/// Enumerate the edges of the essential graph.
///
/// Tree, loop and covisibility references to keyframes outside the graph are skipped;
/// loop connections must name keyframes of the graph.
fn essential_edges(
    graph: &EssentialGraph,
    index: &HashMap<KeyFrameId, usize>,
    min_weight: usize,
) -> FusionResult<Vec<Edge>> {
    let mut edges = Vec::new();
    let mut inserted = HashSet::new();

    for (id, connections) in &graph.new_connections {
        let i = lookup(index, *id)?;
        for &other in connections {
            let j = lookup(index, other)?;
            let loop_pair = *id == graph.current_keyframe && other == graph.loop_keyframe;
            if !loop_pair && graph.keyframes[i].weight(other) < min_weight {
                continue;
            }
            edges.push(Edge { i, j, corrected: true });
            inserted.insert(ordered(*id, other));
        }
    }

    let mut children: HashMap<KeyFrameId, HashSet<KeyFrameId>> = HashMap::new();
    for kf in &graph.keyframes {
        if let Some(parent) = kf.parent {
            children.entry(parent).or_default().insert(kf.id);
        }
    }

    for (i, kf) in graph.keyframes.iter().enumerate() {
        if let Some(&j) = kf.parent.and_then(|parent| index.get(&parent)) {
            edges.push(Edge { i, j, corrected: false });
        }

        for &other in kf.loop_edges.iter().filter(|&&other| other < kf.id) {
            if let Some(&j) = index.get(&other) {
                edges.push(Edge { i, j, corrected: false });
            }
        }

        let is_child = |other: KeyFrameId| children.get(&kf.id).is_some_and(|c| c.contains(&other));
        for &(other, weight) in &kf.covisibility {
            if weight < min_weight
                || other >= kf.id
                || kf.parent == Some(other)
                || is_child(other)
                || kf.loop_edges.contains(&other)
                || inserted.contains(&ordered(kf.id, other))
            {
                continue;
            }
            if let Some(&j) = index.get(&other) {
                edges.push(Edge { i, j, corrected: false });
            }
        }
    }
    Ok(edges)
}

/// Move every landmark with the correction of its reference keyframe.
///
/// `before[i]` and `after[i]` are the world-to-camera similarities of keyframe `i` at the
/// start and end of the optimization.
fn correct_landmarks(
    graph: &EssentialGraph,
    index: &HashMap<KeyFrameId, usize>,
    before: &[Sim3],
    after: &[Sim3],
) -> FusionResult<Vec<(LandmarkId, Vector3<f64>)>> {
    graph
        .landmarks
        .iter()
        .map(|lm| {
            let r = lookup(index, lm.reference)?;
            let in_reference = before[r].act(&lm.position);
            Ok((lm.id, after[r].inverse().act(&in_reference)))
        })
        .collect()
}

/// Sim3 essential graph optimization.
///
/// The loop keyframe is fixed; every other keyframe starts from its corrected pose when
/// it has one and from its pre-correction pose otherwise.
pub fn optimize_essential_graph(
    graph: &EssentialGraph,
    config: &EssentialGraphConfig,
    stop: Option<&AtomicBool>,
) -> FusionResult<DriverStatus<EssentialGraphOutcome>> {
    bail_if_stopped!(stop);
    let index = graph.index();
    let loop_index = lookup(&index, graph.loop_keyframe)?;

    let mut problem = Problem::new();
    let before: Vec<Sim3> = graph.keyframes.iter().map(EssentialKeyFrame::initial).collect();
    let mut vertices = Vec::with_capacity(before.len());
    for (i, s_iw) in before.iter().enumerate() {
        let id = problem.add_vertex(Vertex::Sim3 {
            estimate: *s_iw,
            fix_scale: config.fix_scale,
        });
        problem.set_fixed(id, i == loop_index)?;
        vertices.push(id);
    }

    let edges = essential_edges(graph, &index, config.min_covisibility_weight)?;
    for edge in &edges {
        problem.add_factor(
            Factor::Similarity(SimilarityFactor::new(edge.measurement(&graph.keyframes))),
            &[vertices[edge.i], vertices[edge.j]],
        )?;
    }
    let icp = if config.use_icp {
        add_icp_factors(&mut problem, &graph.icp_links, |id| Ok(vertices[lookup(&index, id)?]))?
    } else {
        0
    };

    let Some(summary) = run_solver(&mut problem, &config.solver, config.iterations, stop)? else {
        return Ok(DriverStatus::Cancelled);
    };
    bail_if_stopped!(stop);

    let after = vertices
        .iter()
        .map(|&id| {
            problem
                .vertex(id)?
                .as_sim3()
                .copied()
                .ok_or_else(|| FusionError::InvalidInput(format!("vertex {id} is not a similarity")))
        })
        .collect::<FusionResult<Vec<Sim3>>>()?;
    let landmarks = correct_landmarks(graph, &index, &before, &after)?;
    let keyframes = graph
        .keyframes
        .iter()
        .zip(&after)
        .map(|(kf, s_iw)| CorrectedKeyFrame {
            id: kf.id,
            s_iw: *s_iw,
            t_cw: s_iw.to_se3(),
        })
        .collect();

    info!(
        keyframes = graph.keyframes.len(),
        edges = edges.len(),
        icp,
        initial_cost = summary.initial_cost,
        final_cost = summary.final_cost,
        "essential graph optimized"
    );
    Ok(DriverStatus::Completed(EssentialGraphOutcome {
        keyframes,
        landmarks,
        num_edges: edges.len() + icp,
        summary,
    }))
}

/// Essential graph optimization over yaw and translation only.
///
/// Used on inertial maps, where roll, pitch and scale are fixed by gravity and the IMU.
pub fn optimize_essential_graph_4dof(
    graph: &EssentialGraph,
    config: &EssentialGraphConfig,
    stop: Option<&AtomicBool>,
) -> FusionResult<DriverStatus<EssentialGraphOutcome>> {
    bail_if_stopped!(stop);
    let index = graph.index();
    let loop_index = lookup(&index, graph.loop_keyframe)?;

    let mut problem = Problem::new();
    let before: Vec<SE3> = graph
        .keyframes
        .iter()
        .map(|kf| kf.initial().to_se3())
        .collect();
    let mut vertices = Vec::with_capacity(before.len());
    for (i, (kf, t_cw)) in graph.keyframes.iter().zip(&before).enumerate() {
        let id = problem.add_vertex(Vertex::Pose4Dof(ImuCamPose::from_camera_pose(t_cw, &kf.rig)));
        problem.set_fixed(id, i == loop_index)?;
        vertices.push(id);
    }

    let edges = essential_edges(graph, &index, config.min_covisibility_weight)?;
    for edge in &edges {
        let (ki, kj) = (&graph.keyframes[edge.i], &graph.keyframes[edge.j]);
        let (t_iw, t_jw) = if edge.corrected {
            (before[edge.i], before[edge.j])
        } else {
            (ki.uncorrected().to_se3(), kj.uncorrected().to_se3())
        };
        problem.add_factor(
            Factor::PoseGraph4Dof(PoseGraph4DofFactor::new(t_iw.compose(&t_jw.inverse()))),
            &[vertices[edge.i], vertices[edge.j]],
        )?;
    }
    let icp = if config.use_icp {
        add_icp_factors(&mut problem, &graph.icp_links, |id| Ok(vertices[lookup(&index, id)?]))?
    } else {
        0
    };

    let Some(summary) = run_solver(&mut problem, &config.solver, config.iterations, stop)? else {
        return Ok(DriverStatus::Cancelled);
    };
    bail_if_stopped!(stop);

    let mut after = Vec::with_capacity(vertices.len());
    for &id in &vertices {
        let pose = pose_of(&problem, id)?;
        after.push(pose.cameras.first().map_or_else(|| pose.body_pose().inverse(), |c| c.t_cw));
    }
    let before: Vec<Sim3> = before.iter().map(Sim3::from_se3).collect();
    let after_sim: Vec<Sim3> = after.iter().map(Sim3::from_se3).collect();
    let landmarks = correct_landmarks(graph, &index, &before, &after_sim)?;
    let keyframes = graph
        .keyframes
        .iter()
        .zip(after.iter().zip(&after_sim))
        .map(|(kf, (t_cw, s_iw))| CorrectedKeyFrame {
            id: kf.id,
            s_iw: *s_iw,
            t_cw: *t_cw,
        })
        .collect();

    info!(
        keyframes = graph.keyframes.len(),
        edges = edges.len(),
        icp,
        final_cost = summary.final_cost,
        "4-DoF essential graph optimized"
    );
    Ok(DriverStatus::Completed(EssentialGraphOutcome {
        keyframes,
        landmarks,
        num_edges: edges.len() + icp,
        summary,
    }))
}
