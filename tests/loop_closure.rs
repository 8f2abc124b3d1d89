//! Loop correction on a drifting trajectory and two-view similarity refinement

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use fusion_solver::drivers::{
    EssentialGraph, EssentialGraphConfig, EssentialKeyFrame, EssentialLandmark, Sim3Alignment,
    Sim3Config, Sim3Match, optimize_essential_graph, optimize_essential_graph_4dof, optimize_sim3,
};
use fusion_solver::manifold::{LieGroup, SE3, Sim3, so3};
use nalgebra::Vector3;
use rand::SeedableRng;
use rand::rngs::StdRng;

use synthetic_scene::*;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const LOOP_LENGTH: usize = 8;

/// Camera poses `Tcw` around a circle of radius 2 m, yawing about world z.
fn circle() -> Vec<SE3> {
    (0..LOOP_LENGTH)
        .map(|k| {
            let angle = 2.0 * std::f64::consts::PI * k as f64 / LOOP_LENGTH as f64;
            let t_wc = SE3::from_rotation_vector(
                Vector3::new(0.0, 0.0, angle),
                Vector3::new(2.0 * angle.cos(), 2.0 * angle.sin(), 0.0),
            );
            t_wc.inverse()
        })
        .collect()
}

/// World-frame drift of keyframe `k`: yaw and translation growing along the trajectory.
fn drift(k: usize) -> SE3 {
    let k = k as f64;
    SE3::from_rotation_vector(Vector3::new(0.0, 0.0, 0.01 * k), Vector3::new(0.02 * k, -0.015 * k, 0.0))
}

fn pose_error(a: &SE3, b: &SE3) -> f64 {
    let delta = a.compose(&b.inverse());
    delta.translation.norm() + so3::log(&delta.rotation).norm()
}

/// Residuals of the chain edges and of the loop edge for the camera poses `t_cw`.
///
/// Chain edges are measured on the drifted poses and the loop edge on the corrected
/// current pose, as the graph driver does.
fn edge_residuals(graph: &EssentialGraph, t_cw: &[SE3]) -> Vec<f64> {
    let drifted: Vec<SE3> = graph.keyframes.iter().map(|kf| kf.t_cw).collect();
    let relative = |poses: &[SE3], i: usize, j: usize| poses[j].compose(&poses[i].inverse());
    let mut residuals: Vec<f64> = (1..LOOP_LENGTH)
        .map(|k| pose_error(&relative(t_cw, k - 1, k), &relative(&drifted, k - 1, k)))
        .collect();
    let last = LOOP_LENGTH - 1;
    let corrected = graph.keyframes[last]
        .corrected
        .expect("current keyframe is corrected")
        .to_se3();
    let loop_measurement = corrected.compose(&drifted[0].inverse());
    residuals.push(pose_error(&relative(t_cw, 0, last), &loop_measurement));
    residuals
}

/// Starting poses: the corrected current keyframe, every other one as drifted.
fn initial_poses(graph: &EssentialGraph) -> Vec<SE3> {
    graph
        .keyframes
        .iter()
        .map(|kf| kf.corrected.map(|s| s.to_se3()).unwrap_or(kf.t_cw))
        .collect()
}

fn max(values: &[f64]) -> f64 {
    values.iter().copied().fold(0.0, f64::max)
}

/// The whole loop error sits on the edge into the current keyframe before optimization.
/// After it, no edge keeps more than half of it and every edge of the cycle takes a share.
fn assert_error_spread(graph: &EssentialGraph, optimized: &[SE3]) {
    let before = edge_residuals(graph, &initial_poses(graph));
    let concentrated = before[LOOP_LENGTH - 2];
    assert!(concentrated > 1e-2);
    assert!(max(&before) - concentrated < 1e-12, "residuals before {before:?}");

    let after = edge_residuals(graph, optimized);
    assert!(max(&after) < 0.5 * concentrated, "residuals after {after:?}");
    assert!(
        after.iter().all(|&r| r > 1e-3 * concentrated),
        "residuals after {after:?}"
    );
}

/// Drifted chain closed by the current keyframe matching keyframe 0.
fn drifted_loop() -> EssentialGraph {
    let truth = circle();
    let rig = mono_rig();
    let last = LOOP_LENGTH - 1;
    let keyframes = truth
        .iter()
        .enumerate()
        .map(|(k, t_cw)| EssentialKeyFrame {
            id: k,
            t_cw: t_cw.compose(&drift(k)),
            corrected: (k == last).then(|| Sim3::from_se3(t_cw)),
            parent: k.checked_sub(1),
            loop_edges: Vec::new(),
            covisibility: Vec::new(),
            rig: rig.clone(),
        })
        .collect();
    EssentialGraph {
        keyframes,
        landmarks: vec![EssentialLandmark {
            id: 77,
            position: Vector3::new(0.5, 0.0, 1.0),
            reference: 3,
        }],
        loop_keyframe: 0,
        current_keyframe: last,
        new_connections: vec![(last, vec![0])],
        icp_links: Vec::new(),
    }
}

#[test]
fn test_sim3_graph_spreads_loop_error() -> TestResult {
    let graph = drifted_loop();
    let config = EssentialGraphConfig::new().with_fix_scale(true);
    let outcome = optimize_essential_graph(&graph, &config, None)?
        .completed()
        .expect("not cancelled");

    assert_eq!(outcome.num_edges, LOOP_LENGTH);
    assert!(outcome.summary.final_cost < outcome.summary.initial_cost);
    assert!(pose_error(&outcome.keyframes[0].t_cw, &graph.keyframes[0].t_cw) < 1e-12);
    let optimized: Vec<SE3> = outcome.keyframes.iter().map(|kf| kf.t_cw).collect();
    assert_error_spread(&graph, &optimized);

    // the landmark stays put in the frame of its reference keyframe
    let (id, corrected) = outcome.landmarks[0];
    assert_eq!(id, 77);
    let in_reference = graph.keyframes[3].t_cw.act(&Vector3::new(0.5, 0.0, 1.0));
    assert!((outcome.keyframes[3].s_iw.act(&corrected) - in_reference).norm() < 1e-9);
    Ok(())
}

#[test]
fn test_4dof_graph_spreads_loop_error() -> TestResult {
    let graph = drifted_loop();
    let outcome = optimize_essential_graph_4dof(&graph, &EssentialGraphConfig::default(), None)?
        .completed()
        .expect("not cancelled");

    assert!(outcome.summary.final_cost < outcome.summary.initial_cost);
    let optimized: Vec<SE3> = outcome.keyframes.iter().map(|kf| kf.t_cw).collect();
    assert_error_spread(&graph, &optimized);
    for k in 2..LOOP_LENGTH - 1 {
        // roll and pitch untouched: the optical axis keeps its height
        let z_before = graph.keyframes[k].t_cw.rotation * Vector3::z();
        let z_after = outcome.keyframes[k].t_cw.rotation * Vector3::z();
        assert!((z_before - z_after).norm() < 1e-9);
    }
    Ok(())
}

#[test]
fn test_sim3_and_4dof_graphs_agree_on_yaw_drift() -> TestResult {
    let graph = drifted_loop();
    let sim3 = optimize_essential_graph(&graph, &EssentialGraphConfig::new().with_fix_scale(true), None)?
        .completed()
        .expect("not cancelled");
    let four_dof = optimize_essential_graph_4dof(&graph, &EssentialGraphConfig::default(), None)?
        .completed()
        .expect("not cancelled");
    for (a, b) in sim3.keyframes.iter().zip(&four_dof.keyframes) {
        assert!(pose_error(&a.t_cw, &b.t_cw) < 1e-5, "keyframe {}", a.id);
    }
    Ok(())
}

fn noisy_alignment(truth: &Sim3, guess: Sim3, count: usize, seed: u64) -> Sim3Alignment {
    let camera = camera();
    let mut rng = StdRng::seed_from_u64(seed);
    let matches = scene_points(count)
        .into_iter()
        .map(|point2| {
            let point1 = truth.act(&point2);
            Sim3Match {
                point1,
                point2,
                pixel1: camera.project(&point1) + pixel_noise(&mut rng, 0.5),
                pixel2: camera.project(&point2) + pixel_noise(&mut rng, 0.5),
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

#[test]
fn test_sim3_alignment_recovers_scale_under_noise() -> TestResult {
    let truth = Sim3::new(so3::exp(&Vector3::new(0.02, -0.05, 0.01)), Vector3::new(0.3, 0.1, -0.2), 1.3);
    let guess = Sim3::new(
        so3::exp(&Vector3::new(0.03, -0.04, 0.0)),
        Vector3::new(0.25, 0.12, -0.15),
        1.2,
    );
    let outcome = optimize_sim3(&noisy_alignment(&truth, guess, 60, 21), &Sim3Config::default(), None)?
        .completed()
        .expect("not cancelled");

    assert!(outcome.num_inliers >= 55);
    assert!((outcome.s12.scale - 1.3).abs() < 0.02, "scale {}", outcome.s12.scale);
    let information = outcome.information;
    assert!((information - information.transpose()).norm() < 1e-6 * information.norm());
    assert!(information.symmetric_eigen().eigenvalues.iter().all(|&v| v > 0.0));
    Ok(())
}
