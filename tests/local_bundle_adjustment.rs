//! Visual bundle adjustment on synthetic scenes
//!
//! Three keyframes observe ten points with 1 px of noise; the first keyframe is fixed and
//! the others, together with the points, start from perturbed estimates.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use fusion_solver::drivers::{
    BundleAdjustmentConfig, MapSnapshot, Observation, global_bundle_adjustment,
    local_bundle_adjustment,
};
use fusion_solver::manifold::{LieGroup, SE3};
use fusion_solver::{FusionError, init_logger};
use nalgebra::{Vector2, Vector3};
use tracing::info;

use synthetic_scene::*;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn perturbed_map(sigma: f64, seed: u64) -> (MapSnapshot, Vec<Vector3<f64>>) {
    let poses = keyframe_poses(3);
    let points = scene_points(10);
    let mut map = observed_map(&poses, &points, &mono_rig(), sigma, seed);

    map.keyframes[0].fixed = true;
    for (k, kf) in map.keyframes.iter_mut().enumerate().skip(1) {
        let delta = SE3::from_rotation_vector(
            Vector3::new(0.004, -0.003, 0.002) * k as f64,
            Vector3::new(0.02, -0.015, 0.01) * k as f64,
        );
        kf.t_wb = kf.t_wb.compose(&delta);
    }
    for (i, lm) in map.landmarks.iter_mut().enumerate() {
        let s = if i % 2 == 0 { 1.0 } else { -1.0 };
        lm.position += Vector3::new(0.05 * s, -0.04, 0.08 * s);
    }
    (map, points)
}

fn initial_estimates(map: &MapSnapshot) -> (Vec<(usize, SE3)>, Vec<(usize, Vector3<f64>)>) {
    (
        map.keyframes.iter().map(|kf| (kf.id, kf.t_wb)).collect(),
        map.landmarks.iter().map(|lm| (lm.id, lm.position)).collect(),
    )
}

#[test]
fn test_local_ba_reduces_reprojection_rmse() -> TestResult {
    init_logger();
    let (map, _) = perturbed_map(1.0, 7);
    let (poses, landmarks) = initial_estimates(&map);
    let before = reprojection_rmse(&map, &poses, &landmarks);

    let outcome = local_bundle_adjustment(&map, &BundleAdjustmentConfig::default(), None)?
        .completed()
        .expect("not cancelled");
    let after = reprojection_rmse(&map, &outcome.keyframes, &outcome.landmarks);
    info!(before, after, outliers = outcome.outliers.len(), "local BA");

    assert!(after < before, "RMSE went from {before} to {after}");
    assert!(after < 2.0);
    assert_eq!(outcome.keyframes.len(), 2);
    assert_eq!(outcome.landmarks.len(), 10);
    assert_eq!(outcome.summaries.len(), 2);
    Ok(())
}

#[test]
fn test_local_ba_reports_gross_outlier() -> TestResult {
    let (mut map, _) = perturbed_map(0.5, 11);
    map.keyframes[2].observations[3].pixel += Vector2::new(35.0, -30.0);

    let outcome = local_bundle_adjustment(&map, &BundleAdjustmentConfig::default(), None)?
        .completed()
        .expect("not cancelled");
    assert!(outcome.outliers.contains(&(2, 1003)));
    Ok(())
}

#[test]
fn test_stereo_global_ba_converges() -> TestResult {
    let poses = keyframe_poses(4);
    let mut map = observed_map(&poses, &scene_points(25), &stereo_rig(), 0.5, 3);
    for lm in &mut map.landmarks {
        lm.position += Vector3::new(0.03, 0.03, -0.05);
    }
    let (initial_poses, initial_points) = initial_estimates(&map);
    let before = reprojection_rmse(&map, &initial_poses, &initial_points);

    let config = BundleAdjustmentConfig::new().with_iterations(10);
    let outcome = global_bundle_adjustment(&map, &config, None)?
        .completed()
        .expect("not cancelled");
    let after = reprojection_rmse(&map, &outcome.keyframes, &outcome.landmarks);
    assert!(after < before);
    assert!(outcome.not_optimized.is_empty());
    assert_eq!(outcome.keyframes[0].1, poses[0]);
    Ok(())
}

#[test]
fn test_observation_of_missing_landmark_fails() {
    let (mut map, _) = perturbed_map(0.0, 1);
    map.keyframes[1]
        .observations
        .push(Observation::mono(5, Vector2::new(10.0, 10.0), 0, 1.0));
    let result = global_bundle_adjustment(&map, &BundleAdjustmentConfig::default(), None);
    assert!(matches!(result, Err(FusionError::UnknownLandmark(5))));
}
