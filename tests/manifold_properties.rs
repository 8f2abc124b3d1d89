//! Properties of the manifold kernel, the parameter block updates and marginalization

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use fusion_solver::core::{ImuCamPose, Vertex};
use fusion_solver::factors::{Factor, MonoFactor};
use fusion_solver::linalg::marginalize;
use fusion_solver::manifold::{LieGroup, SE3, Sim3, Vector7, so3};
use nalgebra::{DMatrix, Matrix3, Vector2, Vector3, Vector6};

use synthetic_scene::*;

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[test]
fn test_exp_of_zero_is_identity() {
    assert_eq!(so3::exp(&Vector3::zeros()), Matrix3::identity());
    assert_eq!(SE3::exp(&Vector6::zeros()), SE3::identity());
    assert_eq!(so3::log(&Matrix3::identity()), Vector3::zeros());
    assert!(Sim3::identity().log().norm() < 1e-15);
}

#[test]
fn test_exp_log_round_trip_on_both_branches() {
    let small = Vector3::new(1e-7, -2e-7, 5e-8);
    let large = Vector3::new(0.8, -1.1, 0.4);
    for w in [small, large] {
        let r = so3::exp(&w);
        let back = so3::exp(&so3::log(&r));
        assert!((back - r).norm() < 1e-10, "round trip failed for {w:?}");
    }

    let tangent = Vector7::from_column_slice(&[0.3, -0.2, 0.1, 1.0, -0.5, 2.0, 0.4]);
    let s = Sim3::exp(&tangent);
    assert!((s.log() - tangent).norm() < 1e-9);
    assert!((s.scale - 0.4f64.exp()).abs() < 1e-12);
}

#[test]
fn test_zero_pose_update_is_bit_identical() {
    let t_wb = SE3::from_rotation_vector(Vector3::new(0.1, 0.2, -0.3), Vector3::new(1.0, 2.0, 3.0));
    let mut vertex = Vertex::Pose(ImuCamPose::from_body_pose(&t_wb, &mono_rig()));
    let before = vertex.as_pose().unwrap().body_pose();
    vertex.oplus(&[0.0; 6]);
    assert_eq!(vertex.as_pose().unwrap().body_pose(), before);
}

#[test]
fn test_scale_update_is_multiplicative() {
    let mut scale = Vertex::Scale(2.0);
    scale.oplus(&[-5.0]);
    let value = scale.as_scale().unwrap();
    assert!(value > 0.0);
    assert!((value - 2.0 * (-5.0f64).exp()).abs() < 1e-15);
}

#[test]
fn test_4dof_update_changes_yaw_only() {
    let t_wb = SE3::from_rotation_vector(Vector3::new(0.2, -0.1, 0.5), Vector3::zeros());
    let mut vertex = Vertex::Pose4Dof(ImuCamPose::from_body_pose(&t_wb, &mono_rig()));
    vertex.oplus(&[0.3, 1.0, 0.0, -1.0]);
    let pose = vertex.as_pose().unwrap();

    // gravity direction in the body frame is unchanged by a rotation about world z
    let z_before = t_wb.rotation.transpose() * Vector3::z();
    let z_after = pose.rwb.transpose() * Vector3::z();
    assert!((z_before - z_after).norm() < 1e-12);
    assert!((pose.twb - Vector3::new(1.0, 0.0, -1.0)).norm() < 1e-15);
}

#[test]
fn test_marginalization_edge_cases() -> TestResult {
    let h = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.5, 1.0, 3.0, 0.2, 0.5, 0.2, 2.0]);
    assert_eq!(marginalize(&h, 1..1)?, h);
    assert_eq!(marginalize(&h, 0..3)?, DMatrix::zeros(3, 3));
    Ok(())
}

#[test]
fn test_mono_error_vanishes_at_true_projection() -> TestResult {
    let t_wb = keyframe_poses(2)[1];
    let pose = ImuCamPose::from_body_pose(&t_wb, &mono_rig());
    let point = scene_points(1)[0];
    let factor = Factor::Mono(MonoFactor::new(pose.project(&point, 0), 0, 1.0));
    let error = factor.error(&[&Vertex::Point(point), &Vertex::Pose(pose)])?;
    assert!(error.norm() < 1e-12);

    let shifted = Factor::Mono(MonoFactor::new(Vector2::new(0.0, 0.0), 0, 1.0));
    let pose = ImuCamPose::from_body_pose(&t_wb, &mono_rig());
    assert!(shifted.error(&[&Vertex::Point(point), &Vertex::Pose(pose)])?.norm() > 1.0);
    Ok(())
}
