//! Prior constraints carried between optimization calls.
//!
//! A prior is a `(mean, information)` pair. The information typically comes out of a
//! marginalization and is only approximately positive semi-definite, so it is symmetrized
//! and eigenvalue-floored on construction.

use nalgebra::{DMatrix, Matrix3, Matrix6, SMatrix, Vector3, Vector6};
use serde::{Deserialize, Serialize};

use super::{Linearization, camera_transform_at, pose_at, to_dynamic, vector3_at};
use crate::core::{ImuCamPose, ProblemResult, Vertex, VertexKind};
use crate::linalg::floor_information;
use crate::manifold::{LieGroup, SE3, so3};
use crate::sensors::ImuBias;

fn floored<const N: usize>(information: &SMatrix<f64, N, N>) -> SMatrix<f64, N, N> {
    let dynamic = DMatrix::from_column_slice(N, N, information.as_slice());
    SMatrix::from_column_slice(floor_information(&dynamic).as_slice())
}

/// Prior on pose, velocity and biases of one frame.
///
/// The information is ordered as rotation, translation, velocity, gyro bias, accel bias.
/// Vertices: `[pose, velocity, gyro bias, acc bias]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseImuPrior {
    pub rwb: Matrix3<f64>,
    pub twb: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub bias: ImuBias,
    pub information: SMatrix<f64, 15, 15>,
}

impl PoseImuPrior {
    pub fn new(
        rwb: Matrix3<f64>,
        twb: Vector3<f64>,
        velocity: Vector3<f64>,
        bias: ImuBias,
        information: &SMatrix<f64, 15, 15>,
    ) -> Self {
        Self {
            rwb,
            twb,
            velocity,
            bias,
            information: floored(information),
        }
    }

    /// Prior centred on the current state of `pose`.
    pub fn at_pose(
        pose: &ImuCamPose,
        velocity: Vector3<f64>,
        bias: ImuBias,
        information: &SMatrix<f64, 15, 15>,
    ) -> Self {
        Self::new(pose.rwb, pose.twb, velocity, bias, information)
    }

    pub(crate) fn error(&self, vertices: &[&Vertex]) -> ProblemResult<SMatrix<f64, 15, 1>> {
        let pose = pose_at(vertices, 0, "PriorPoseImu")?;
        let velocity = vector3_at(vertices, 1, VertexKind::Velocity, "PriorPoseImu")?;
        let gyro = vector3_at(vertices, 2, VertexKind::GyroBias, "PriorPoseImu")?;
        let acc = vector3_at(vertices, 3, VertexKind::AccBias, "PriorPoseImu")?;

        let rpw = self.rwb.transpose();
        let mut error = SMatrix::<f64, 15, 1>::zeros();
        error
            .fixed_rows_mut::<3>(0)
            .copy_from(&so3::log(&(rpw * pose.rwb)));
        error
            .fixed_rows_mut::<3>(3)
            .copy_from(&(rpw * (pose.twb - self.twb)));
        error
            .fixed_rows_mut::<3>(6)
            .copy_from(&(velocity - self.velocity));
        error
            .fixed_rows_mut::<3>(9)
            .copy_from(&(gyro - self.bias.gyro));
        error
            .fixed_rows_mut::<3>(12)
            .copy_from(&(acc - self.bias.acc));
        Ok(error)
    }

    pub(crate) fn linearize(&self, vertices: &[&Vertex]) -> ProblemResult<Linearization> {
        let residual = self.error(vertices)?;
        let pose = pose_at(vertices, 0, "PriorPoseImu")?;
        let er = residual.fixed_rows::<3>(0).into_owned();

        let mut j_pose = SMatrix::<f64, 15, 6>::zeros();
        j_pose
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&so3::inverse_right_jacobian(&er));
        j_pose
            .fixed_view_mut::<3, 3>(3, 3)
            .copy_from(&(self.rwb.transpose() * pose.rwb));

        let block = |row: usize| {
            let mut j = SMatrix::<f64, 15, 3>::zeros();
            j.fixed_view_mut::<3, 3>(row, 0)
                .copy_from(&Matrix3::identity());
            to_dynamic(&j)
        };

        Ok(Linearization::from_fixed(&residual, vec![
            to_dynamic(&j_pose),
            block(6),
            block(9),
            block(12),
        ]))
    }
}

/// Prior on the camera pose of a frame, `e = log(Twc_prior · Tcw)`.
///
/// Vertices: `[pose]` (6-DoF, 4-DoF or Sim3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosePrior {
    /// Prior camera-to-world transformation
    pub t_wc: SE3,
    pub information: Matrix6<f64>,
}

impl PosePrior {
    pub fn new(t_wc: SE3, information: &Matrix6<f64>) -> Self {
        Self {
            t_wc,
            information: floored(information),
        }
    }

    pub(crate) fn error(&self, vertices: &[&Vertex]) -> ProblemResult<Vector6<f64>> {
        let t_cw = camera_transform_at(vertices, 0, "PriorPose")?;
        Ok(self.t_wc.compose(&t_cw).log())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::factors::{Factor, numeric};
    use crate::sensors::{PinholeCamera, RigCalibration};

    fn rig() -> RigCalibration {
        RigCalibration::monocular(
            PinholeCamera::new(400.0, 400.0, 320.0, 240.0),
            SE3::from_rotation_vector(Vector3::new(0.0, 0.1, 0.0), Vector3::new(0.1, 0.0, 0.0)),
        )
    }

    fn states() -> Vec<Vertex> {
        let t_wb =
            SE3::from_rotation_vector(Vector3::new(0.2, -0.1, 0.4), Vector3::new(1.0, 0.5, -0.3));
        vec![
            Vertex::Pose(ImuCamPose::from_body_pose(&t_wb, &rig())),
            Vertex::Velocity(Vector3::new(0.3, 0.0, -0.1)),
            Vertex::GyroBias(Vector3::new(0.001, 0.002, 0.0)),
            Vertex::AccBias(Vector3::new(0.01, 0.0, -0.02)),
        ]
    }

    #[test]
    fn test_prior_at_current_state_has_zero_error() {
        let vertices = states();
        let pose = vertices[0].as_pose().unwrap();
        let prior = PoseImuPrior::at_pose(
            pose,
            *vertices[1].as_vector3().unwrap(),
            ImuBias::new(*vertices[2].as_vector3().unwrap(), *vertices[3].as_vector3().unwrap()),
            &SMatrix::identity(),
        );
        let refs: Vec<&Vertex> = vertices.iter().collect();
        let error = Factor::PriorPoseImu(prior).error(&refs).unwrap();
        assert!(error.norm() < 1e-12);
    }

    #[test]
    fn test_pose_imu_prior_jacobians_match_numeric() {
        let vertices = states();
        let prior = PoseImuPrior::new(
            so3::exp(&Vector3::new(0.25, -0.05, 0.35)),
            Vector3::new(0.9, 0.6, -0.2),
            Vector3::new(0.2, 0.1, 0.0),
            ImuBias::default(),
            &SMatrix::identity(),
        );
        let factor = Factor::PriorPoseImu(prior);
        let refs: Vec<&Vertex> = vertices.iter().collect();
        let analytic = factor.linearize(&refs).unwrap();
        let numeric = numeric::central_difference(&refs, 15, |v| factor.error(v)).unwrap();
        for (a, n) in analytic.jacobians.iter().zip(numeric.iter()) {
            assert!((a - n).abs().max() < 1e-6);
        }
    }

    #[test]
    fn test_information_is_floored() {
        let mut information = SMatrix::<f64, 15, 15>::identity();
        information[(0, 0)] = -3.0;
        information[(1, 2)] = 1e-3;
        let prior = PoseImuPrior::new(
            Matrix3::identity(),
            Vector3::zeros(),
            Vector3::zeros(),
            ImuBias::default(),
            &information,
        );
        let eigen = prior.information.symmetric_eigen();
        assert!(eigen.eigenvalues.iter().all(|&l| l >= -1e-12));
        assert!((prior.information - prior.information.transpose()).norm() < 1e-12);
    }

    #[test]
    fn test_pose_prior_vanishes_at_prior() {
        let vertices = states();
        let pose = vertices[0].as_pose().unwrap();
        let prior = PosePrior::new(pose.camera_pose(0).inverse(), &Matrix6::identity());
        let factor = Factor::PriorPose(prior);
        let lin = factor.linearize(&[&vertices[0]]).unwrap();
        assert!(lin.residual.norm() < 1e-12);
        assert_eq!(lin.jacobians[0].shape(), (6, 6));
    }
}
