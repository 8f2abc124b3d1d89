//! Lidar factors: ICP relative pose and point-to-plane alignment.

use nalgebra::{Matrix1, Matrix6, SMatrix, Vector1, Vector3, Vector6};

use super::{Linearization, camera_transform_at, pose_at, to_dynamic};
use crate::core::{ProblemResult, Vertex};
use crate::manifold::{LieGroup, SE3, so3};

/// Relative pose between two frames measured by scan registration.
///
/// `e = log(T12⁻¹ · Tc1w · Tc2w⁻¹)`, where `Tciw` is the world-to-camera transformation of
/// the reference camera of each vertex. Vertices: `[pose₁, pose₂]`, each a 6-DoF pose,
/// a 4-DoF pose or a similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct IcpFactor {
    /// Registration result `T12`
    pub t_12: SE3,
    pub information: Matrix6<f64>,
}

impl IcpFactor {
    pub fn new(t_12: SE3, information: Matrix6<f64>) -> Self {
        Self { t_12, information }
    }

    pub(crate) fn error(&self, vertices: &[&Vertex]) -> ProblemResult<Vector6<f64>> {
        let t_c1w = camera_transform_at(vertices, 0, "Icp")?;
        let t_c2w = camera_transform_at(vertices, 1, "Icp")?;
        Ok(self
            .t_12
            .inverse()
            .compose(&t_c1w)
            .compose(&t_c2w.inverse())
            .log())
    }
}

/// Distance of a lidar point to a world plane, `e = s · (n · (Twc · p) + d)`.
///
/// The point is expressed in the frame of mounted sensor `cam`, so `Twc · p` goes through
/// the body pose: `pw = Rwb · (Rbc · p + tbc) + twb`. Vertices: `[pose]`.
#[derive(Debug, Clone, PartialEq)]
pub struct LidarPointToPlaneFactor {
    /// Point in the sensor frame
    pub point: Vector3<f64>,
    /// Unit plane normal in world
    pub normal: Vector3<f64>,
    /// Plane offset, `n · x + d = 0` on the plane
    pub offset: f64,
    /// Residual weight `s`
    pub weight: f64,
    pub cam: usize,
    pub information: Matrix1<f64>,
}

impl LidarPointToPlaneFactor {
    pub fn new(point: Vector3<f64>, normal: Vector3<f64>, offset: f64, weight: f64, cam: usize) -> Self {
        Self {
            point,
            normal,
            offset,
            weight,
            cam,
            information: Matrix1::identity(),
        }
    }

    fn body_point(&self, vertices: &[&Vertex]) -> ProblemResult<(Vector3<f64>, Vector3<f64>)> {
        let pose = pose_at(vertices, 0, "LidarPointToPlane")?;
        let frame = &pose.cameras[self.cam];
        let pb = frame.t_bc.act(&self.point);
        Ok((pb, pose.rwb * pb + pose.twb))
    }

    pub(crate) fn error(&self, vertices: &[&Vertex]) -> ProblemResult<Vector1<f64>> {
        let (_, pw) = self.body_point(vertices)?;
        Ok(Vector1::new(self.weight * (self.normal.dot(&pw) + self.offset)))
    }

    pub(crate) fn linearize(&self, vertices: &[&Vertex]) -> ProblemResult<Linearization> {
        let pose = pose_at(vertices, 0, "LidarPointToPlane")?;
        let (pb, pw) = self.body_point(vertices)?;
        let residual = Vector1::new(self.weight * (self.normal.dot(&pw) + self.offset));

        let mut d_point = SMatrix::<f64, 3, 6>::zeros();
        d_point
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(-pose.rwb * so3::skew(&pb)));
        d_point.fixed_view_mut::<3, 3>(0, 3).copy_from(&pose.rwb);
        let jacobian: SMatrix<f64, 1, 6> = self.weight * self.normal.transpose() * d_point;

        Ok(Linearization::from_fixed(&residual, vec![to_dynamic(&jacobian)]))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::core::ImuCamPose;
    use crate::factors::{Factor, numeric};
    use crate::manifold::Sim3;
    use crate::sensors::{PinholeCamera, RigCalibration};

    fn rig() -> RigCalibration {
        RigCalibration::monocular(
            PinholeCamera::new(400.0, 400.0, 320.0, 240.0),
            SE3::from_rotation_vector(Vector3::new(0.05, 0.0, -0.1), Vector3::new(0.0, 0.1, 0.2)),
        )
    }

    fn pose(rotation: Vector3<f64>, translation: Vector3<f64>) -> ImuCamPose {
        ImuCamPose::from_body_pose(&SE3::from_rotation_vector(rotation, translation), &rig())
    }

    #[test]
    fn test_icp_vanishes_at_measured_relative_pose() {
        let p1 = pose(Vector3::new(0.1, 0.0, 0.2), Vector3::new(1.0, 0.0, 0.0));
        let p2 = pose(Vector3::new(0.0, -0.1, 0.3), Vector3::new(1.5, 0.2, 0.1));
        let t_12 = p1.camera_pose(0).compose(&p2.camera_pose(0).inverse());
        let factor = Factor::Icp(IcpFactor::new(t_12, Matrix6::identity()));

        let v1 = Vertex::Pose(p1);
        let v2 = Vertex::Pose(p2);
        let lin = factor.linearize(&[&v1, &v2]).unwrap();
        assert!(lin.residual.norm() < 1e-12);
        assert_eq!(lin.jacobians[0].shape(), (6, 6));
    }

    #[test]
    fn test_icp_accepts_similarity_vertices() {
        let s1 = Sim3::new(so3::exp(&Vector3::new(0.0, 0.1, 0.0)), Vector3::new(2.0, 0.0, 0.0), 2.0);
        let s2 = Sim3::new(so3::exp(&Vector3::new(0.1, 0.0, 0.0)), Vector3::new(0.0, 1.0, 0.0), 2.0);
        let t_12 = s1.to_se3().compose(&s2.to_se3().inverse());
        let factor = Factor::Icp(IcpFactor::new(t_12, Matrix6::identity()));
        let v1 = Vertex::Sim3 { estimate: s1, fix_scale: false };
        let v2 = Vertex::Sim3 { estimate: s2, fix_scale: true };
        let lin = factor.linearize(&[&v1, &v2]).unwrap();
        assert!(lin.residual.norm() < 1e-12);
        assert_eq!(lin.jacobians[0].shape(), (6, 7));
        assert_eq!(lin.jacobians[1].shape(), (6, 6));
    }

    #[test]
    fn test_point_to_plane_jacobian_matches_numeric() {
        let vertex = Vertex::Pose(pose(Vector3::new(0.2, -0.3, 0.1), Vector3::new(0.5, 1.0, -0.5)));
        let normal = Vector3::new(0.3, -0.2, 0.9).normalize();
        let factor = Factor::LidarPointToPlane(LidarPointToPlaneFactor::new(
            Vector3::new(2.0, -1.0, 4.0),
            normal,
            -1.5,
            0.8,
            0,
        ));
        let analytic = factor.linearize(&[&vertex]).unwrap();
        let numeric = numeric::central_difference(&[&vertex], 1, |v| factor.error(v)).unwrap();
        assert!((&analytic.jacobians[0] - &numeric[0]).abs().max() < 1e-6);
    }

    #[test]
    fn test_point_on_plane_has_zero_error() {
        let p = pose(Vector3::zeros(), Vector3::zeros());
        let pw = p.cameras[0].t_bc.act(&Vector3::new(1.0, 2.0, 3.0));
        let normal = Vector3::z();
        let factor = LidarPointToPlaneFactor::new(Vector3::new(1.0, 2.0, 3.0), normal, -pw.z, 1.0, 0);
        let vertex = Vertex::Pose(p);
        assert!(factor.error(&[&vertex]).unwrap()[0].abs() < 1e-12);
    }
}
