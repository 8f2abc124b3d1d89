//! Reprojection factors of visual observations.
//!
//! All variants compare a measured pixel with the projection of a world point into the
//! camera that observed it, `e = obs - π(Tcw · Xw)`. The pose Jacobian is taken with
//! respect to the body-frame perturbation `[δθ; δt]` of the IMU pose:
//!
//! ```text
//! Xb = Rbc·Xc + tbc
//! ∂e/∂Xw   = -P · Rcw
//! ∂e/∂pose =  P · Rcb · [ -[Xb]x   I ]
//! ```
//!
//! where `P` is the projection Jacobian at `Xc`. The stereo variants append the right
//! image abscissa `u - bf/z`, whose projection row is the first row plus `bf/z²` on `z`.

use nalgebra::{Matrix2, Matrix2x3, Matrix3, SMatrix, Vector2, Vector3};

use super::{Linearization, inverse_depth_at, pose_at, vector3_at};
use crate::core::{ImuCamPose, ProblemResult, Vertex, VertexKind};
use crate::manifold::so3;

/// `[-[Xb]x  I]`, the derivative of the body-frame point with respect to the pose update.
fn body_point_jacobian(xb: &Vector3<f64>) -> SMatrix<f64, 3, 6> {
    let mut jac = SMatrix::<f64, 3, 6>::zeros();
    jac.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-so3::skew(xb)));
    jac.fixed_view_mut::<3, 3>(0, 3).copy_from(&Matrix3::identity());
    jac
}

/// Camera-frame point, body-frame point and `Rcb` of camera `cam`.
fn frames(pose: &ImuCamPose, xw: &Vector3<f64>, cam: usize) -> (Vector3<f64>, Vector3<f64>, Matrix3<f64>) {
    let frame = &pose.cameras[cam];
    let xc = frame.t_cw.rotation * xw + frame.t_cw.translation;
    let xb = frame.t_bc.rotation * xc + frame.t_bc.translation;
    (xc, xb, frame.t_cb.rotation)
}

fn stereo_projection_jacobian(pose: &ImuCamPose, xc: &Vector3<f64>, cam: usize) -> Matrix3<f64> {
    let proj = pose.cameras[cam].camera.project_jacobian(xc);
    let bf = pose.bf.unwrap_or(0.0);
    let mut jac = Matrix3::zeros();
    jac.fixed_view_mut::<2, 3>(0, 0).copy_from(&proj);
    jac.fixed_view_mut::<1, 3>(2, 0).copy_from(&proj.row(0));
    jac[(2, 2)] += bf / (xc.z * xc.z);
    jac
}

/// Monocular observation of a map point.
///
/// Vertices: `[point, pose]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MonoFactor {
    pub obs: Vector2<f64>,
    pub cam: usize,
    pub information: Matrix2<f64>,
}

impl MonoFactor {
    /// Observation with isotropic information `inv_sigma2 · I`.
    pub fn new(obs: Vector2<f64>, cam: usize, inv_sigma2: f64) -> Self {
        Self {
            obs,
            cam,
            information: Matrix2::identity() * inv_sigma2,
        }
    }

    pub(crate) fn error(&self, vertices: &[&Vertex]) -> ProblemResult<Vector2<f64>> {
        let xw = vector3_at(vertices, 0, VertexKind::Point, "Mono")?;
        let pose = pose_at(vertices, 1, "Mono")?;
        Ok(self.obs - pose.project(xw, self.cam))
    }

    pub(crate) fn linearize(&self, vertices: &[&Vertex]) -> ProblemResult<Linearization> {
        let xw = vector3_at(vertices, 0, VertexKind::Point, "Mono")?;
        let pose = pose_at(vertices, 1, "Mono")?;
        let (xc, xb, rcb) = frames(pose, xw, self.cam);
        let proj: Matrix2x3<f64> = pose.cameras[self.cam].camera.project_jacobian(&xc);

        let residual = self.obs - pose.cameras[self.cam].camera.project(&xc);
        let j_point = -proj * pose.cameras[self.cam].t_cw.rotation;
        let j_pose = proj * rcb * body_point_jacobian(&xb);
        Ok(Linearization::from_fixed(&residual, vec![
            super::to_dynamic(&j_point),
            super::to_dynamic(&j_pose),
        ]))
    }
}

/// Monocular observation of a fixed world point, used by pose-only tracking.
///
/// Vertices: `[pose]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MonoOnlyPoseFactor {
    pub obs: Vector2<f64>,
    pub xw: Vector3<f64>,
    pub cam: usize,
    pub information: Matrix2<f64>,
}

impl MonoOnlyPoseFactor {
    pub fn new(obs: Vector2<f64>, xw: Vector3<f64>, cam: usize, inv_sigma2: f64) -> Self {
        Self {
            obs,
            xw,
            cam,
            information: Matrix2::identity() * inv_sigma2,
        }
    }

    pub(crate) fn error(&self, vertices: &[&Vertex]) -> ProblemResult<Vector2<f64>> {
        let pose = pose_at(vertices, 0, "MonoOnlyPose")?;
        Ok(self.obs - pose.project(&self.xw, self.cam))
    }

    pub(crate) fn linearize(&self, vertices: &[&Vertex]) -> ProblemResult<Linearization> {
        let pose = pose_at(vertices, 0, "MonoOnlyPose")?;
        let (xc, xb, rcb) = frames(pose, &self.xw, self.cam);
        let camera = &pose.cameras[self.cam].camera;
        let residual = self.obs - camera.project(&xc);
        let j_pose = camera.project_jacobian(&xc) * rcb * body_point_jacobian(&xb);
        Ok(Linearization::from_fixed(&residual, vec![super::to_dynamic(&j_pose)]))
    }

    /// Whether the fixed point lies in front of the camera at the current pose.
    pub fn is_depth_positive(&self, pose: &ImuCamPose) -> bool {
        pose.is_depth_positive(&self.xw, self.cam)
    }
}

/// Stereo observation `(uL, v, uR)` of a map point.
///
/// Vertices: `[point, pose]`.
#[derive(Debug, Clone, PartialEq)]
pub struct StereoFactor {
    pub obs: Vector3<f64>,
    pub cam: usize,
    pub information: Matrix3<f64>,
}

impl StereoFactor {
    pub fn new(obs: Vector3<f64>, cam: usize, inv_sigma2: f64) -> Self {
        Self {
            obs,
            cam,
            information: Matrix3::identity() * inv_sigma2,
        }
    }

    pub(crate) fn error(&self, vertices: &[&Vertex]) -> ProblemResult<Vector3<f64>> {
        let xw = vector3_at(vertices, 0, VertexKind::Point, "Stereo")?;
        let pose = pose_at(vertices, 1, "Stereo")?;
        Ok(self.obs - pose.project_stereo(xw, self.cam))
    }

    pub(crate) fn linearize(&self, vertices: &[&Vertex]) -> ProblemResult<Linearization> {
        let xw = vector3_at(vertices, 0, VertexKind::Point, "Stereo")?;
        let pose = pose_at(vertices, 1, "Stereo")?;
        let (xc, xb, rcb) = frames(pose, xw, self.cam);
        let proj = stereo_projection_jacobian(pose, &xc, self.cam);

        let residual = self.obs - pose.project_stereo(xw, self.cam);
        let j_point = -proj * pose.cameras[self.cam].t_cw.rotation;
        let j_pose = proj * rcb * body_point_jacobian(&xb);
        Ok(Linearization::from_fixed(&residual, vec![
            super::to_dynamic(&j_point),
            super::to_dynamic(&j_pose),
        ]))
    }
}

/// Stereo observation of a fixed world point.
///
/// Vertices: `[pose]`.
#[derive(Debug, Clone, PartialEq)]
pub struct StereoOnlyPoseFactor {
    pub obs: Vector3<f64>,
    pub xw: Vector3<f64>,
    pub cam: usize,
    pub information: Matrix3<f64>,
}

impl StereoOnlyPoseFactor {
    pub fn new(obs: Vector3<f64>, xw: Vector3<f64>, cam: usize, inv_sigma2: f64) -> Self {
        Self {
            obs,
            xw,
            cam,
            information: Matrix3::identity() * inv_sigma2,
        }
    }

    pub(crate) fn error(&self, vertices: &[&Vertex]) -> ProblemResult<Vector3<f64>> {
        let pose = pose_at(vertices, 0, "StereoOnlyPose")?;
        Ok(self.obs - pose.project_stereo(&self.xw, self.cam))
    }

    pub(crate) fn linearize(&self, vertices: &[&Vertex]) -> ProblemResult<Linearization> {
        let pose = pose_at(vertices, 0, "StereoOnlyPose")?;
        let (xc, xb, rcb) = frames(pose, &self.xw, self.cam);
        let proj = stereo_projection_jacobian(pose, &xc, self.cam);
        let residual = self.obs - pose.project_stereo(&self.xw, self.cam);
        let j_pose = proj * rcb * body_point_jacobian(&xb);
        Ok(Linearization::from_fixed(&residual, vec![super::to_dynamic(&j_pose)]))
    }

    pub fn is_depth_positive(&self, pose: &ImuCamPose) -> bool {
        pose.is_depth_positive(&self.xw, self.cam)
    }
}

/// Monocular observation of an inverse-depth landmark hosted in another frame.
///
/// Vertices: `[inverse depth, pose]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MonoInverseDepthFactor {
    pub obs: Vector2<f64>,
    pub cam: usize,
    pub information: Matrix2<f64>,
}

impl MonoInverseDepthFactor {
    pub fn new(obs: Vector2<f64>, cam: usize, inv_sigma2: f64) -> Self {
        Self {
            obs,
            cam,
            information: Matrix2::identity() * inv_sigma2,
        }
    }

    pub(crate) fn error(&self, vertices: &[&Vertex]) -> ProblemResult<Vector2<f64>> {
        let point = inverse_depth_at(vertices, 0, "MonoInverseDepth")?;
        let pose = pose_at(vertices, 1, "MonoInverseDepth")?;
        Ok(self.obs - pose.project(&point.world_point(), self.cam))
    }

    pub(crate) fn linearize(&self, vertices: &[&Vertex]) -> ProblemResult<Linearization> {
        let point = inverse_depth_at(vertices, 0, "MonoInverseDepth")?;
        let pose = pose_at(vertices, 1, "MonoInverseDepth")?;
        let xw = point.world_point();
        let (xc, xb, rcb) = frames(pose, &xw, self.cam);
        let camera = &pose.cameras[self.cam].camera;
        let proj = camera.project_jacobian(&xc);

        let residual = self.obs - camera.project(&xc);
        let j_rho = -proj * pose.cameras[self.cam].t_cw.rotation * point.world_point_jacobian();
        let j_pose = proj * rcb * body_point_jacobian(&xb);
        Ok(Linearization::from_fixed(&residual, vec![
            super::to_dynamic(&j_rho),
            super::to_dynamic(&j_pose),
        ]))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::core::InvDepthPoint;
    use crate::factors::{Factor, numeric};
    use crate::manifold::{LieGroup, SE3};
    use crate::sensors::{PinholeCamera, RigCalibration};

    fn stereo_rig() -> RigCalibration {
        let camera = PinholeCamera::new(458.0, 457.0, 367.0, 248.0);
        let t_cb = SE3::from_rotation_vector(
            Vector3::new(-0.02, 0.01, 1.55),
            Vector3::new(0.06, -0.02, 0.01),
        );
        RigCalibration::rectified_stereo(camera, t_cb, 50.0)
    }

    fn pose() -> ImuCamPose {
        let t_wb =
            SE3::from_rotation_vector(Vector3::new(0.1, -0.2, 0.3), Vector3::new(0.5, -1.0, 2.0));
        ImuCamPose::from_body_pose(&t_wb, &stereo_rig())
    }

    fn point_in_front(pose: &ImuCamPose) -> Vector3<f64> {
        pose.camera_pose(0).inverse().act(&Vector3::new(0.4, -0.3, 5.0))
    }

    fn assert_jacobians_match(factor: &Factor, vertices: &[&Vertex]) {
        let analytic = factor.linearize(vertices).unwrap();
        let numeric =
            numeric::central_difference(vertices, factor.dimension(), |v| factor.error(v)).unwrap();
        for (slot, (a, n)) in analytic.jacobians.iter().zip(numeric.iter()).enumerate() {
            let diff = (a - n).abs().max();
            assert!(diff < 1e-4, "{} slot {slot}: diff {diff}", factor.name());
        }
    }

    #[test]
    fn test_mono_error_is_zero_at_true_projection() {
        let pose = pose();
        let xw = point_in_front(&pose);
        let factor = Factor::Mono(MonoFactor::new(pose.project(&xw, 0), 0, 1.0));
        let point = Vertex::Point(xw);
        let pose = Vertex::Pose(pose);
        assert!(factor.error(&[&point, &pose]).unwrap().norm() < 1e-12);
    }

    #[test]
    fn test_mono_jacobians_match_numeric() {
        let pose = pose();
        let xw = point_in_front(&pose);
        let obs = pose.project(&xw, 0) + Vector2::new(1.5, -2.0);
        let factor = Factor::Mono(MonoFactor::new(obs, 0, 1.0));
        let point = Vertex::Point(xw);
        let pose = Vertex::Pose(pose);
        assert_jacobians_match(&factor, &[&point, &pose]);
    }

    #[test]
    fn test_mono_only_pose_jacobian_matches_numeric() {
        let pose = pose();
        let xw = point_in_front(&pose);
        let factor = Factor::MonoOnlyPose(MonoOnlyPoseFactor::new(
            pose.project(&xw, 0),
            xw + Vector3::new(0.1, 0.0, 0.0),
            0,
            1.0,
        ));
        let pose = Vertex::Pose(pose);
        assert_jacobians_match(&factor, &[&pose]);
    }

    #[test]
    fn test_stereo_jacobians_match_numeric() {
        let pose = pose();
        let xw = point_in_front(&pose);
        let obs = pose.project_stereo(&xw, 0) + Vector3::new(0.5, 0.5, -1.0);
        let factor = Factor::Stereo(StereoFactor::new(obs, 0, 1.0));
        let point = Vertex::Point(xw);
        let only_pose = Factor::StereoOnlyPose(StereoOnlyPoseFactor::new(obs, xw, 0, 1.0));
        let pose = Vertex::Pose(pose);
        assert_jacobians_match(&factor, &[&point, &pose]);
        assert_jacobians_match(&only_pose, &[&pose]);
    }

    #[test]
    fn test_inverse_depth_jacobians_match_numeric() {
        let host = pose();
        let camera = host.cameras[0].camera;
        let xc = Vector3::new(0.4, -0.3, 5.0);
        let host_point = InvDepthPoint::new(
            1.0 / xc.z,
            camera.project(&xc),
            camera,
            host.bf,
            host.camera_pose(0).inverse(),
        );
        let target = {
            let mut target = host.clone();
            target.update(&[0.01, -0.02, 0.03, 0.2, 0.1, -0.1]);
            target
        };
        let obs = target.project(&host_point.world_point(), 0) + Vector2::new(1.0, 1.0);
        let factor = Factor::MonoInverseDepth(MonoInverseDepthFactor::new(obs, 0, 1.0));
        let point = Vertex::InverseDepth(host_point);
        let pose = Vertex::Pose(target);
        assert_jacobians_match(&factor, &[&point, &pose]);
    }

    #[test]
    fn test_point_behind_camera_is_detected() {
        let pose = pose();
        let behind = pose.camera_pose(0).inverse().act(&Vector3::new(0.0, 0.0, -2.0));
        let factor = MonoOnlyPoseFactor::new(Vector2::zeros(), behind, 0, 1.0);
        assert!(!factor.is_depth_positive(&pose));
    }
}
