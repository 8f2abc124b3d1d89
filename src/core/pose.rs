//! Body pose with rigidly attached cameras.
//!
//! The optimized quantity is the body-to-world transformation `Twb`. Every visual factor
//! needs the world-to-camera transformation of the camera that made the observation, so
//! `Tcw = Tcb · Twb⁻¹` is cached per mounted camera and refreshed after each update.
//!
//! Two update rules are supported:
//!
//! - [`ImuCamPose::update`] perturbs the body frame (6 DoF), `Rwb ← Rwb·Exp(δθ)`,
//!   `twb ← twb + Rwb·δt`
//! - [`ImuCamPose::update_world`] perturbs the world frame and only changes yaw and
//!   translation (4 DoF), used by the inertial pose graph where roll and pitch are
//!   observable from gravity

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::manifold::{LieGroup, SE3, so3};
use crate::sensors::{PinholeCamera, RigCalibration};

/// Body rotation is re-orthonormalized every this many body-frame updates.
const BODY_NORMALIZE_PERIOD: usize = 3;
/// The yaw increment is re-orthonormalized every this many world-frame updates.
const WORLD_NORMALIZE_PERIOD: usize = 5;

/// Cached state of one mounted camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraFrame {
    pub camera: PinholeCamera,
    /// Body-to-camera transformation `Tcb`
    pub t_cb: SE3,
    /// Camera-to-body transformation `Tbc`
    pub t_bc: SE3,
    /// World-to-camera transformation `Tcw`, derived from the body pose
    pub t_cw: SE3,
}

/// Pose of the IMU body together with the cameras mounted on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImuCamPose {
    /// Body-to-world rotation
    pub rwb: Matrix3<f64>,
    /// Body position in world
    pub twb: Vector3<f64>,
    /// Mounted cameras, index 0 is the reference camera
    pub cameras: Vec<CameraFrame>,
    /// Stereo baseline times focal length
    pub bf: Option<f64>,
    /// Body rotation when the 4-DoF accumulation started
    pub rwb0: Matrix3<f64>,
    /// Accumulated world-frame rotation increment of 4-DoF updates
    pub dr: Matrix3<f64>,
    its: usize,
}

impl ImuCamPose {
    /// Create from the body pose `Twb` and the rig calibration.
    pub fn from_body_pose(t_wb: &SE3, rig: &RigCalibration) -> Self {
        let cameras = rig
            .mounts
            .iter()
            .map(|mount| CameraFrame {
                camera: mount.camera,
                t_cb: mount.t_cb,
                t_bc: mount.t_cb.inverse(),
                t_cw: SE3::identity(),
            })
            .collect();
        let mut pose = Self {
            rwb: t_wb.rotation,
            twb: t_wb.translation,
            cameras,
            bf: rig.bf,
            rwb0: t_wb.rotation,
            dr: Matrix3::identity(),
            its: 0,
        };
        pose.refresh_camera_poses();
        pose
    }

    /// Create from the world-to-camera pose `Tcw` of the reference camera.
    pub fn from_camera_pose(t_cw: &SE3, rig: &RigCalibration) -> Self {
        let t_wb = match rig.mounts.first() {
            Some(mount) => t_cw.inverse().compose(&mount.t_cb),
            None => t_cw.inverse(),
        };
        Self::from_body_pose(&t_wb, rig)
    }

    /// Body-to-world transformation `Twb`.
    pub fn body_pose(&self) -> SE3 {
        SE3::new(self.rwb, self.twb)
    }

    /// World-to-camera transformation `Tcw` of camera `cam`.
    ///
    /// # Panics
    ///
    /// Panics if `cam` is not a mounted camera index.
    pub fn camera_pose(&self, cam: usize) -> SE3 {
        self.cameras[cam].t_cw
    }

    /// Number of mounted cameras.
    pub fn num_cameras(&self) -> usize {
        self.cameras.len()
    }

    /// Point `Xw` in the frame of camera `cam`.
    pub fn to_camera(&self, xw: &Vector3<f64>, cam: usize) -> Vector3<f64> {
        self.cameras[cam].t_cw.act(xw)
    }

    /// Point `Xw` in the body frame.
    pub fn to_body(&self, xw: &Vector3<f64>) -> Vector3<f64> {
        self.rwb.transpose() * (xw - self.twb)
    }

    /// Pixel projection of `Xw` in camera `cam`.
    pub fn project(&self, xw: &Vector3<f64>, cam: usize) -> Vector2<f64> {
        let xc = self.to_camera(xw, cam);
        self.cameras[cam].camera.project(&xc)
    }

    /// Stereo projection `(u, v, u - bf/z)`; `bf` is 0 when the rig has no stereo term.
    pub fn project_stereo(&self, xw: &Vector3<f64>, cam: usize) -> Vector3<f64> {
        let xc = self.to_camera(xw, cam);
        let uv = self.cameras[cam].camera.project(&xc);
        let bf = self.bf.unwrap_or(0.0);
        Vector3::new(uv.x, uv.y, uv.x - bf / xc.z)
    }

    /// Whether `Xw` lies in front of camera `cam`.
    pub fn is_depth_positive(&self, xw: &Vector3<f64>, cam: usize) -> bool {
        self.to_camera(xw, cam).z > 0.0
    }

    /// Body-frame update with tangent `[δθ; δt]`.
    pub fn update(&mut self, delta: &[f64]) {
        let ur = Vector3::new(delta[0], delta[1], delta[2]);
        let ut = Vector3::new(delta[3], delta[4], delta[5]);

        self.twb += self.rwb * ut;
        self.rwb *= so3::exp(&ur);

        self.its += 1;
        if self.its >= BODY_NORMALIZE_PERIOD {
            self.rwb = so3::normalize_rotation(&self.rwb);
            self.its = 0;
        }
        self.refresh_camera_poses();
    }

    /// World-frame update with tangent `[δθ; δt]`.
    ///
    /// The rotation increment accumulates in `DR` and is applied to the body rotation at
    /// the start of the accumulation, `Rwb = DR·Rwb0`. Periodically the roll and pitch
    /// coupling terms of `DR` are cleared so it remains a rotation about the z axis.
    pub fn update_world(&mut self, delta: &[f64]) {
        let ur = Vector3::new(delta[0], delta[1], delta[2]);
        let ut = Vector3::new(delta[3], delta[4], delta[5]);

        self.dr = so3::exp(&ur) * self.dr;
        self.rwb = self.dr * self.rwb0;
        self.twb += ut;

        self.its += 1;
        if self.its >= WORLD_NORMALIZE_PERIOD {
            self.dr[(0, 2)] = 0.0;
            self.dr[(1, 2)] = 0.0;
            self.dr[(2, 0)] = 0.0;
            self.dr[(2, 1)] = 0.0;
            self.dr = so3::normalize_rotation(&self.dr);
            self.its = 0;
        }
        self.refresh_camera_poses();
    }

    /// Recompute every cached `Tcw` from the body pose.
    pub fn refresh_camera_poses(&mut self) {
        let rbw = self.rwb.transpose();
        let tbw = -(rbw * self.twb);
        for frame in &mut self.cameras {
            frame.t_cw = SE3::new(
                frame.t_cb.rotation * rbw,
                frame.t_cb.rotation * tbw + frame.t_cb.translation,
            );
        }
    }
}
