//! Pinhole camera model and rigid camera rig calibration.

use crate::manifold::{LieGroup, SE3};
use nalgebra::{Matrix2x3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

/// Pinhole camera model with 4 intrinsic parameters.
///
/// # Projection Model
///
/// For a 3D point `p_cam = (x, y, z)` in camera frame:
/// ```text
/// u = fx * (x/z) + cx
/// v = fy * (y/z) + cy
/// ```
///
/// # Example
///
/// ```
/// use fusion_solver::sensors::PinholeCamera;
/// use nalgebra::Vector3;
///
/// let camera = PinholeCamera::new(500.0, 500.0, 320.0, 240.0);
/// let uv = camera.project(&Vector3::new(0.1, 0.2, 1.0));
///
/// assert!((uv.x - 370.0).abs() < 1e-10);  // 500 * 0.1 + 320
/// assert!((uv.y - 340.0).abs() < 1e-10);  // 500 * 0.2 + 240
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PinholeCamera {
    /// Focal length in x direction (pixels)
    pub fx: f64,
    /// Focal length in y direction (pixels)
    pub fy: f64,
    /// Principal point x coordinate (pixels)
    pub cx: f64,
    /// Principal point y coordinate (pixels)
    pub cy: f64,
}

impl PinholeCamera {
    /// Create a new pinhole camera.
    ///
    /// # Arguments
    ///
    /// * `fx` - Focal length in x (pixels)
    /// * `fy` - Focal length in y (pixels)
    /// * `cx` - Principal point x (pixels)
    /// * `cy` - Principal point y (pixels)
    #[must_use]
    pub const fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Project a camera-frame point to pixel coordinates.
    ///
    /// No depth check is performed; callers test `z > 0` where it matters.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Vector2<f64> {
        let inv_z = 1.0 / p_cam.z;
        Vector2::new(
            self.fx * p_cam.x * inv_z + self.cx,
            self.fy * p_cam.y * inv_z + self.cy,
        )
    }

    /// Jacobian ∂(u,v)/∂(x,y,z) of [`project`](Self::project).
    pub fn project_jacobian(&self, p_cam: &Vector3<f64>) -> Matrix2x3<f64> {
        let inv_z = 1.0 / p_cam.z;
        let inv_z2 = inv_z * inv_z;
        Matrix2x3::new(
            self.fx * inv_z,
            0.0,
            -self.fx * p_cam.x * inv_z2,
            0.0,
            self.fy * inv_z,
            -self.fy * p_cam.y * inv_z2,
        )
    }

    /// Bearing of a pixel on the `z = 1` plane.
    pub fn unproject(&self, uv: &Vector2<f64>) -> Vector3<f64> {
        Vector3::new((uv.x - self.cx) / self.fx, (uv.y - self.cy) / self.fy, 1.0)
    }
}

/// A camera rigidly mounted on the body.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraMount {
    /// Intrinsics
    pub camera: PinholeCamera,
    /// Body-to-camera transformation `Tcb`
    pub t_cb: SE3,
}

/// Calibration of the sensor rig shared by all frames of one call.
///
/// Holds one camera (monocular) or two (stereo pair or rig), plus the stereo baseline
/// term `bf = baseline · fx` used by stereo factors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RigCalibration {
    /// Mounted cameras, index 0 is the reference camera
    pub mounts: Vec<CameraMount>,
    /// Stereo baseline times focal length, when stereo measurements are available
    pub bf: Option<f64>,
}

impl RigCalibration {
    /// Single camera rig.
    pub fn monocular(camera: PinholeCamera, t_cb: SE3) -> Self {
        Self {
            mounts: vec![CameraMount { camera, t_cb }],
            bf: None,
        }
    }

    /// Rectified stereo rig: one camera with a virtual right view at `bf / fx` baseline.
    pub fn rectified_stereo(camera: PinholeCamera, t_cb: SE3, bf: f64) -> Self {
        Self {
            mounts: vec![CameraMount { camera, t_cb }],
            bf: Some(bf),
        }
    }

    /// Two physical cameras related by the right-from-left transformation `t_rl`.
    ///
    /// The second mount is derived as `Tc1b = Trl · Tc0b`.
    pub fn camera_pair(
        left: PinholeCamera,
        t_cb_left: SE3,
        right: PinholeCamera,
        t_rl: SE3,
        bf: Option<f64>,
    ) -> Self {
        let t_cb_right = t_rl.compose(&t_cb_left);
        Self {
            mounts: vec![
                CameraMount {
                    camera: left,
                    t_cb: t_cb_left,
                },
                CameraMount {
                    camera: right,
                    t_cb: t_cb_right,
                },
            ],
            bf,
        }
    }

    /// Number of mounted cameras.
    pub fn num_cameras(&self) -> usize {
        self.mounts.len()
    }
}
