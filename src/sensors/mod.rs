//! Sensor models consumed by the factors.
//!
//! - [`camera`]: pinhole intrinsics and the rigid camera rig
//! - [`imu`]: IMU bias, noise and the preintegrated motion delta between two frames

pub mod camera;
pub mod imu;

pub use camera::{CameraMount, PinholeCamera, RigCalibration};
pub use imu::{GRAVITY_MAGNITUDE, ImuBias, ImuNoise, Preintegrated, reference_gravity};
