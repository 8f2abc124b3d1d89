//! Plain-data inputs copied out of the caller's map.
//!
//! Collaborators hold their own locks while filling these structs and again while
//! writing the outcomes back; the drivers only ever see these copies. Calibration and
//! preintegrated deltas are shared read-only through `Arc`.

use nalgebra::{Matrix6, Vector2, Vector3};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{FusionError, FusionResult};
use crate::manifold::{SE3, Sim3};
use crate::sensors::{ImuBias, PinholeCamera, Preintegrated, RigCalibration};

/// Identifier of a keyframe in the caller's map.
pub type KeyFrameId = usize;
/// Identifier of a landmark in the caller's map.
pub type LandmarkId = usize;

/// One keypoint measurement of a landmark.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub landmark: LandmarkId,
    /// Undistorted pixel in the observing camera
    pub pixel: Vector2<f64>,
    /// Horizontal coordinate in the right image of a rectified stereo pair
    pub right_u: Option<f64>,
    /// Index of the observing camera on the rig
    pub camera: usize,
    /// Inverse pixel variance, usually from the pyramid level of the keypoint
    pub inv_sigma2: f64,
}

impl Observation {
    pub fn mono(landmark: LandmarkId, pixel: Vector2<f64>, camera: usize, inv_sigma2: f64) -> Self {
        Self {
            landmark,
            pixel,
            right_u: None,
            camera,
            inv_sigma2,
        }
    }

    pub fn stereo(
        landmark: LandmarkId,
        pixel: Vector2<f64>,
        right_u: f64,
        camera: usize,
        inv_sigma2: f64,
    ) -> Self {
        Self {
            right_u: Some(right_u),
            ..Self::mono(landmark, pixel, camera, inv_sigma2)
        }
    }
}

/// State of one keyframe.
#[derive(Debug, Clone)]
pub struct KeyFrameSnapshot {
    pub id: KeyFrameId,
    /// Body-to-world pose `Twb`
    pub t_wb: SE3,
    pub velocity: Vector3<f64>,
    pub bias: ImuBias,
    /// Held constant by the optimization
    pub fixed: bool,
    pub rig: Arc<RigCalibration>,
    /// Preintegrated IMU delta from `previous` to this keyframe
    pub preintegrated: Option<Arc<Preintegrated>>,
    pub previous: Option<KeyFrameId>,
    pub observations: Vec<Observation>,
}

impl KeyFrameSnapshot {
    /// Keyframe without IMU data or observations.
    pub fn new(id: KeyFrameId, t_wb: SE3, rig: Arc<RigCalibration>) -> Self {
        Self {
            id,
            t_wb,
            velocity: Vector3::zeros(),
            bias: ImuBias::default(),
            fixed: false,
            rig,
            preintegrated: None,
            previous: None,
            observations: Vec::new(),
        }
    }

    /// Attach the preintegrated delta from keyframe `previous`.
    pub fn with_imu(mut self, previous: KeyFrameId, preintegrated: Arc<Preintegrated>) -> Self {
        self.previous = Some(previous);
        self.preintegrated = Some(preintegrated);
        self
    }

    pub fn with_fixed(mut self, fixed: bool) -> Self {
        self.fixed = fixed;
        self
    }
}

/// A map point.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkSnapshot {
    pub id: LandmarkId,
    pub position: Vector3<f64>,
}

/// Keyframes and the landmarks they observe.
#[derive(Debug, Clone, Default)]
pub struct MapSnapshot {
    pub keyframes: Vec<KeyFrameSnapshot>,
    pub landmarks: Vec<LandmarkSnapshot>,
    /// Scan registrations between keyframes of the window
    pub icp_links: Vec<IcpLink>,
}

impl MapSnapshot {
    pub fn keyframe(&self, id: KeyFrameId) -> FusionResult<&KeyFrameSnapshot> {
        self.keyframes
            .iter()
            .find(|kf| kf.id == id)
            .ok_or(FusionError::UnknownKeyFrame(id))
    }

    /// Position of each landmark id in `landmarks`.
    pub(crate) fn landmark_index(&self) -> HashMap<LandmarkId, usize> {
        self.landmarks
            .iter()
            .enumerate()
            .map(|(index, lm)| (lm.id, index))
            .collect()
    }

    /// Total number of observations over all keyframes.
    pub fn num_observations(&self) -> usize {
        self.keyframes.iter().map(|kf| kf.observations.len()).sum()
    }
}

/// Observation of a map point by the tracking frame, with the point copied in.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameObservation {
    pub observation: Observation,
    /// World position of the observed map point
    pub point: Vector3<f64>,
}

/// Lidar point matched to a world plane `n · x + d = 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneMatch {
    /// Point in the frame of the mounted sensor
    pub point: Vector3<f64>,
    pub normal: Vector3<f64>,
    pub offset: f64,
    /// Residual scale
    pub weight: f64,
    /// Mount index of the sensor on the rig
    pub sensor: usize,
}

/// Scan registration of the tracking frame against the previous frame.
#[derive(Debug, Clone, PartialEq)]
pub struct IcpMeasurement {
    /// `T12 = Tc1w · Tc2w⁻¹` from the previous camera 0 to the current one
    pub t_12: SE3,
    pub information: Matrix6<f64>,
}

/// The tracking frame.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub t_wb: SE3,
    pub velocity: Vector3<f64>,
    pub bias: ImuBias,
    pub rig: Arc<RigCalibration>,
    pub observations: Vec<FrameObservation>,
    /// Preintegrated IMU delta from the inertial reference to this frame
    pub preintegrated: Option<Arc<Preintegrated>>,
    pub planes: Vec<PlaneMatch>,
    /// Prior on the camera pose `Twc` of camera 0 with its information
    pub pose_prior: Option<(SE3, Matrix6<f64>)>,
    /// Registration against the previous frame, read by the ICP tracking drivers
    pub icp: Option<IcpMeasurement>,
}

impl FrameSnapshot {
    pub fn new(t_wb: SE3, rig: Arc<RigCalibration>) -> Self {
        Self {
            t_wb,
            velocity: Vector3::zeros(),
            bias: ImuBias::default(),
            rig,
            observations: Vec::new(),
            preintegrated: None,
            planes: Vec::new(),
            pose_prior: None,
            icp: None,
        }
    }
}

/// Keyframe of the essential graph.
#[derive(Debug, Clone)]
pub struct EssentialKeyFrame {
    pub id: KeyFrameId,
    /// Camera pose `Tcw` before the loop correction
    pub t_cw: SE3,
    /// Corrected `Siw`, set for the keyframes around the loop
    pub corrected: Option<Sim3>,
    /// Spanning-tree parent
    pub parent: Option<KeyFrameId>,
    pub loop_edges: Vec<KeyFrameId>,
    /// Covisible keyframes with their number of shared points
    pub covisibility: Vec<(KeyFrameId, usize)>,
    pub rig: Arc<RigCalibration>,
}

impl EssentialKeyFrame {
    /// `Siw` before the correction.
    pub fn uncorrected(&self) -> Sim3 {
        Sim3::from_se3(&self.t_cw)
    }

    /// `Siw` the optimization starts from.
    pub fn initial(&self) -> Sim3 {
        self.corrected.unwrap_or_else(|| self.uncorrected())
    }

    /// Covisibility weight with keyframe `other`, 0 when not covisible.
    pub fn weight(&self, other: KeyFrameId) -> usize {
        self.covisibility
            .iter()
            .find(|(id, _)| *id == other)
            .map_or(0, |(_, weight)| *weight)
    }
}

/// Map point corrected together with its reference keyframe.
#[derive(Debug, Clone, PartialEq)]
pub struct EssentialLandmark {
    pub id: LandmarkId,
    pub position: Vector3<f64>,
    pub reference: KeyFrameId,
}

/// Relative pose from scan registration between two keyframes.
#[derive(Debug, Clone, PartialEq)]
pub struct IcpLink {
    pub from: KeyFrameId,
    pub to: KeyFrameId,
    /// `T12 = Tc1w · Tc2w⁻¹`
    pub t_12: SE3,
    pub information: Matrix6<f64>,
}

/// Inputs of a loop-closing pose-graph optimization.
#[derive(Debug, Clone, Default)]
pub struct EssentialGraph {
    pub keyframes: Vec<EssentialKeyFrame>,
    pub landmarks: Vec<EssentialLandmark>,
    /// Keyframe held fixed
    pub loop_keyframe: KeyFrameId,
    /// Keyframe that detected the loop
    pub current_keyframe: KeyFrameId,
    /// Connections created by the loop fusion
    pub new_connections: Vec<(KeyFrameId, Vec<KeyFrameId>)>,
    pub icp_links: Vec<IcpLink>,
}

impl EssentialGraph {
    pub(crate) fn index(&self) -> HashMap<KeyFrameId, usize> {
        self.keyframes
            .iter()
            .enumerate()
            .map(|(index, kf)| (kf.id, index))
            .collect()
    }
}

/// One correspondence between two keyframes.
#[derive(Debug, Clone, PartialEq)]
pub struct Sim3Match {
    /// Point in the frame of camera 1
    pub point1: Vector3<f64>,
    /// Point in the frame of camera 2
    pub point2: Vector3<f64>,
    pub pixel1: Vector2<f64>,
    pub pixel2: Vector2<f64>,
    pub inv_sigma2_1: f64,
    pub inv_sigma2_2: f64,
}

/// Inputs of a two-view similarity refinement.
#[derive(Debug, Clone)]
pub struct Sim3Alignment {
    pub camera1: PinholeCamera,
    pub camera2: PinholeCamera,
    pub matches: Vec<Sim3Match>,
    /// Initial `S12`
    pub s12: Sim3,
}
