//! Residual factors of the multi-sensor graph.
//!
//! Every measurement type is one variant of the closed [`Factor`] enum. A factor has a fixed
//! arity (the vertex kinds accepted in each slot), a fixed error dimension and an
//! information matrix. The per-kind code works on fixed-size `nalgebra` matrices; the
//! dispatcher converts the results to dynamic blocks once, in a [`Linearization`] that holds
//! the residual and one Jacobian per vertex slot.
//!
//! # Factor Catalogue
//!
//! | Variant                | Vertices                                   | Dim |
//! |------------------------|--------------------------------------------|-----|
//! | `Mono`                 | point, pose                                | 2   |
//! | `MonoOnlyPose`         | pose                                       | 2   |
//! | `Stereo`               | point, pose                                | 3   |
//! | `StereoOnlyPose`       | pose                                       | 3   |
//! | `MonoInverseDepth`     | inverse depth, pose                        | 2   |
//! | `Inertial`             | pose₁, vel₁, gyro, acc, pose₂, vel₂        | 9   |
//! | `InertialGravityScale` | as `Inertial` + gravity direction, scale   | 9   |
//! | `GyroOnly`             | pose₁, pose₂, gyro                         | 3   |
//! | `GyroRandomWalk`       | gyro₁, gyro₂                               | 3   |
//! | `AccRandomWalk`        | acc₁, acc₂                                 | 3   |
//! | `Icp`                  | pose₁, pose₂ (6-DoF, 4-DoF or Sim3)        | 6   |
//! | `LidarPointToPlane`    | pose                                       | 1   |
//! | `PriorPoseImu`         | pose, vel, gyro, acc                       | 15  |
//! | `PriorPose`            | pose                                       | 6   |
//! | `PriorGyroBias`        | gyro                                       | 3   |
//! | `PriorAccBias`         | acc                                        | 3   |
//! | `PoseGraph4Dof`        | 4-DoF pose i, 4-DoF pose j                 | 6   |
//! | `Similarity`           | Sim3 i, Sim3 j                             | 7   |
//! | `SimilarityProjection` | Sim3                                       | 2   |
//!
//! Factors with closed-form derivatives are linearized analytically; the relative-pose
//! and similarity factors use central differences through the vertex update.

use nalgebra::{DMatrix, DVector, SMatrix, SVector};

pub mod bias;
pub mod icp;
pub mod inertial;
pub mod numeric;
pub mod pose_graph;
pub mod prior;
pub mod reprojection;

pub use bias::{BiasPriorFactor, RandomWalkFactor};
pub use icp::{IcpFactor, LidarPointToPlaneFactor};
pub use inertial::{GyroOnlyFactor, InertialFactor, InertialGravityScaleFactor};
pub use pose_graph::{PoseGraph4DofFactor, SimilarityFactor, SimilarityProjectionFactor};
pub use prior::{PoseImuPrior, PosePrior};
pub use reprojection::{
    MonoFactor, MonoInverseDepthFactor, MonoOnlyPoseFactor, StereoFactor, StereoOnlyPoseFactor,
};

use crate::core::{GravityDirection, ImuCamPose, InvDepthPoint, ProblemError, ProblemResult};
use crate::core::{Vertex, VertexKind};
use crate::manifold::{LieGroup, SE3, Sim3};

/// Residual and per-vertex Jacobians of a factor at the current estimate.
///
/// `jacobians[k]` has `residual.len()` rows and as many columns as the tangent dimension
/// of the vertex in slot `k`.
#[derive(Debug, Clone, PartialEq)]
pub struct Linearization {
    pub residual: DVector<f64>,
    pub jacobians: Vec<DMatrix<f64>>,
}

impl Linearization {
    pub(crate) fn from_fixed<const D: usize>(
        residual: &SVector<f64, D>,
        jacobians: Vec<DMatrix<f64>>,
    ) -> Self {
        Self {
            residual: DVector::from_column_slice(residual.as_slice()),
            jacobians,
        }
    }
}

/// Copy a fixed-size block into a dynamic matrix.
pub(crate) fn to_dynamic<const R: usize, const C: usize>(m: &SMatrix<f64, R, C>) -> DMatrix<f64> {
    DMatrix::from_column_slice(R, C, m.as_slice())
}

const POSE: &[VertexKind] = &[VertexKind::Pose];
const POSE_4DOF: &[VertexKind] = &[VertexKind::Pose4Dof];
const ANY_POSE: &[VertexKind] = &[VertexKind::Pose, VertexKind::Pose4Dof, VertexKind::Sim3];
const POINT: &[VertexKind] = &[VertexKind::Point];
const INVERSE_DEPTH: &[VertexKind] = &[VertexKind::InverseDepth];
const VELOCITY: &[VertexKind] = &[VertexKind::Velocity];
const GYRO: &[VertexKind] = &[VertexKind::GyroBias];
const ACC: &[VertexKind] = &[VertexKind::AccBias];
const GRAVITY: &[VertexKind] = &[VertexKind::GravityDirection];
const SCALE: &[VertexKind] = &[VertexKind::Scale];
const SIM3: &[VertexKind] = &[VertexKind::Sim3];

/// A residual factor.
#[derive(Debug, Clone)]
pub enum Factor {
    Mono(MonoFactor),
    MonoOnlyPose(MonoOnlyPoseFactor),
    Stereo(StereoFactor),
    StereoOnlyPose(StereoOnlyPoseFactor),
    MonoInverseDepth(MonoInverseDepthFactor),
    Inertial(InertialFactor),
    InertialGravityScale(InertialGravityScaleFactor),
    GyroOnly(GyroOnlyFactor),
    GyroRandomWalk(RandomWalkFactor),
    AccRandomWalk(RandomWalkFactor),
    Icp(IcpFactor),
    LidarPointToPlane(LidarPointToPlaneFactor),
    PriorPoseImu(PoseImuPrior),
    PriorPose(PosePrior),
    PriorGyroBias(BiasPriorFactor),
    PriorAccBias(BiasPriorFactor),
    PoseGraph4Dof(PoseGraph4DofFactor),
    Similarity(SimilarityFactor),
    SimilarityProjection(SimilarityProjectionFactor),
}

impl Factor {
    /// Name used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Factor::Mono(_) => "Mono",
            Factor::MonoOnlyPose(_) => "MonoOnlyPose",
            Factor::Stereo(_) => "Stereo",
            Factor::StereoOnlyPose(_) => "StereoOnlyPose",
            Factor::MonoInverseDepth(_) => "MonoInverseDepth",
            Factor::Inertial(_) => "Inertial",
            Factor::InertialGravityScale(_) => "InertialGravityScale",
            Factor::GyroOnly(_) => "GyroOnly",
            Factor::GyroRandomWalk(_) => "GyroRandomWalk",
            Factor::AccRandomWalk(_) => "AccRandomWalk",
            Factor::Icp(_) => "Icp",
            Factor::LidarPointToPlane(_) => "LidarPointToPlane",
            Factor::PriorPoseImu(_) => "PriorPoseImu",
            Factor::PriorPose(_) => "PriorPose",
            Factor::PriorGyroBias(_) => "PriorGyroBias",
            Factor::PriorAccBias(_) => "PriorAccBias",
            Factor::PoseGraph4Dof(_) => "PoseGraph4Dof",
            Factor::Similarity(_) => "Similarity",
            Factor::SimilarityProjection(_) => "SimilarityProjection",
        }
    }

    /// Error dimension.
    pub fn dimension(&self) -> usize {
        match self {
            Factor::LidarPointToPlane(_) => 1,
            Factor::Mono(_)
            | Factor::MonoOnlyPose(_)
            | Factor::MonoInverseDepth(_)
            | Factor::SimilarityProjection(_) => 2,
            Factor::Stereo(_)
            | Factor::StereoOnlyPose(_)
            | Factor::GyroOnly(_)
            | Factor::GyroRandomWalk(_)
            | Factor::AccRandomWalk(_)
            | Factor::PriorGyroBias(_)
            | Factor::PriorAccBias(_) => 3,
            Factor::Icp(_) | Factor::PriorPose(_) | Factor::PoseGraph4Dof(_) => 6,
            Factor::Similarity(_) => 7,
            Factor::Inertial(_) | Factor::InertialGravityScale(_) => 9,
            Factor::PriorPoseImu(_) => 15,
        }
    }

    /// Vertex kinds accepted in each slot.
    pub fn slot_kinds(&self) -> &'static [&'static [VertexKind]] {
        match self {
            Factor::Mono(_) | Factor::Stereo(_) => &[POINT, POSE],
            Factor::MonoOnlyPose(_) | Factor::StereoOnlyPose(_) | Factor::LidarPointToPlane(_) => {
                &[POSE]
            }
            Factor::MonoInverseDepth(_) => &[INVERSE_DEPTH, POSE],
            Factor::Inertial(_) => &[POSE, VELOCITY, GYRO, ACC, POSE, VELOCITY],
            Factor::InertialGravityScale(_) => {
                &[POSE, VELOCITY, GYRO, ACC, POSE, VELOCITY, GRAVITY, SCALE]
            }
            Factor::GyroOnly(_) => &[POSE, POSE, GYRO],
            Factor::GyroRandomWalk(_) => &[GYRO, GYRO],
            Factor::AccRandomWalk(_) => &[ACC, ACC],
            Factor::PriorGyroBias(_) => &[GYRO],
            Factor::PriorAccBias(_) => &[ACC],
            Factor::Icp(_) => &[ANY_POSE, ANY_POSE],
            Factor::PriorPoseImu(_) => &[POSE, VELOCITY, GYRO, ACC],
            Factor::PriorPose(_) => &[ANY_POSE],
            Factor::PoseGraph4Dof(_) => &[POSE_4DOF, POSE_4DOF],
            Factor::Similarity(_) => &[SIM3, SIM3],
            Factor::SimilarityProjection(_) => &[SIM3],
        }
    }

    /// Number of connected vertices.
    pub fn arity(&self) -> usize {
        self.slot_kinds().len()
    }

    /// Whether the factor reads the stereo `bf` of its pose vertex.
    pub fn requires_bf(&self) -> bool {
        matches!(self, Factor::Stereo(_) | Factor::StereoOnlyPose(_))
    }

    /// Mounted camera read by the factor, checked against its pose vertex.
    pub fn camera_index(&self) -> Option<usize> {
        match self {
            Factor::Mono(f) => Some(f.cam),
            Factor::MonoOnlyPose(f) => Some(f.cam),
            Factor::Stereo(f) => Some(f.cam),
            Factor::StereoOnlyPose(f) => Some(f.cam),
            Factor::MonoInverseDepth(f) => Some(f.cam),
            Factor::LidarPointToPlane(f) => Some(f.cam),
            _ => None,
        }
    }

    /// Information matrix `Ω`.
    pub fn information(&self) -> DMatrix<f64> {
        match self {
            Factor::Mono(f) => to_dynamic(&f.information),
            Factor::MonoOnlyPose(f) => to_dynamic(&f.information),
            Factor::Stereo(f) => to_dynamic(&f.information),
            Factor::StereoOnlyPose(f) => to_dynamic(&f.information),
            Factor::MonoInverseDepth(f) => to_dynamic(&f.information),
            Factor::Inertial(f) => to_dynamic(&f.information),
            Factor::InertialGravityScale(f) => to_dynamic(&f.information),
            Factor::GyroOnly(f) => to_dynamic(&f.information),
            Factor::GyroRandomWalk(f) | Factor::AccRandomWalk(f) => to_dynamic(&f.information),
            Factor::Icp(f) => to_dynamic(&f.information),
            Factor::LidarPointToPlane(f) => to_dynamic(&f.information),
            Factor::PriorPoseImu(f) => to_dynamic(&f.information),
            Factor::PriorPose(f) => to_dynamic(&f.information),
            Factor::PriorGyroBias(f) | Factor::PriorAccBias(f) => to_dynamic(&f.information),
            Factor::PoseGraph4Dof(f) => to_dynamic(&f.information),
            Factor::Similarity(f) => to_dynamic(&f.information),
            Factor::SimilarityProjection(f) => to_dynamic(&f.information),
        }
    }

    /// Error vector at the current estimates of `vertices`.
    pub fn error(&self, vertices: &[&Vertex]) -> ProblemResult<DVector<f64>> {
        self.check_arity(vertices)?;
        let error = match self {
            Factor::Mono(f) => dynamic_vector(&f.error(vertices)?),
            Factor::MonoOnlyPose(f) => dynamic_vector(&f.error(vertices)?),
            Factor::Stereo(f) => dynamic_vector(&f.error(vertices)?),
            Factor::StereoOnlyPose(f) => dynamic_vector(&f.error(vertices)?),
            Factor::MonoInverseDepth(f) => dynamic_vector(&f.error(vertices)?),
            Factor::Inertial(f) => dynamic_vector(&f.error(vertices)?),
            Factor::InertialGravityScale(f) => dynamic_vector(&f.error(vertices)?),
            Factor::GyroOnly(f) => dynamic_vector(&f.error(vertices)?),
            Factor::GyroRandomWalk(f) => {
                dynamic_vector(&f.error(vertices, VertexKind::GyroBias, "GyroRandomWalk")?)
            }
            Factor::AccRandomWalk(f) => {
                dynamic_vector(&f.error(vertices, VertexKind::AccBias, "AccRandomWalk")?)
            }
            Factor::Icp(f) => dynamic_vector(&f.error(vertices)?),
            Factor::LidarPointToPlane(f) => dynamic_vector(&f.error(vertices)?),
            Factor::PriorPoseImu(f) => dynamic_vector(&f.error(vertices)?),
            Factor::PriorPose(f) => dynamic_vector(&f.error(vertices)?),
            Factor::PriorGyroBias(f) => {
                dynamic_vector(&f.error(vertices, VertexKind::GyroBias, "PriorGyroBias")?)
            }
            Factor::PriorAccBias(f) => {
                dynamic_vector(&f.error(vertices, VertexKind::AccBias, "PriorAccBias")?)
            }
            Factor::PoseGraph4Dof(f) => dynamic_vector(&f.error(vertices)?),
            Factor::Similarity(f) => dynamic_vector(&f.error(vertices)?),
            Factor::SimilarityProjection(f) => dynamic_vector(&f.error(vertices)?),
        };
        Ok(error)
    }

    /// Residual and Jacobians at the current estimates of `vertices`.
    pub fn linearize(&self, vertices: &[&Vertex]) -> ProblemResult<Linearization> {
        self.check_arity(vertices)?;
        match self {
            Factor::Mono(f) => f.linearize(vertices),
            Factor::MonoOnlyPose(f) => f.linearize(vertices),
            Factor::Stereo(f) => f.linearize(vertices),
            Factor::StereoOnlyPose(f) => f.linearize(vertices),
            Factor::MonoInverseDepth(f) => f.linearize(vertices),
            Factor::Inertial(f) => f.linearize(vertices),
            Factor::InertialGravityScale(f) => f.linearize(vertices),
            Factor::GyroOnly(f) => f.linearize(vertices),
            Factor::GyroRandomWalk(f) => {
                f.linearize(vertices, VertexKind::GyroBias, "GyroRandomWalk")
            }
            Factor::AccRandomWalk(f) => f.linearize(vertices, VertexKind::AccBias, "AccRandomWalk"),
            Factor::LidarPointToPlane(f) => f.linearize(vertices),
            Factor::PriorPoseImu(f) => f.linearize(vertices),
            Factor::PriorGyroBias(f) => {
                f.linearize(vertices, VertexKind::GyroBias, "PriorGyroBias")
            }
            Factor::PriorAccBias(f) => f.linearize(vertices, VertexKind::AccBias, "PriorAccBias"),
            Factor::Icp(_)
            | Factor::PriorPose(_)
            | Factor::PoseGraph4Dof(_)
            | Factor::Similarity(_)
            | Factor::SimilarityProjection(_) => {
                let residual = self.error(vertices)?;
                let jacobians =
                    numeric::central_difference(vertices, residual.len(), |v| self.error(v))?;
                Ok(Linearization {
                    residual,
                    jacobians,
                })
            }
        }
    }

    fn check_arity(&self, vertices: &[&Vertex]) -> ProblemResult<()> {
        if vertices.len() != self.arity() {
            return Err(ProblemError::InvalidInput(format!(
                "{} factor expects {} vertices, got {}",
                self.name(),
                self.arity(),
                vertices.len()
            )));
        }
        Ok(())
    }
}

fn dynamic_vector<const D: usize>(v: &SVector<f64, D>) -> DVector<f64> {
    DVector::from_column_slice(v.as_slice())
}

fn vertex_at<'a>(
    vertices: &[&'a Vertex],
    slot: usize,
    factor: &'static str,
) -> ProblemResult<&'a Vertex> {
    vertices.get(slot).copied().ok_or_else(|| {
        ProblemError::InvalidInput(format!("{factor} factor has no vertex in slot {slot}"))
    })
}

fn mismatch(factor: &'static str, expected: VertexKind, vertex: &Vertex) -> ProblemError {
    ProblemError::VertexMismatch {
        factor,
        expected,
        found: vertex.kind(),
    }
}

/// IMU-camera pose in `slot`, 6-DoF or 4-DoF.
pub(crate) fn pose_at<'a>(
    vertices: &[&'a Vertex],
    slot: usize,
    factor: &'static str,
) -> ProblemResult<&'a ImuCamPose> {
    let vertex = vertex_at(vertices, slot, factor)?;
    vertex
        .as_pose()
        .ok_or_else(|| mismatch(factor, VertexKind::Pose, vertex))
}

/// 3-vector vertex of the given kind in `slot`.
pub(crate) fn vector3_at<'a>(
    vertices: &[&'a Vertex],
    slot: usize,
    kind: VertexKind,
    factor: &'static str,
) -> ProblemResult<&'a nalgebra::Vector3<f64>> {
    let vertex = vertex_at(vertices, slot, factor)?;
    if vertex.kind() != kind {
        return Err(mismatch(factor, kind, vertex));
    }
    vertex
        .as_vector3()
        .ok_or_else(|| mismatch(factor, kind, vertex))
}

pub(crate) fn inverse_depth_at<'a>(
    vertices: &[&'a Vertex],
    slot: usize,
    factor: &'static str,
) -> ProblemResult<&'a InvDepthPoint> {
    let vertex = vertex_at(vertices, slot, factor)?;
    vertex
        .as_inverse_depth()
        .ok_or_else(|| mismatch(factor, VertexKind::InverseDepth, vertex))
}

pub(crate) fn gravity_at<'a>(
    vertices: &[&'a Vertex],
    slot: usize,
    factor: &'static str,
) -> ProblemResult<&'a GravityDirection> {
    let vertex = vertex_at(vertices, slot, factor)?;
    vertex
        .as_gravity()
        .ok_or_else(|| mismatch(factor, VertexKind::GravityDirection, vertex))
}

pub(crate) fn scale_at(vertices: &[&Vertex], slot: usize, factor: &'static str) -> ProblemResult<f64> {
    let vertex = vertex_at(vertices, slot, factor)?;
    vertex
        .as_scale()
        .ok_or_else(|| mismatch(factor, VertexKind::Scale, vertex))
}

pub(crate) fn sim3_at<'a>(
    vertices: &[&'a Vertex],
    slot: usize,
    factor: &'static str,
) -> ProblemResult<&'a Sim3> {
    let vertex = vertex_at(vertices, slot, factor)?;
    vertex
        .as_sim3()
        .ok_or_else(|| mismatch(factor, VertexKind::Sim3, vertex))
}

/// World-to-camera transformation of the reference camera of any pose-like vertex.
///
/// For an IMU-camera pose this is `Tcw` of camera 0 (or `Tbw` without cameras); for a
/// similarity it is the rigid part `[R | t/s]`.
pub(crate) fn camera_transform_at(
    vertices: &[&Vertex],
    slot: usize,
    factor: &'static str,
) -> ProblemResult<SE3> {
    let vertex = vertex_at(vertices, slot, factor)?;
    match vertex {
        Vertex::Pose(pose) | Vertex::Pose4Dof(pose) => Ok(pose
            .cameras
            .first()
            .map(|frame| frame.t_cw)
            .unwrap_or_else(|| pose.body_pose().inverse())),
        Vertex::Sim3 { estimate, .. } => Ok(estimate.to_se3()),
        other => Err(mismatch(factor, VertexKind::Pose, other)),
    }
}
