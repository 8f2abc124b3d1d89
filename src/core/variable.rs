//! Parameter blocks of the factor graph.
//!
//! Every unknown is one variant of the closed [`Vertex`] enum. A vertex knows its tangent
//! dimension and how to apply a tangent increment (`oplus`); the factors read the
//! estimates through the typed accessors and never mutate them.
//!
//! | Variant            | DoF | Update                                   |
//! |--------------------|-----|------------------------------------------|
//! | `Pose`             | 6   | body-frame `Rwb·Exp(δθ)`, `twb + Rwb·δt` |
//! | `Pose4Dof`         | 4   | world-frame yaw and translation          |
//! | `Point`            | 3   | additive                                 |
//! | `InverseDepth`     | 1   | `ρ + δ`                                  |
//! | `Velocity`         | 3   | additive                                 |
//! | `GyroBias`         | 3   | additive                                 |
//! | `AccBias`          | 3   | additive                                 |
//! | `GravityDirection` | 2   | `Rwg·Exp(δ₀, δ₁, 0)`                     |
//! | `Scale`            | 1   | `s·exp(δ)`                               |
//! | `Sim3`             | 7/6 | left `Exp(δ)·S`                          |

use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::pose::ImuCamPose;
use crate::manifold::{LieGroup, SE3, Sim3, Vector7, so3};
use crate::sensors::PinholeCamera;

/// Largest log-scale change a single update may apply.
const MAX_LOG_SCALE_STEP: f64 = 20.0;

/// Handle of a vertex inside a [`Problem`](super::Problem).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VertexId(pub usize);

/// Handle of a factor inside a [`Problem`](super::Problem).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactorId(pub usize);

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for FactorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Kind tag of a [`Vertex`], used to validate factor wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexKind {
    Pose,
    Pose4Dof,
    Point,
    InverseDepth,
    Velocity,
    GyroBias,
    AccBias,
    GravityDirection,
    Scale,
    Sim3,
}

/// Gravity direction `Rwg`, rotating the reference gravity `(0, 0, -g)` into the world.
///
/// Only rotations about the first two axes are observable, so the update has 2 DoF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GravityDirection {
    pub rwg: Matrix3<f64>,
    its: usize,
}

impl GravityDirection {
    pub fn new(rwg: Matrix3<f64>) -> Self {
        Self { rwg, its: 0 }
    }

    fn update(&mut self, delta: &[f64]) {
        self.rwg *= so3::exp(&Vector3::new(delta[0], delta[1], 0.0));
        self.its += 1;
        if self.its >= 5 {
            self.rwg = so3::normalize_rotation(&self.rwg);
            self.its = 0;
        }
    }
}

/// Landmark parameterized by its inverse depth along the ray of a host observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvDepthPoint {
    /// Inverse depth along the host ray
    pub rho: f64,
    /// Host pixel
    pub uv: Vector2<f64>,
    /// Host intrinsics
    pub camera: PinholeCamera,
    /// Host stereo baseline times focal length
    pub bf: Option<f64>,
    /// Host camera-to-world transformation
    pub t_wc: SE3,
}

impl InvDepthPoint {
    pub fn new(
        rho: f64,
        uv: Vector2<f64>,
        camera: PinholeCamera,
        bf: Option<f64>,
        t_wc: SE3,
    ) -> Self {
        Self {
            rho,
            uv,
            camera,
            bf,
            t_wc,
        }
    }

    /// Host ray on the `z = 1` plane of the host camera.
    pub fn ray(&self) -> Vector3<f64> {
        self.camera.unproject(&self.uv)
    }

    /// World position `Twc · (ray / ρ)`.
    pub fn world_point(&self) -> Vector3<f64> {
        self.t_wc.act(&(self.ray() / self.rho))
    }

    /// Derivative of [`world_point`](Self::world_point) with respect to `ρ`.
    pub fn world_point_jacobian(&self) -> Vector3<f64> {
        -(self.t_wc.rotation * self.ray()) / (self.rho * self.rho)
    }
}

/// A parameter block of the factor graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Vertex {
    /// Full 6-DoF IMU-camera pose
    Pose(ImuCamPose),
    /// IMU-camera pose restricted to yaw and translation
    Pose4Dof(ImuCamPose),
    /// World 3-D point
    Point(Vector3<f64>),
    /// Inverse depth point
    InverseDepth(InvDepthPoint),
    /// World-frame velocity
    Velocity(Vector3<f64>),
    /// Gyroscope bias
    GyroBias(Vector3<f64>),
    /// Accelerometer bias
    AccBias(Vector3<f64>),
    /// Gravity direction
    GravityDirection(GravityDirection),
    /// Positive metric scale
    Scale(f64),
    /// Similarity transformation, 6-DoF when `fix_scale` is set
    Sim3 { estimate: Sim3, fix_scale: bool },
}

impl Vertex {
    /// Kind tag of this vertex.
    pub fn kind(&self) -> VertexKind {
        match self {
            Vertex::Pose(_) => VertexKind::Pose,
            Vertex::Pose4Dof(_) => VertexKind::Pose4Dof,
            Vertex::Point(_) => VertexKind::Point,
            Vertex::InverseDepth(_) => VertexKind::InverseDepth,
            Vertex::Velocity(_) => VertexKind::Velocity,
            Vertex::GyroBias(_) => VertexKind::GyroBias,
            Vertex::AccBias(_) => VertexKind::AccBias,
            Vertex::GravityDirection(_) => VertexKind::GravityDirection,
            Vertex::Scale(_) => VertexKind::Scale,
            Vertex::Sim3 { .. } => VertexKind::Sim3,
        }
    }

    /// Tangent dimension.
    pub fn dimension(&self) -> usize {
        match self {
            Vertex::Pose(_) => 6,
            Vertex::Pose4Dof(_) => 4,
            Vertex::Point(_) | Vertex::Velocity(_) | Vertex::GyroBias(_) | Vertex::AccBias(_) => 3,
            Vertex::InverseDepth(_) | Vertex::Scale(_) => 1,
            Vertex::GravityDirection(_) => 2,
            Vertex::Sim3 { fix_scale, .. } => {
                if *fix_scale {
                    6
                } else {
                    7
                }
            }
        }
    }

    /// Apply the tangent increment `delta` (length [`dimension`](Self::dimension)).
    pub fn oplus(&mut self, delta: &[f64]) {
        match self {
            Vertex::Pose(pose) => pose.update(delta),
            Vertex::Pose4Dof(pose) => {
                pose.update_world(&[0.0, 0.0, delta[0], delta[1], delta[2], delta[3]]);
            }
            Vertex::Point(p) | Vertex::Velocity(p) | Vertex::GyroBias(p) | Vertex::AccBias(p) => {
                *p += Vector3::new(delta[0], delta[1], delta[2]);
            }
            Vertex::InverseDepth(point) => point.rho += delta[0],
            Vertex::GravityDirection(gravity) => gravity.update(delta),
            Vertex::Scale(s) => {
                let step = delta[0].clamp(-MAX_LOG_SCALE_STEP, MAX_LOG_SCALE_STEP);
                *s = (*s * step.exp()).max(f64::MIN_POSITIVE);
            }
            Vertex::Sim3 {
                estimate,
                fix_scale,
            } => {
                let mut tangent = Vector7::zeros();
                for (i, value) in delta.iter().take(6).enumerate() {
                    tangent[i] = *value;
                }
                if !*fix_scale {
                    tangent[6] = delta[6];
                }
                *estimate = Sim3::exp(&tangent).compose(estimate);
            }
        }
    }

    pub fn as_pose(&self) -> Option<&ImuCamPose> {
        match self {
            Vertex::Pose(pose) | Vertex::Pose4Dof(pose) => Some(pose),
            _ => None,
        }
    }

    /// Value of a 3-vector vertex (point, velocity, bias).
    pub fn as_vector3(&self) -> Option<&Vector3<f64>> {
        match self {
            Vertex::Point(v) | Vertex::Velocity(v) | Vertex::GyroBias(v) | Vertex::AccBias(v) => {
                Some(v)
            }
            _ => None,
        }
    }

    pub fn as_inverse_depth(&self) -> Option<&InvDepthPoint> {
        match self {
            Vertex::InverseDepth(point) => Some(point),
            _ => None,
        }
    }

    pub fn as_gravity(&self) -> Option<&GravityDirection> {
        match self {
            Vertex::GravityDirection(gravity) => Some(gravity),
            _ => None,
        }
    }

    pub fn as_scale(&self) -> Option<f64> {
        match self {
            Vertex::Scale(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_sim3(&self) -> Option<&Sim3> {
        match self {
            Vertex::Sim3 { estimate, .. } => Some(estimate),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::sensors::RigCalibration;

    #[test]
    fn test_dimensions() {
        assert_eq!(Vertex::Point(Vector3::zeros()).dimension(), 3);
        assert_eq!(Vertex::Scale(1.0).dimension(), 1);
        let gravity = GravityDirection::new(Matrix3::identity());
        assert_eq!(Vertex::GravityDirection(gravity).dimension(), 2);
        let estimate = Sim3::identity();
        let free = Vertex::Sim3 {
            estimate,
            fix_scale: false,
        };
        let fixed = Vertex::Sim3 {
            estimate,
            fix_scale: true,
        };
        assert_eq!(free.dimension(), 7);
        assert_eq!(fixed.dimension(), 6);
    }

    #[test]
    fn test_scale_update_is_multiplicative() {
        let mut vertex = Vertex::Scale(2.0);
        vertex.oplus(&[-10.0]);
        let s = vertex.as_scale().unwrap();
        assert!(s > 0.0);
        assert!((s - 2.0 * (-10.0f64).exp()).abs() < 1e-15);
        vertex.oplus(&[10.0]);
        assert!((vertex.as_scale().unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_scale_update_stays_positive() {
        let mut vertex = Vertex::Scale(1e-300);
        vertex.oplus(&[-800.0]);
        let s = vertex.as_scale().unwrap();
        assert!(s > 0.0 && s.is_finite());

        let mut vertex = Vertex::Scale(1.0);
        vertex.oplus(&[-800.0]);
        assert!((vertex.as_scale().unwrap() - (-MAX_LOG_SCALE_STEP).exp()).abs() < 1e-20);
        vertex.oplus(&[f64::INFINITY]);
        assert!(vertex.as_scale().unwrap().is_finite());
    }

    #[test]
    fn test_gravity_update_ignores_third_axis() {
        let mut vertex = Vertex::GravityDirection(GravityDirection::new(Matrix3::identity()));
        vertex.oplus(&[0.1, -0.05]);
        let rwg = vertex.as_gravity().unwrap().rwg;
        let expected = so3::exp(&Vector3::new(0.1, -0.05, 0.0));
        assert!((rwg - expected).norm() < 1e-12);
    }

    #[test]
    fn test_fixed_scale_sim3_keeps_scale() {
        let mut vertex = Vertex::Sim3 {
            estimate: Sim3::new(Matrix3::identity(), Vector3::zeros(), 1.5),
            fix_scale: true,
        };
        vertex.oplus(&[0.01, 0.02, -0.01, 0.1, 0.0, 0.2]);
        let estimate = vertex.as_sim3().unwrap();
        assert!((estimate.scale - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_pose4dof_update_maps_to_yaw() {
        let camera = PinholeCamera::new(400.0, 400.0, 320.0, 240.0);
        let rig = RigCalibration::monocular(camera, SE3::identity());
        let pose = ImuCamPose::from_body_pose(&SE3::identity(), &rig);
        let mut vertex = Vertex::Pose4Dof(pose);
        vertex.oplus(&[0.2, 1.0, 2.0, 3.0]);
        let updated = vertex.as_pose().unwrap();
        assert!((so3::log(&updated.rwb) - Vector3::new(0.0, 0.0, 0.2)).norm() < 1e-12);
        assert!((updated.twb - Vector3::new(1.0, 2.0, 3.0)).norm() < 1e-12);
    }

    #[test]
    fn test_inverse_depth_world_point() {
        let camera = PinholeCamera::new(400.0, 400.0, 320.0, 240.0);
        let uv = Vector2::new(320.0, 240.0);
        let point = InvDepthPoint::new(0.5, uv, camera, None, SE3::identity());
        assert!((point.world_point() - Vector3::new(0.0, 0.0, 2.0)).norm() < 1e-12);
        let h = 1e-6;
        let mut plus = point.clone();
        plus.rho += h;
        let mut minus = point.clone();
        minus.rho -= h;
        let numeric = (plus.world_point() - minus.world_point()) / (2.0 * h);
        assert!((numeric - point.world_point_jacobian()).norm() < 1e-6);
    }
}
