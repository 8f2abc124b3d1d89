//! Inertial factors built on a preintegrated IMU delta.
//!
//! The 9-dimensional inertial residual between keyframes 1 and 2 is
//!
//! ```text
//! e_R = Log(ΔR(b)ᵀ · Rbw1 · Rwb2)
//! e_v = Rbw1 · (v2 - v1 - g·Δt) - Δv(b)
//! e_p = Rbw1 · (p2 - p1 - v1·Δt - ½·g·Δt²) - Δp(b)
//! ```
//!
//! where `b` is the bias of the first keyframe. The gravity-and-scale variant replaces
//! `g` by `Rwg·(0, 0, -9.81)` and scales the velocity and position differences by `s`.

use std::sync::Arc;

use nalgebra::{Matrix3, SMatrix, Vector3};

use super::{Linearization, gravity_at, pose_at, scale_at, to_dynamic, vector3_at};
use crate::core::{ImuCamPose, ProblemResult, Vertex, VertexKind};
use crate::manifold::so3;
use crate::sensors::{GRAVITY_MAGNITUDE, ImuBias, Preintegrated, reference_gravity};

type Matrix9x6 = SMatrix<f64, 9, 6>;
type Matrix9x3 = SMatrix<f64, 9, 3>;

/// States read by the inertial residual.
struct InertialStates<'a> {
    pose1: &'a ImuCamPose,
    vel1: &'a Vector3<f64>,
    bias: ImuBias,
    pose2: &'a ImuCamPose,
    vel2: &'a Vector3<f64>,
}

fn inertial_states<'a>(
    vertices: &[&'a Vertex],
    factor: &'static str,
) -> ProblemResult<InertialStates<'a>> {
    Ok(InertialStates {
        pose1: pose_at(vertices, 0, factor)?,
        vel1: vector3_at(vertices, 1, VertexKind::Velocity, factor)?,
        bias: ImuBias::new(
            *vector3_at(vertices, 2, VertexKind::GyroBias, factor)?,
            *vector3_at(vertices, 3, VertexKind::AccBias, factor)?,
        ),
        pose2: pose_at(vertices, 4, factor)?,
        vel2: vector3_at(vertices, 5, VertexKind::Velocity, factor)?,
    })
}

/// Shared evaluation of the inertial residual for gravity `g` and scale `s`.
struct InertialTerms {
    rbw1: Matrix3<f64>,
    e_r: Matrix3<f64>,
    inv_jr: Matrix3<f64>,
    /// `Rbw1·(s·(v2 - v1) - g·Δt)`
    velocity_term: Vector3<f64>,
    /// `Rbw1·(s·(p2 - p1 - v1·Δt) - ½·g·Δt²)`
    position_term: Vector3<f64>,
    residual: SMatrix<f64, 9, 1>,
}

fn inertial_terms(
    preintegrated: &Preintegrated,
    states: &InertialStates<'_>,
    gravity: &Vector3<f64>,
    scale: f64,
) -> InertialTerms {
    let dt = preintegrated.dt;
    let rbw1 = states.pose1.rwb.transpose();
    let d_r = preintegrated.delta_rotation(&states.bias);
    let e_r = d_r.transpose() * rbw1 * states.pose2.rwb;
    let er = so3::log(&e_r);

    let velocity_term = rbw1 * (scale * (states.vel2 - states.vel1) - gravity * dt);
    let position_term = rbw1
        * (scale * (states.pose2.twb - states.pose1.twb - states.vel1 * dt)
            - 0.5 * gravity * dt * dt);

    let mut residual = SMatrix::<f64, 9, 1>::zeros();
    residual.fixed_rows_mut::<3>(0).copy_from(&er);
    residual
        .fixed_rows_mut::<3>(3)
        .copy_from(&(velocity_term - preintegrated.delta_velocity(&states.bias)));
    residual
        .fixed_rows_mut::<3>(6)
        .copy_from(&(position_term - preintegrated.delta_position(&states.bias)));

    InertialTerms {
        rbw1,
        e_r,
        inv_jr: so3::inverse_right_jacobian(&er),
        velocity_term,
        position_term,
        residual,
    }
}

/// Derivative of the rotation residual with respect to the gyroscope bias.
fn gyro_rotation_jacobian(
    preintegrated: &Preintegrated,
    bias: &ImuBias,
    terms: &InertialTerms,
) -> Matrix3<f64> {
    let dbg = preintegrated.bias_delta(bias).gyro;
    let jr = so3::right_jacobian(&(preintegrated.jr_g * dbg));
    -terms.inv_jr * terms.e_r.transpose() * jr * preintegrated.jr_g
}

/// Pose Jacobians shared by both inertial variants.
fn pose_jacobians(
    states: &InertialStates<'_>,
    terms: &InertialTerms,
    scale: f64,
) -> [Matrix9x6; 2] {
    let rwb1 = states.pose1.rwb;
    let rwb2 = states.pose2.rwb;

    let mut j_pose1 = Matrix9x6::zeros();
    j_pose1
        .fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&(-terms.inv_jr * rwb2.transpose() * rwb1));
    j_pose1
        .fixed_view_mut::<3, 3>(3, 0)
        .copy_from(&so3::skew(&terms.velocity_term));
    j_pose1
        .fixed_view_mut::<3, 3>(6, 0)
        .copy_from(&so3::skew(&terms.position_term));
    j_pose1
        .fixed_view_mut::<3, 3>(6, 3)
        .copy_from(&(-scale * Matrix3::identity()));

    let mut j_pose2 = Matrix9x6::zeros();
    j_pose2
        .fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&terms.inv_jr);
    j_pose2
        .fixed_view_mut::<3, 3>(6, 3)
        .copy_from(&(scale * terms.rbw1 * rwb2));

    [j_pose1, j_pose2]
}

fn velocity_jacobians(
    preintegrated: &Preintegrated,
    terms: &InertialTerms,
    scale: f64,
) -> [Matrix9x3; 2] {
    let dt = preintegrated.dt;
    let mut j_vel1 = Matrix9x3::zeros();
    j_vel1
        .fixed_view_mut::<3, 3>(3, 0)
        .copy_from(&(-scale * terms.rbw1));
    j_vel1
        .fixed_view_mut::<3, 3>(6, 0)
        .copy_from(&(-scale * terms.rbw1 * dt));

    let mut j_vel2 = Matrix9x3::zeros();
    j_vel2
        .fixed_view_mut::<3, 3>(3, 0)
        .copy_from(&(scale * terms.rbw1));
    [j_vel1, j_vel2]
}

fn bias_jacobians(
    preintegrated: &Preintegrated,
    bias: &ImuBias,
    terms: &InertialTerms,
) -> [Matrix9x3; 2] {
    let mut j_gyro = Matrix9x3::zeros();
    j_gyro
        .fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&gyro_rotation_jacobian(preintegrated, bias, terms));
    j_gyro
        .fixed_view_mut::<3, 3>(3, 0)
        .copy_from(&(-preintegrated.jv_g));
    j_gyro
        .fixed_view_mut::<3, 3>(6, 0)
        .copy_from(&(-preintegrated.jp_g));

    let mut j_acc = Matrix9x3::zeros();
    j_acc
        .fixed_view_mut::<3, 3>(3, 0)
        .copy_from(&(-preintegrated.jv_a));
    j_acc
        .fixed_view_mut::<3, 3>(6, 0)
        .copy_from(&(-preintegrated.jp_a));
    [j_gyro, j_acc]
}

/// Inertial constraint between two keyframes in a gravity-aligned world.
///
/// Vertices: `[pose₁, velocity₁, gyro bias, acc bias, pose₂, velocity₂]`.
#[derive(Debug, Clone)]
pub struct InertialFactor {
    pub preintegrated: Arc<Preintegrated>,
    pub information: SMatrix<f64, 9, 9>,
    gravity: Vector3<f64>,
}

impl InertialFactor {
    /// Factor with the information of the `[δR, δv, δp]` covariance block.
    pub fn new(preintegrated: Arc<Preintegrated>) -> Self {
        let information = preintegrated.information_9();
        Self {
            preintegrated,
            information,
            gravity: reference_gravity(),
        }
    }

    pub(crate) fn error(&self, vertices: &[&Vertex]) -> ProblemResult<SMatrix<f64, 9, 1>> {
        let states = inertial_states(vertices, "Inertial")?;
        Ok(inertial_terms(&self.preintegrated, &states, &self.gravity, 1.0).residual)
    }

    pub(crate) fn linearize(&self, vertices: &[&Vertex]) -> ProblemResult<Linearization> {
        let states = inertial_states(vertices, "Inertial")?;
        let terms = inertial_terms(&self.preintegrated, &states, &self.gravity, 1.0);
        let [j_pose1, j_pose2] = pose_jacobians(&states, &terms, 1.0);
        let [j_vel1, j_vel2] = velocity_jacobians(&self.preintegrated, &terms, 1.0);
        let [j_gyro, j_acc] = bias_jacobians(&self.preintegrated, &states.bias, &terms);

        Ok(Linearization::from_fixed(&terms.residual, vec![
            to_dynamic(&j_pose1),
            to_dynamic(&j_vel1),
            to_dynamic(&j_gyro),
            to_dynamic(&j_acc),
            to_dynamic(&j_pose2),
            to_dynamic(&j_vel2),
        ]))
    }
}

/// Inertial constraint with free gravity direction and metric scale.
///
/// Vertices: `[pose₁, velocity₁, gyro bias, acc bias, pose₂, velocity₂, gravity, scale]`.
#[derive(Debug, Clone)]
pub struct InertialGravityScaleFactor {
    pub preintegrated: Arc<Preintegrated>,
    pub information: SMatrix<f64, 9, 9>,
}

impl InertialGravityScaleFactor {
    pub fn new(preintegrated: Arc<Preintegrated>) -> Self {
        let information = preintegrated.information_9();
        Self {
            preintegrated,
            information,
        }
    }

    pub(crate) fn error(&self, vertices: &[&Vertex]) -> ProblemResult<SMatrix<f64, 9, 1>> {
        let states = inertial_states(vertices, "InertialGravityScale")?;
        let rwg = gravity_at(vertices, 6, "InertialGravityScale")?.rwg;
        let scale = scale_at(vertices, 7, "InertialGravityScale")?;
        let gravity = rwg * reference_gravity();
        Ok(inertial_terms(&self.preintegrated, &states, &gravity, scale).residual)
    }

    pub(crate) fn linearize(&self, vertices: &[&Vertex]) -> ProblemResult<Linearization> {
        let states = inertial_states(vertices, "InertialGravityScale")?;
        let rwg = gravity_at(vertices, 6, "InertialGravityScale")?.rwg;
        let scale = scale_at(vertices, 7, "InertialGravityScale")?;
        let gravity = rwg * reference_gravity();
        let dt = self.preintegrated.dt;

        let terms = inertial_terms(&self.preintegrated, &states, &gravity, scale);
        let [j_pose1, j_pose2] = pose_jacobians(&states, &terms, scale);
        let [j_vel1, j_vel2] = velocity_jacobians(&self.preintegrated, &terms, scale);
        let [j_gyro, j_acc] = bias_jacobians(&self.preintegrated, &states.bias, &terms);

        // ∂(Rwg·gI)/∂δ for the update Rwg·Exp(δ₀, δ₁, 0)
        let mut gm = SMatrix::<f64, 3, 2>::zeros();
        gm[(0, 1)] = -GRAVITY_MAGNITUDE;
        gm[(1, 0)] = GRAVITY_MAGNITUDE;
        let d_gravity = terms.rbw1 * rwg * gm;

        let mut j_gravity = SMatrix::<f64, 9, 2>::zeros();
        j_gravity
            .fixed_view_mut::<3, 2>(3, 0)
            .copy_from(&(-d_gravity * dt));
        j_gravity
            .fixed_view_mut::<3, 2>(6, 0)
            .copy_from(&(-0.5 * d_gravity * dt * dt));

        let mut j_scale = SMatrix::<f64, 9, 1>::zeros();
        j_scale
            .fixed_rows_mut::<3>(3)
            .copy_from(&(terms.rbw1 * (states.vel2 - states.vel1) * scale));
        j_scale.fixed_rows_mut::<3>(6).copy_from(
            &(terms.rbw1 * (states.pose2.twb - states.pose1.twb - states.vel1 * dt) * scale),
        );

        Ok(Linearization::from_fixed(&terms.residual, vec![
            to_dynamic(&j_pose1),
            to_dynamic(&j_vel1),
            to_dynamic(&j_gyro),
            to_dynamic(&j_acc),
            to_dynamic(&j_pose2),
            to_dynamic(&j_vel2),
            to_dynamic(&j_gravity),
            to_dynamic(&j_scale),
        ]))
    }
}

/// Rotation-only inertial constraint, used to estimate the gyroscope bias alone.
///
/// Vertices: `[pose₁, pose₂, gyro bias]`.
#[derive(Debug, Clone)]
pub struct GyroOnlyFactor {
    pub preintegrated: Arc<Preintegrated>,
    pub information: Matrix3<f64>,
}

impl GyroOnlyFactor {
    /// Factor with the information of the rotation covariance block.
    pub fn new(preintegrated: Arc<Preintegrated>) -> Self {
        let information = preintegrated.rotation_information();
        Self {
            preintegrated,
            information,
        }
    }

    fn rotation_error(&self, vertices: &[&Vertex]) -> ProblemResult<(Matrix3<f64>, Vector3<f64>)> {
        let pose1 = pose_at(vertices, 0, "GyroOnly")?;
        let pose2 = pose_at(vertices, 1, "GyroOnly")?;
        let gyro = vector3_at(vertices, 2, VertexKind::GyroBias, "GyroOnly")?;
        let bias = ImuBias::new(*gyro, self.preintegrated.bias.acc);
        let d_r = self.preintegrated.delta_rotation(&bias);
        let e_r = d_r.transpose() * pose1.rwb.transpose() * pose2.rwb;
        Ok((e_r, so3::log(&e_r)))
    }

    pub(crate) fn error(&self, vertices: &[&Vertex]) -> ProblemResult<Vector3<f64>> {
        Ok(self.rotation_error(vertices)?.1)
    }

    pub(crate) fn linearize(&self, vertices: &[&Vertex]) -> ProblemResult<Linearization> {
        let (e_r, er) = self.rotation_error(vertices)?;
        let pose1 = pose_at(vertices, 0, "GyroOnly")?;
        let pose2 = pose_at(vertices, 1, "GyroOnly")?;
        let gyro = vector3_at(vertices, 2, VertexKind::GyroBias, "GyroOnly")?;
        let inv_jr = so3::inverse_right_jacobian(&er);

        let mut j_pose1 = SMatrix::<f64, 3, 6>::zeros();
        j_pose1
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(-inv_jr * pose2.rwb.transpose() * pose1.rwb));
        let mut j_pose2 = SMatrix::<f64, 3, 6>::zeros();
        j_pose2.fixed_view_mut::<3, 3>(0, 0).copy_from(&inv_jr);

        let dbg = gyro - self.preintegrated.bias.gyro;
        let jr = so3::right_jacobian(&(self.preintegrated.jr_g * dbg));
        let j_gyro = -inv_jr * e_r.transpose() * jr * self.preintegrated.jr_g;

        Ok(Linearization::from_fixed(&er, vec![
            to_dynamic(&j_pose1),
            to_dynamic(&j_pose2),
            to_dynamic(&j_gyro),
        ]))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::factors::{Factor, numeric};
    use crate::core::GravityDirection;
    use crate::manifold::{LieGroup, SE3};
    use crate::sensors::{ImuNoise, PinholeCamera, RigCalibration};

    const RATE: f64 = 200.0;

    fn rig() -> RigCalibration {
        RigCalibration::monocular(PinholeCamera::new(400.0, 400.0, 320.0, 240.0), SE3::identity())
    }

    /// Constant-velocity, constant-rate motion integrated without noise.
    fn motion(
        bias: ImuBias,
        samples: usize,
    ) -> (Arc<Preintegrated>, SE3, Vector3<f64>, SE3, Vector3<f64>) {
        let rwb1 = so3::exp(&Vector3::new(0.05, -0.1, 0.3));
        let twb1 = Vector3::new(1.0, -2.0, 0.5);
        let v1 = Vector3::new(0.4, 0.1, -0.2);
        let omega = Vector3::new(0.1, -0.05, 0.2);
        let dt = 1.0 / RATE;

        let mut preintegrated = Preintegrated::new(bias, &ImuNoise::default());
        let gravity = reference_gravity();
        let mut rwb = rwb1;
        let mut twb = twb1;
        let v = v1;
        for _ in 0..samples {
            // zero world acceleration: the accelerometer measures -g in the body frame
            let acc = rwb.transpose() * (-gravity) + bias.acc;
            let gyro = omega + bias.gyro;
            preintegrated.integrate_measurement(&acc, &gyro, dt);
            twb += v * dt;
            rwb *= so3::exp(&(omega * dt));
        }
        (
            Arc::new(preintegrated),
            SE3::new(rwb1, twb1),
            v1,
            SE3::new(so3::normalize_rotation(&rwb), twb),
            v,
        )
    }

    fn inertial_vertices(
        pose1: &SE3,
        v1: Vector3<f64>,
        bias: ImuBias,
        pose2: &SE3,
        v2: Vector3<f64>,
    ) -> Vec<Vertex> {
        vec![
            Vertex::Pose(ImuCamPose::from_body_pose(pose1, &rig())),
            Vertex::Velocity(v1),
            Vertex::GyroBias(bias.gyro),
            Vertex::AccBias(bias.acc),
            Vertex::Pose(ImuCamPose::from_body_pose(pose2, &rig())),
            Vertex::Velocity(v2),
        ]
    }

    fn assert_jacobians_match(factor: &Factor, vertices: &[Vertex], tolerance: f64) {
        let refs: Vec<&Vertex> = vertices.iter().collect();
        let analytic = factor.linearize(&refs).unwrap();
        let numeric =
            numeric::central_difference(&refs, factor.dimension(), |v| factor.error(v)).unwrap();
        for (slot, (a, n)) in analytic.jacobians.iter().zip(numeric.iter()).enumerate() {
            let diff = (a - n).abs().max();
            assert!(diff < tolerance, "{} slot {slot}: diff {diff}", factor.name());
        }
    }

    #[test]
    fn test_residual_vanishes_for_constant_velocity() {
        let bias = ImuBias::default();
        let (preintegrated, pose1, v1, pose2, v2) = motion(bias, 40);
        let vertices = inertial_vertices(&pose1, v1, bias, &pose2, v2);
        let refs: Vec<&Vertex> = vertices.iter().collect();
        let factor = Factor::Inertial(InertialFactor::new(preintegrated));
        let error = factor.error(&refs).unwrap();
        assert!(error.norm() < 1e-6, "residual {error}");
    }

    #[test]
    fn test_inertial_jacobians_match_numeric() {
        let bias = ImuBias::new(Vector3::new(0.01, -0.02, 0.005), Vector3::new(0.1, 0.05, -0.1));
        let (preintegrated, pose1, v1, pose2, v2) = motion(bias, 40);
        // evaluate away from the solution and the linearization bias
        let perturbed_bias = ImuBias::new(
            bias.gyro + Vector3::new(0.002, 0.001, -0.003),
            bias.acc + Vector3::new(0.02, -0.01, 0.03),
        );
        let pose2 = SE3::new(
            pose2.rotation * so3::exp(&Vector3::new(0.02, 0.01, -0.03)),
            pose2.translation + Vector3::new(0.05, -0.02, 0.01),
        );
        let vertices = inertial_vertices(&pose1, v1, perturbed_bias, &pose2, v2 * 1.1);
        let factor = Factor::Inertial(InertialFactor::new(preintegrated));
        assert_jacobians_match(&factor, &vertices, 1e-5);
    }

    #[test]
    fn test_gravity_scale_jacobians_match_numeric() {
        let bias = ImuBias::default();
        let (preintegrated, pose1, v1, pose2, v2) = motion(bias, 40);
        let mut vertices = inertial_vertices(&pose1, v1, bias, &pose2, v2 + Vector3::new(0.1, 0.0, 0.0));
        vertices.push(Vertex::GravityDirection(GravityDirection::new(so3::exp(&Vector3::new(
            0.05, -0.03, 0.0,
        )))));
        vertices.push(Vertex::Scale(1.3));
        let factor = Factor::InertialGravityScale(InertialGravityScaleFactor::new(preintegrated));
        assert_jacobians_match(&factor, &vertices, 1e-5);
    }

    #[test]
    fn test_gravity_scale_matches_inertial_at_unit_scale() {
        let bias = ImuBias::default();
        let (preintegrated, pose1, v1, pose2, v2) = motion(bias, 20);
        let mut vertices = inertial_vertices(&pose1, v1, bias, &pose2, v2);
        let plain = Factor::Inertial(InertialFactor::new(Arc::clone(&preintegrated)));
        let refs: Vec<&Vertex> = vertices.iter().collect();
        let expected = plain.error(&refs).unwrap();

        vertices.push(Vertex::GravityDirection(GravityDirection::new(Matrix3::identity())));
        vertices.push(Vertex::Scale(1.0));
        let refs: Vec<&Vertex> = vertices.iter().collect();
        let scaled = Factor::InertialGravityScale(InertialGravityScaleFactor::new(preintegrated));
        assert!((scaled.error(&refs).unwrap() - expected).norm() < 1e-12);
    }

    #[test]
    fn test_gyro_only_jacobians_match_numeric() {
        let bias = ImuBias::new(Vector3::new(0.01, 0.0, -0.01), Vector3::zeros());
        let (preintegrated, pose1, _, pose2, _) = motion(bias, 30);
        let vertices = vec![
            Vertex::Pose(ImuCamPose::from_body_pose(&pose1, &rig())),
            Vertex::Pose(ImuCamPose::from_body_pose(
                &SE3::new(pose2.rotation * so3::exp(&Vector3::new(0.0, 0.02, 0.01)), pose2.translation),
                &rig(),
            )),
            Vertex::GyroBias(bias.gyro + Vector3::new(0.003, -0.002, 0.001)),
        ];
        let factor = Factor::GyroOnly(GyroOnlyFactor::new(preintegrated));
        assert_jacobians_match(&factor, &vertices, 1e-5);
    }

    #[test]
    fn test_wrong_vertex_kind_is_rejected() {
        let bias = ImuBias::default();
        let (preintegrated, pose1, v1, pose2, v2) = motion(bias, 5);
        let mut vertices = inertial_vertices(&pose1, v1, bias, &pose2, v2);
        vertices[1] = Vertex::GyroBias(v1);
        let refs: Vec<&Vertex> = vertices.iter().collect();
        let factor = Factor::Inertial(InertialFactor::new(preintegrated));
        assert!(factor.error(&refs).is_err());
    }
}
