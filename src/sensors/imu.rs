//! IMU bias, noise and on-manifold preintegration.
//!
//! A [`Preintegrated`] value summarizes all IMU samples between two frames as a relative
//! rotation, velocity and position expressed in the body frame of the first one:
//!
//! ```text
//! ΔR = Π Exp((ω_k - b_g) δt)
//! Δv = Σ ΔR_k (a_k - b_a) δt
//! Δp = Σ Δv_k δt + ½ ΔR_k (a_k - b_a) δt²
//! ```
//!
//! Together with first-order Jacobians with respect to the biases it was integrated with,
//! so that a small bias change can be applied without integrating again, and a 15×15
//! covariance ordered as rotation, velocity, position, gyro walk, accel walk.

use nalgebra::{DMatrix, Matrix3, SMatrix, Vector3};
use serde::{Deserialize, Serialize};

use crate::linalg::information_from_covariance;
use crate::manifold::so3;

/// Magnitude of the gravity vector (m/s²).
pub const GRAVITY_MAGNITUDE: f64 = 9.81;

/// Gravity in the reference gravity frame, `(0, 0, -g)`.
pub fn reference_gravity() -> Vector3<f64> {
    Vector3::new(0.0, 0.0, -GRAVITY_MAGNITUDE)
}

/// Gyroscope and accelerometer biases.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ImuBias {
    /// Gyroscope bias (rad/s)
    pub gyro: Vector3<f64>,
    /// Accelerometer bias (m/s²)
    pub acc: Vector3<f64>,
}

impl ImuBias {
    pub fn new(gyro: Vector3<f64>, acc: Vector3<f64>) -> Self {
        Self { gyro, acc }
    }

    /// Component-wise difference `self - other`.
    pub fn difference(&self, other: &ImuBias) -> ImuBias {
        ImuBias::new(self.gyro - other.gyro, self.acc - other.acc)
    }
}

/// Discrete-time IMU noise, as per-sample standard deviations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuNoise {
    /// Gyroscope measurement noise
    pub gyro: f64,
    /// Accelerometer measurement noise
    pub acc: f64,
    /// Gyroscope bias random walk
    pub gyro_walk: f64,
    /// Accelerometer bias random walk
    pub acc_walk: f64,
}

impl ImuNoise {
    pub fn new(gyro: f64, acc: f64, gyro_walk: f64, acc_walk: f64) -> Self {
        Self {
            gyro,
            acc,
            gyro_walk,
            acc_walk,
        }
    }
}

impl Default for ImuNoise {
    fn default() -> Self {
        // EuRoC MAV sensor at 200 Hz
        let rate = 200f64.sqrt();
        Self::new(1.7e-4 * rate, 2.0e-3 * rate, 1.9e-5 / rate, 3.0e-3 / rate)
    }
}

/// Preintegrated IMU motion between two consecutive frames.
///
/// Read-only for the factors: they evaluate the bias-corrected deltas and the information
/// blocks, never the raw samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preintegrated {
    /// Integrated time span (s)
    pub dt: f64,
    /// Relative rotation
    pub delta_r: Matrix3<f64>,
    /// Relative velocity in the first body frame
    pub delta_v: Vector3<f64>,
    /// Relative position in the first body frame
    pub delta_p: Vector3<f64>,
    /// ∂ΔR/∂b_g
    pub jr_g: Matrix3<f64>,
    /// ∂Δv/∂b_g
    pub jv_g: Matrix3<f64>,
    /// ∂Δv/∂b_a
    pub jv_a: Matrix3<f64>,
    /// ∂Δp/∂b_g
    pub jp_g: Matrix3<f64>,
    /// ∂Δp/∂b_a
    pub jp_a: Matrix3<f64>,
    /// Covariance of `[δR, δv, δp, δb_g, δb_a]`
    pub covariance: SMatrix<f64, 15, 15>,
    /// Bias the samples were integrated with
    pub bias: ImuBias,
    /// Noise model used for the covariance
    pub noise: ImuNoise,
}

impl Preintegrated {
    /// Empty preintegration at linearization bias `bias`.
    pub fn new(bias: ImuBias, noise: &ImuNoise) -> Self {
        Self {
            dt: 0.0,
            delta_r: Matrix3::identity(),
            delta_v: Vector3::zeros(),
            delta_p: Vector3::zeros(),
            jr_g: Matrix3::zeros(),
            jv_g: Matrix3::zeros(),
            jv_a: Matrix3::zeros(),
            jp_g: Matrix3::zeros(),
            jp_a: Matrix3::zeros(),
            covariance: SMatrix::zeros(),
            bias,
            noise: *noise,
        }
    }

    /// Integrate one accelerometer/gyroscope sample held for `dt` seconds.
    ///
    /// Position and velocity are advanced with the rotation before this sample, the
    /// rotation last. The covariance of `[δR, δv, δp]` is propagated as
    /// `A·C·Aᵀ + B·N·Bᵀ` and the bias blocks grow by the random walk variance.
    pub fn integrate_measurement(&mut self, acc: &Vector3<f64>, gyro: &Vector3<f64>, dt: f64) {
        let a = acc - self.bias.acc;
        let w = gyro - self.bias.gyro;
        let acc_skew = so3::skew(&a);
        let dt2 = dt * dt;

        let mut mat_a = SMatrix::<f64, 9, 9>::identity();
        let mut mat_b = SMatrix::<f64, 9, 6>::zeros();

        self.delta_p += self.delta_v * dt + 0.5 * self.delta_r * a * dt2;
        self.delta_v += self.delta_r * a * dt;

        mat_a
            .fixed_view_mut::<3, 3>(3, 0)
            .copy_from(&(-self.delta_r * acc_skew * dt));
        mat_a
            .fixed_view_mut::<3, 3>(6, 0)
            .copy_from(&(-0.5 * self.delta_r * acc_skew * dt2));
        mat_a
            .fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(Matrix3::identity() * dt));
        mat_b
            .fixed_view_mut::<3, 3>(3, 3)
            .copy_from(&(self.delta_r * dt));
        mat_b
            .fixed_view_mut::<3, 3>(6, 3)
            .copy_from(&(0.5 * self.delta_r * dt2));

        self.jp_a += self.jv_a * dt - 0.5 * self.delta_r * dt2;
        self.jp_g += self.jv_g * dt - 0.5 * self.delta_r * acc_skew * self.jr_g * dt2;
        self.jv_a -= self.delta_r * dt;
        self.jv_g -= self.delta_r * acc_skew * self.jr_g * dt;

        let step = w * dt;
        let increment = so3::exp(&step);
        let right_jacobian = so3::right_jacobian(&step);
        self.delta_r = so3::normalize_rotation(&(self.delta_r * increment));

        mat_a
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&increment.transpose());
        mat_b
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(right_jacobian * dt));

        let mut measurement_noise = SMatrix::<f64, 6, 6>::zeros();
        let gyro_var = self.noise.gyro * self.noise.gyro;
        let acc_var = self.noise.acc * self.noise.acc;
        for i in 0..3 {
            measurement_noise[(i, i)] = gyro_var;
            measurement_noise[(i + 3, i + 3)] = acc_var;
        }

        let propagated = mat_a * self.covariance.fixed_view::<9, 9>(0, 0) * mat_a.transpose()
            + mat_b * measurement_noise * mat_b.transpose();
        self.covariance
            .fixed_view_mut::<9, 9>(0, 0)
            .copy_from(&propagated);

        let gyro_walk_var = self.noise.gyro_walk * self.noise.gyro_walk;
        let acc_walk_var = self.noise.acc_walk * self.noise.acc_walk;
        for i in 9..12 {
            self.covariance[(i, i)] += gyro_walk_var;
            self.covariance[(i + 3, i + 3)] += acc_walk_var;
        }

        self.jr_g = increment.transpose() * self.jr_g - right_jacobian * dt;
        self.dt += dt;
    }

    /// Bias change relative to the linearization bias.
    pub fn bias_delta(&self, bias: &ImuBias) -> ImuBias {
        bias.difference(&self.bias)
    }

    /// Relative rotation corrected to first order for `bias`.
    pub fn delta_rotation(&self, bias: &ImuBias) -> Matrix3<f64> {
        let db = self.bias_delta(bias);
        so3::normalize_rotation(&(self.delta_r * so3::exp(&(self.jr_g * db.gyro))))
    }

    /// Relative velocity corrected to first order for `bias`.
    pub fn delta_velocity(&self, bias: &ImuBias) -> Vector3<f64> {
        let db = self.bias_delta(bias);
        self.delta_v + self.jv_g * db.gyro + self.jv_a * db.acc
    }

    /// Relative position corrected to first order for `bias`.
    pub fn delta_position(&self, bias: &ImuBias) -> Vector3<f64> {
        let db = self.bias_delta(bias);
        self.delta_p + self.jp_g * db.gyro + self.jp_a * db.acc
    }

    /// Information of the `[δR, δv, δp]` residual.
    pub fn information_9(&self) -> SMatrix<f64, 9, 9> {
        self.information_block::<9>(0)
    }

    /// Information of the rotation residual alone.
    pub fn rotation_information(&self) -> Matrix3<f64> {
        self.information_block::<3>(0)
    }

    /// Information of the gyroscope bias random walk.
    pub fn gyro_walk_information(&self) -> Matrix3<f64> {
        self.information_block::<3>(9)
    }

    /// Information of the accelerometer bias random walk.
    pub fn acc_walk_information(&self) -> Matrix3<f64> {
        self.information_block::<3>(12)
    }

    fn information_block<const N: usize>(&self, start: usize) -> SMatrix<f64, N, N> {
        let block = self.covariance.fixed_view::<N, N>(start, start).clone_owned();
        let covariance = DMatrix::from_column_slice(N, N, block.as_slice());
        let info = information_from_covariance(&covariance);
        SMatrix::<f64, N, N>::from_column_slice(info.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn integrate(bias: ImuBias, samples: usize) -> Preintegrated {
        let mut preintegrated = Preintegrated::new(bias, &ImuNoise::default());
        for k in 0..samples {
            let t = k as f64 * 0.005;
            let gyro = Vector3::new(0.3 * t.sin(), 0.2, -0.1 * t.cos());
            let acc = Vector3::new(0.5, -0.2 * t, GRAVITY_MAGNITUDE + 0.1 * t.sin());
            preintegrated.integrate_measurement(&acc, &gyro, 0.005);
        }
        preintegrated
    }

    #[test]
    fn test_stationary_integration() {
        let mut preintegrated = Preintegrated::new(ImuBias::default(), &ImuNoise::default());
        for _ in 0..200 {
            preintegrated.integrate_measurement(
                &Vector3::new(0.0, 0.0, GRAVITY_MAGNITUDE),
                &Vector3::zeros(),
                0.005,
            );
        }
        assert!((preintegrated.dt - 1.0).abs() < 1e-12);
        assert!((preintegrated.delta_r - Matrix3::identity()).norm() < 1e-12);
        assert!((preintegrated.delta_v - Vector3::new(0.0, 0.0, GRAVITY_MAGNITUDE)).norm() < 1e-9);
        assert!((preintegrated.delta_p - Vector3::new(0.0, 0.0, 0.5 * GRAVITY_MAGNITUDE)).norm() < 1e-9);
    }

    #[test]
    fn test_bias_correction_matches_reintegration() {
        let bias = ImuBias::default();
        let preintegrated = integrate(bias, 100);

        let perturbed = ImuBias::new(
            Vector3::new(1e-4, -2e-4, 1e-4),
            Vector3::new(-1e-3, 2e-3, 1e-3),
        );
        let reintegrated = integrate(perturbed, 100);

        let corrected = preintegrated.delta_rotation(&perturbed);
        let rotation_error = so3::log(&(corrected.transpose() * reintegrated.delta_r));
        assert!(rotation_error.norm() < 1e-7);
        assert!((preintegrated.delta_velocity(&perturbed) - reintegrated.delta_v).norm() < 1e-6);
        assert!((preintegrated.delta_position(&perturbed) - reintegrated.delta_p).norm() < 1e-6);
    }

    #[test]
    fn test_linearization_bias_gives_raw_deltas() {
        let bias = ImuBias::new(Vector3::new(0.01, 0.0, -0.01), Vector3::new(0.1, 0.1, 0.0));
        let preintegrated = integrate(bias, 50);
        assert_eq!(preintegrated.delta_velocity(&bias), preintegrated.delta_v);
        assert_eq!(preintegrated.delta_position(&bias), preintegrated.delta_p);
        assert!((preintegrated.delta_rotation(&bias) - preintegrated.delta_r).norm() < 1e-12);
    }

    #[test]
    fn test_covariance_growth() {
        let noise = ImuNoise::default();
        let preintegrated = integrate(ImuBias::default(), 40);
        let c = &preintegrated.covariance;
        assert!((c - c.transpose()).norm() < 1e-15);
        let expected_walk = 40.0 * noise.gyro_walk * noise.gyro_walk;
        assert!((c[(9, 9)] - expected_walk).abs() < 1e-18);
        assert!(c[(0, 0)] > 0.0 && c[(3, 3)] > 0.0 && c[(6, 6)] > 0.0);
    }

    #[test]
    fn test_information_blocks_are_finite() {
        let preintegrated = integrate(ImuBias::default(), 100);
        let info = preintegrated.information_9();
        assert!(info.iter().all(|v| v.is_finite()));
        assert!(info[(0, 0)] > 0.0);
        let walk = preintegrated.gyro_walk_information();
        let expected = 1.0 / preintegrated.covariance[(9, 9)];
        assert!((walk[(0, 0)] - expected).abs() / expected < 1e-9);
    }

    #[test]
    fn test_empty_preintegration_has_zero_walk_information() {
        let preintegrated = Preintegrated::new(ImuBias::default(), &ImuNoise::default());
        assert_eq!(preintegrated.acc_walk_information(), Matrix3::zeros());
    }
}
