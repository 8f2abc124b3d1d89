//! Bias random walk and bias prior factors.

use nalgebra::{Matrix3, SMatrix, Vector3};

use super::{Linearization, to_dynamic, vector3_at};
use crate::core::{ProblemResult, Vertex, VertexKind};

/// Random walk between the biases of consecutive keyframes, `e = b₂ - b₁`.
///
/// The same type serves the gyroscope and the accelerometer; the enclosing
/// [`Factor`](super::Factor) variant decides which bias kind is connected.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomWalkFactor {
    pub information: Matrix3<f64>,
}

impl RandomWalkFactor {
    pub fn new(information: Matrix3<f64>) -> Self {
        Self { information }
    }

    pub(crate) fn error(
        &self,
        vertices: &[&Vertex],
        kind: VertexKind,
        factor: &'static str,
    ) -> ProblemResult<Vector3<f64>> {
        let b1 = vector3_at(vertices, 0, kind, factor)?;
        let b2 = vector3_at(vertices, 1, kind, factor)?;
        Ok(b2 - b1)
    }

    pub(crate) fn linearize(
        &self,
        vertices: &[&Vertex],
        kind: VertexKind,
        factor: &'static str,
    ) -> ProblemResult<Linearization> {
        let residual = self.error(vertices, kind, factor)?;
        let identity = Matrix3::<f64>::identity();
        Ok(Linearization::from_fixed(&residual, vec![
            to_dynamic(&(-identity)),
            to_dynamic(&identity),
        ]))
    }
}

/// Prior on a single bias, `e = b_prior - b`.
#[derive(Debug, Clone, PartialEq)]
pub struct BiasPriorFactor {
    pub prior: Vector3<f64>,
    pub information: Matrix3<f64>,
}

impl BiasPriorFactor {
    /// Prior with isotropic information `weight · I`.
    pub fn new(prior: Vector3<f64>, weight: f64) -> Self {
        Self {
            prior,
            information: Matrix3::identity() * weight,
        }
    }

    pub(crate) fn error(
        &self,
        vertices: &[&Vertex],
        kind: VertexKind,
        factor: &'static str,
    ) -> ProblemResult<Vector3<f64>> {
        let bias = vector3_at(vertices, 0, kind, factor)?;
        Ok(self.prior - bias)
    }

    pub(crate) fn linearize(
        &self,
        vertices: &[&Vertex],
        kind: VertexKind,
        factor: &'static str,
    ) -> ProblemResult<Linearization> {
        let residual = self.error(vertices, kind, factor)?;
        let jacobian: SMatrix<f64, 3, 3> = -Matrix3::identity();
        Ok(Linearization::from_fixed(&residual, vec![to_dynamic(&jacobian)]))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::core::ProblemError;
    use crate::factors::Factor;

    #[test]
    fn test_random_walk_residual_and_jacobians() {
        let factor = Factor::GyroRandomWalk(RandomWalkFactor::new(Matrix3::identity() * 4.0));
        let b1 = Vertex::GyroBias(Vector3::new(0.1, 0.2, 0.3));
        let b2 = Vertex::GyroBias(Vector3::new(0.15, 0.2, 0.25));
        let lin = factor.linearize(&[&b1, &b2]).unwrap();
        assert!((lin.residual[0] - 0.05).abs() < 1e-15);
        assert!((lin.residual[2] + 0.05).abs() < 1e-15);
        assert_eq!(lin.jacobians[0][(1, 1)], -1.0);
        assert_eq!(lin.jacobians[1][(1, 1)], 1.0);
        assert_eq!(factor.information()[(0, 0)], 4.0);
    }

    #[test]
    fn test_random_walk_rejects_other_bias_kind() {
        let factor = Factor::AccRandomWalk(RandomWalkFactor::new(Matrix3::identity()));
        let b1 = Vertex::GyroBias(Vector3::zeros());
        let b2 = Vertex::AccBias(Vector3::zeros());
        let err = factor.error(&[&b1, &b2]).unwrap_err();
        assert!(matches!(err, ProblemError::VertexMismatch { .. }));
    }

    #[test]
    fn test_bias_prior() {
        let factor = Factor::PriorAccBias(BiasPriorFactor::new(Vector3::new(0.1, 0.0, 0.0), 1e5));
        let bias = Vertex::AccBias(Vector3::new(0.05, 0.0, 0.0));
        let lin = factor.linearize(&[&bias]).unwrap();
        assert!((lin.residual[0] - 0.05).abs() < 1e-15);
        assert_eq!(lin.jacobians[0][(0, 0)], -1.0);
        assert_eq!(lin.jacobians[0][(0, 1)], 0.0);
    }
}
