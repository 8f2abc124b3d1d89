//! Schur complement elimination of landmark blocks.
//!
//! Bundle adjustment normal equations have the arrow structure
//!
//! ```text
//! [ H_pp  H_pl ] [δp]   [b_p]
//! [ H_lp  H_ll ] [δl] = [b_l]
//! ```
//!
//! where `H_ll` is block-diagonal with one small block per landmark. Eliminating the
//! landmarks gives the reduced camera system
//!
//! ```text
//! S  = H_pp - Σ_l H_pl H_ll⁻¹ H_lp
//! g  = b_p  - Σ_l H_pl H_ll⁻¹ b_l
//! δl = H_ll⁻¹ (b_l - H_lp δp)
//! ```
//!
//! which is solved densely. Levenberg-Marquardt damping is added to every diagonal
//! (both `H_pp` and each `H_ll`) before elimination.

use nalgebra::{DMatrix, DVector};
use std::collections::BTreeMap;

use super::{LinAlgError, LinAlgResult, LinearSolver};

/// One eliminated parameter block and its coupling to the retained system.
#[derive(Debug, Clone)]
pub struct LandmarkBlock {
    /// Diagonal Hessian block of the landmark
    pub h_ll: DMatrix<f64>,
    /// Right-hand side of the landmark
    pub b_l: DVector<f64>,
    /// Coupling blocks `H_pl`, keyed by the row offset of the retained block
    pub coupling: BTreeMap<usize, DMatrix<f64>>,
}

impl LandmarkBlock {
    fn new(dim: usize) -> Self {
        Self {
            h_ll: DMatrix::zeros(dim, dim),
            b_l: DVector::zeros(dim),
            coupling: BTreeMap::new(),
        }
    }

    /// Dimension of the landmark block.
    pub fn dim(&self) -> usize {
        self.b_l.len()
    }
}

/// Normal equations split into a dense retained part and eliminated landmark blocks.
#[derive(Debug, Clone)]
pub struct BlockSystem {
    /// Retained (camera, inertial, ...) Hessian
    pub h_pp: DMatrix<f64>,
    /// Retained right-hand side
    pub b_p: DVector<f64>,
    /// Eliminated blocks
    pub landmarks: Vec<LandmarkBlock>,
}

impl BlockSystem {
    /// Empty system with `retained_dim` dense unknowns.
    pub fn new(retained_dim: usize) -> Self {
        Self {
            h_pp: DMatrix::zeros(retained_dim, retained_dim),
            b_p: DVector::zeros(retained_dim),
            landmarks: Vec::new(),
        }
    }

    /// Register an eliminated block of dimension `dim` and return its index.
    pub fn add_landmark(&mut self, dim: usize) -> usize {
        self.landmarks.push(LandmarkBlock::new(dim));
        self.landmarks.len() - 1
    }

    /// Accumulate `block` into `H_pp` at `(row, col)`.
    pub fn add_retained(&mut self, row: usize, col: usize, block: &DMatrix<f64>) {
        let mut view = self.h_pp.view_mut((row, col), block.shape());
        view += block;
    }

    /// Accumulate `block` (retained rows × landmark cols) into the coupling of `landmark`.
    pub fn add_coupling(&mut self, landmark: usize, row: usize, block: &DMatrix<f64>) {
        let entry = self.landmarks[landmark]
            .coupling
            .entry(row)
            .or_insert_with(|| DMatrix::zeros(block.nrows(), block.ncols()));
        *entry += block;
    }

    /// Largest diagonal entry over all blocks, used to seed the damping.
    pub fn max_diagonal(&self) -> f64 {
        let retained = self.h_pp.diagonal().iter().copied().fold(0.0_f64, f64::max);
        self.landmarks
            .iter()
            .map(|l| l.h_ll.diagonal().iter().copied().fold(0.0_f64, f64::max))
            .fold(retained, f64::max)
    }

    /// Total number of unknowns.
    pub fn dim(&self) -> usize {
        self.b_p.len() + self.landmarks.iter().map(LandmarkBlock::dim).sum::<usize>()
    }

    /// Solve the damped system `(H + λI) δ = b`.
    ///
    /// # Returns
    ///
    /// The retained step and one step per eliminated block, in registration order.
    pub fn solve(
        &self,
        damping: f64,
        solver: &mut dyn LinearSolver,
    ) -> LinAlgResult<(DVector<f64>, Vec<DVector<f64>>)> {
        let n = self.b_p.len();
        let mut s = self.h_pp.clone();
        for i in 0..n {
            s[(i, i)] += damping;
        }
        let mut g = self.b_p.clone();

        let mut inverses = Vec::with_capacity(self.landmarks.len());
        for (index, landmark) in self.landmarks.iter().enumerate() {
            let mut h_ll = landmark.h_ll.clone();
            for i in 0..landmark.dim() {
                h_ll[(i, i)] += damping;
            }
            let inv = h_ll.try_inverse().ok_or_else(|| {
                LinAlgError::SingularBlock(format!("eliminated block {index} is not invertible"))
            })?;

            let inv_b = &inv * &landmark.b_l;
            for (&row_i, h_i) in &landmark.coupling {
                let h_i_inv = h_i * &inv;
                {
                    let mut g_view = g.rows_mut(row_i, h_i.nrows());
                    g_view -= h_i * &inv_b;
                }
                for (&row_j, h_j) in &landmark.coupling {
                    let mut s_view = s.view_mut((row_i, row_j), (h_i.nrows(), h_j.nrows()));
                    s_view -= &h_i_inv * h_j.transpose();
                }
            }
            inverses.push(inv);
        }

        let dx_p = solver.solve(&s, &g)?;

        let dx_l = self
            .landmarks
            .iter()
            .zip(inverses)
            .map(|(landmark, inv)| {
                let mut rhs = landmark.b_l.clone();
                for (&row, h_pl) in &landmark.coupling {
                    rhs -= h_pl.transpose() * dx_p.rows(row, h_pl.nrows());
                }
                inv * rhs
            })
            .collect();

        Ok((dx_p, dx_l))
    }
}
