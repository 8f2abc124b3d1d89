//! Per-call factor graph arena and normal-equation assembly.
//!
//! A [`Problem`] owns the vertices and factors of one optimization call. Vertices and
//! factors are addressed by [`VertexId`] and [`FactorId`] handles handed out on insertion;
//! nothing is shared with the caller, who copies the estimates out once the solver is
//! done.
//!
//! # Linearization
//!
//! Factors are linearized only by an explicit [`Problem::linearize`] call, which caches a
//! [`Linearization`] on every active factor. The assembly of the normal equations and the
//! Hessian accessors read this cache and fail with [`ProblemError::NotLinearized`] when it
//! is missing.
//!
//! # Assembly
//!
//! With a robust loss ρ the information of a factor is weighted by `ρ'(χ²)`:
//!
//! ```text
//! W     = ρ'(eᵀΩe) · Ω
//! H_ij += J_iᵀ W J_j
//! b_i  -= J_iᵀ W e
//! ```
//!
//! Vertices flagged as marginalized become eliminated blocks of the [`BlockSystem`];
//! all other free vertices form the retained system. Fixed vertices, and vertices not
//! touched by any active factor, receive no columns.

use nalgebra::{DMatrix, DVector};

use super::loss_functions::Loss;
use super::variable::{FactorId, Vertex, VertexId, VertexKind};
use super::{ProblemError, ProblemResult};
use crate::factors::{Factor, Linearization};
use crate::linalg::BlockSystem;

#[derive(Debug, Clone)]
struct VertexEntry {
    vertex: Vertex,
    fixed: bool,
    marginalized: bool,
}

#[derive(Debug)]
struct FactorEntry {
    factor: Factor,
    vertices: Vec<VertexId>,
    robust: Option<Box<dyn Loss>>,
    active: bool,
    linearization: Option<Linearization>,
}

/// Column block of a vertex in the assembled system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSlot {
    /// Rows `offset..offset + dim` of the retained system
    Retained { offset: usize, dim: usize },
    /// Eliminated block `index`
    Eliminated { index: usize, dim: usize },
}

/// Mapping from vertices to blocks of the assembled system.
#[derive(Debug, Clone, Default)]
pub struct SystemLayout {
    slots: Vec<Option<BlockSlot>>,
    retained_dim: usize,
    eliminated_dims: Vec<usize>,
}

impl SystemLayout {
    /// Block of vertex `id`, `None` when it is not optimized.
    pub fn slot(&self, id: VertexId) -> Option<BlockSlot> {
        self.slots.get(id.0).copied().flatten()
    }

    /// Dimension of the retained system.
    pub fn retained_dim(&self) -> usize {
        self.retained_dim
    }

    /// Number of eliminated blocks.
    pub fn num_eliminated(&self) -> usize {
        self.eliminated_dims.len()
    }
}

/// Saved vertex estimates, used to undo a rejected step.
#[derive(Debug, Clone)]
pub struct EstimateBackup(Vec<Vertex>);

/// Factor graph of one optimization call.
#[derive(Debug, Default)]
pub struct Problem {
    vertices: Vec<VertexEntry>,
    factors: Vec<FactorEntry>,
}

impl Problem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a free vertex.
    pub fn add_vertex(&mut self, vertex: Vertex) -> VertexId {
        self.vertices.push(VertexEntry {
            vertex,
            fixed: false,
            marginalized: false,
        });
        VertexId(self.vertices.len() - 1)
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn num_factors(&self) -> usize {
        self.factors.len()
    }

    fn vertex_entry(&self, id: VertexId) -> ProblemResult<&VertexEntry> {
        self.vertices
            .get(id.0)
            .ok_or(ProblemError::UnknownVertex(id.0))
    }

    fn vertex_entry_mut(&mut self, id: VertexId) -> ProblemResult<&mut VertexEntry> {
        self.vertices
            .get_mut(id.0)
            .ok_or(ProblemError::UnknownVertex(id.0))
    }

    fn factor_entry(&self, id: FactorId) -> ProblemResult<&FactorEntry> {
        self.factors
            .get(id.0)
            .ok_or(ProblemError::UnknownFactor(id.0))
    }

    fn factor_entry_mut(&mut self, id: FactorId) -> ProblemResult<&mut FactorEntry> {
        self.factors
            .get_mut(id.0)
            .ok_or(ProblemError::UnknownFactor(id.0))
    }

    /// Current estimate of vertex `id`.
    pub fn vertex(&self, id: VertexId) -> ProblemResult<&Vertex> {
        Ok(&self.vertex_entry(id)?.vertex)
    }

    /// Replace the estimate of vertex `id` with a vertex of the same kind.
    pub fn set_estimate(&mut self, id: VertexId, vertex: Vertex) -> ProblemResult<()> {
        let entry = self.vertex_entry_mut(id)?;
        if entry.vertex.kind() != vertex.kind() || entry.vertex.dimension() != vertex.dimension() {
            return Err(ProblemError::InvalidInput(format!(
                "cannot replace {:?} vertex {id} with {:?}",
                entry.vertex.kind(),
                vertex.kind()
            )));
        }
        entry.vertex = vertex;
        Ok(())
    }

    /// Hold vertex `id` constant.
    pub fn set_fixed(&mut self, id: VertexId, fixed: bool) -> ProblemResult<()> {
        self.vertex_entry_mut(id)?.fixed = fixed;
        Ok(())
    }

    pub fn is_fixed(&self, id: VertexId) -> ProblemResult<bool> {
        Ok(self.vertex_entry(id)?.fixed)
    }

    /// Eliminate vertex `id` by Schur complement when solving.
    pub fn set_marginalized(&mut self, id: VertexId, marginalized: bool) -> ProblemResult<()> {
        self.vertex_entry_mut(id)?.marginalized = marginalized;
        Ok(())
    }

    /// Insert a factor connecting `vertices`, in slot order.
    ///
    /// # Errors
    ///
    /// - [`ProblemError::UnknownVertex`] for a dangling handle
    /// - [`ProblemError::VertexMismatch`] when a slot holds a vertex of the wrong kind
    /// - [`ProblemError::InvalidInput`] for a wrong arity, a stereo factor on a pose without
    ///   `bf`, or a camera index the pose does not have
    pub fn add_factor(&mut self, factor: Factor, vertices: &[VertexId]) -> ProblemResult<FactorId> {
        let slot_kinds = factor.slot_kinds();
        if vertices.len() != slot_kinds.len() {
            return Err(ProblemError::InvalidInput(format!(
                "{} factor expects {} vertices, got {}",
                factor.name(),
                slot_kinds.len(),
                vertices.len()
            )));
        }

        for (&id, kinds) in vertices.iter().zip(slot_kinds) {
            let vertex = self.vertex(id)?;
            let kind = vertex.kind();
            if !kinds.contains(&kind) {
                return Err(ProblemError::VertexMismatch {
                    factor: factor.name(),
                    expected: kinds.first().copied().unwrap_or(VertexKind::Pose),
                    found: kind,
                });
            }
            if let Some(pose) = vertex.as_pose() {
                if factor.requires_bf() && pose.bf.is_none() {
                    return Err(ProblemError::InvalidInput(format!(
                        "{} factor on vertex {id} requires a stereo rig with bf",
                        factor.name()
                    )));
                }
                if let Some(cam) = factor.camera_index()
                    && cam >= pose.num_cameras()
                {
                    return Err(ProblemError::InvalidInput(format!(
                        "{} factor reads camera {cam}, vertex {id} has {} cameras",
                        factor.name(),
                        pose.num_cameras()
                    )));
                }
            }
        }

        self.factors.push(FactorEntry {
            factor,
            vertices: vertices.to_vec(),
            robust: None,
            active: true,
            linearization: None,
        });
        Ok(FactorId(self.factors.len() - 1))
    }

    pub fn factor(&self, id: FactorId) -> ProblemResult<&Factor> {
        Ok(&self.factor_entry(id)?.factor)
    }

    /// Vertices connected by factor `id`, in slot order.
    pub fn factor_vertices(&self, id: FactorId) -> ProblemResult<&[VertexId]> {
        Ok(&self.factor_entry(id)?.vertices)
    }

    /// Attach or remove the robust loss of factor `id`.
    pub fn set_robust(&mut self, id: FactorId, loss: Option<Box<dyn Loss>>) -> ProblemResult<()> {
        self.factor_entry_mut(id)?.robust = loss;
        Ok(())
    }

    /// Remove the robust loss of every factor.
    pub fn clear_robust(&mut self) {
        for entry in &mut self.factors {
            entry.robust = None;
        }
    }

    /// Include or exclude factor `id` from the objective.
    pub fn set_active(&mut self, id: FactorId, active: bool) -> ProblemResult<()> {
        let entry = self.factor_entry_mut(id)?;
        entry.active = active;
        if !active {
            entry.linearization = None;
        }
        Ok(())
    }

    pub fn is_active(&self, id: FactorId) -> ProblemResult<bool> {
        Ok(self.factor_entry(id)?.active)
    }

    fn gather<'a>(&'a self, ids: &[VertexId]) -> ProblemResult<Vec<&'a Vertex>> {
        ids.iter().map(|&id| self.vertex(id)).collect()
    }

    /// Error vector of factor `id` at the current estimates.
    pub fn error(&self, id: FactorId) -> ProblemResult<DVector<f64>> {
        let entry = self.factor_entry(id)?;
        let vertices = self.gather(&entry.vertices)?;
        entry.factor.error(&vertices)
    }

    /// Squared Mahalanobis error `eᵀΩe` of factor `id` at the current estimates.
    pub fn chi2(&self, id: FactorId) -> ProblemResult<f64> {
        let entry = self.factor_entry(id)?;
        let error = self.error(id)?;
        Ok(error.dot(&(entry.factor.information() * &error)))
    }

    /// Objective `Σ ρ(χ²)` over the active factors.
    pub fn total_cost(&self) -> ProblemResult<f64> {
        let mut cost = 0.0;
        for (index, entry) in self.factors.iter().enumerate() {
            if !entry.active {
                continue;
            }
            let chi2 = self.chi2(FactorId(index))?;
            cost += match &entry.robust {
                Some(loss) => loss.evaluate(chi2)[0],
                None => chi2,
            };
        }
        Ok(cost)
    }

    /// Linearize every active factor at the current estimates and cache the result.
    pub fn linearize(&mut self) -> ProblemResult<()> {
        let mut linearizations = Vec::with_capacity(self.factors.len());
        for entry in &self.factors {
            if entry.active {
                let vertices = self.gather(&entry.vertices)?;
                linearizations.push(Some(entry.factor.linearize(&vertices)?));
            } else {
                linearizations.push(None);
            }
        }
        for (entry, linearization) in self.factors.iter_mut().zip(linearizations) {
            entry.linearization = linearization;
        }
        Ok(())
    }

    /// Cached linearization of factor `id`.
    pub fn linearization(&self, id: FactorId) -> ProblemResult<&Linearization> {
        self.factor_entry(id)?
            .linearization
            .as_ref()
            .ok_or(ProblemError::NotLinearized(id.0))
    }

    /// Assign system blocks to the free vertices touched by an active factor.
    pub fn layout(&self) -> SystemLayout {
        let mut used = vec![false; self.vertices.len()];
        for entry in self.factors.iter().filter(|entry| entry.active) {
            for id in &entry.vertices {
                used[id.0] = true;
            }
        }

        let mut layout = SystemLayout {
            slots: vec![None; self.vertices.len()],
            ..SystemLayout::default()
        };
        for (index, entry) in self.vertices.iter().enumerate() {
            if entry.fixed || !used[index] {
                continue;
            }
            let dim = entry.vertex.dimension();
            layout.slots[index] = Some(if entry.marginalized {
                layout.eliminated_dims.push(dim);
                BlockSlot::Eliminated {
                    index: layout.eliminated_dims.len() - 1,
                    dim,
                }
            } else {
                let offset = layout.retained_dim;
                layout.retained_dim += dim;
                BlockSlot::Retained { offset, dim }
            });
        }
        layout
    }

    /// Assemble the robustly weighted normal equations from the cached linearizations.
    pub fn build_block_system(&self) -> ProblemResult<(BlockSystem, SystemLayout)> {
        let layout = self.layout();
        let mut system = BlockSystem::new(layout.retained_dim);
        for &dim in &layout.eliminated_dims {
            system.add_landmark(dim);
        }

        for (index, entry) in self.factors.iter().enumerate() {
            if !entry.active {
                continue;
            }
            let lin = entry
                .linearization
                .as_ref()
                .ok_or(ProblemError::NotLinearized(index))?;
            let information = entry.factor.information();
            let chi2 = lin.residual.dot(&(&information * &lin.residual));
            let weight = entry
                .robust
                .as_ref()
                .map_or(1.0, |loss| loss.evaluate(chi2)[1]);
            let w = information * weight;
            let we = &w * &lin.residual;

            for (i, id_i) in entry.vertices.iter().enumerate() {
                let Some(slot_i) = layout.slot(*id_i) else {
                    continue;
                };
                let jt_w = lin.jacobians[i].transpose() * &w;
                let gradient = -(lin.jacobians[i].transpose() * &we);
                match slot_i {
                    BlockSlot::Retained { offset, dim } => {
                        let mut rows = system.b_p.rows_mut(offset, dim);
                        rows += &gradient;
                    }
                    BlockSlot::Eliminated { index, .. } => {
                        system.landmarks[index].b_l += &gradient;
                    }
                }

                for (j, id_j) in entry.vertices.iter().enumerate() {
                    let Some(slot_j) = layout.slot(*id_j) else {
                        continue;
                    };
                    let block = &jt_w * &lin.jacobians[j];
                    match (slot_i, slot_j) {
                        (
                            BlockSlot::Retained { offset: row, .. },
                            BlockSlot::Retained { offset: col, .. },
                        ) => system.add_retained(row, col, &block),
                        (
                            BlockSlot::Retained { offset: row, .. },
                            BlockSlot::Eliminated { index: l, .. },
                        ) => system.add_coupling(l, row, &block),
                        (
                            BlockSlot::Eliminated { index: li, .. },
                            BlockSlot::Eliminated { index: lj, .. },
                        ) => {
                            if li != lj {
                                return Err(ProblemError::InvalidInput(format!(
                                    "{} factor {index} couples two eliminated vertices",
                                    entry.factor.name()
                                )));
                            }
                            system.landmarks[li].h_ll += &block;
                        }
                        (BlockSlot::Eliminated { .. }, BlockSlot::Retained { .. }) => {}
                    }
                }
            }
        }
        Ok((system, layout))
    }

    /// Apply a solved step to the optimized vertices.
    pub fn apply_update(
        &mut self,
        layout: &SystemLayout,
        dx_p: &DVector<f64>,
        dx_l: &[DVector<f64>],
    ) -> ProblemResult<()> {
        for (index, entry) in self.vertices.iter_mut().enumerate() {
            match layout.slot(VertexId(index)) {
                Some(BlockSlot::Retained { offset, dim }) => {
                    let step = dx_p.as_slice().get(offset..offset + dim).ok_or_else(|| {
                        ProblemError::InvalidInput(format!(
                            "retained step has {} rows, vertex {index} needs {}..{}",
                            dx_p.len(),
                            offset,
                            offset + dim
                        ))
                    })?;
                    entry.vertex.oplus(step);
                }
                Some(BlockSlot::Eliminated { index: l, dim }) => {
                    let step = dx_l.get(l).filter(|step| step.len() == dim).ok_or_else(|| {
                        ProblemError::InvalidInput(format!("missing step of eliminated block {l}"))
                    })?;
                    entry.vertex.oplus(step.as_slice());
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Copy of every vertex estimate.
    pub fn backup(&self) -> EstimateBackup {
        EstimateBackup(self.vertices.iter().map(|e| e.vertex.clone()).collect())
    }

    /// Restore the estimates saved by [`backup`](Self::backup).
    pub fn restore(&mut self, backup: &EstimateBackup) {
        for (entry, vertex) in self.vertices.iter_mut().zip(&backup.0) {
            entry.vertex = vertex.clone();
        }
    }

    /// `JᵀΩJ` of factor `id` over its vertices in slot order, without robust weighting.
    pub fn factor_hessian(&self, id: FactorId) -> ProblemResult<DMatrix<f64>> {
        let entry = self.factor_entry(id)?;
        let lin = self.linearization(id)?;
        let jacobian = stack_columns(&lin.jacobians);
        Ok(jacobian.transpose() * entry.factor.information() * jacobian)
    }

    /// Joint Hessian `Σ JᵀΩJ` over `order`, without robust weighting.
    ///
    /// Every active factor whose vertices all belong to `order` contributes; rows and
    /// columns follow `order`, each vertex taking its tangent dimension.
    pub fn joint_hessian(&self, order: &[VertexId]) -> ProblemResult<DMatrix<f64>> {
        let mut offsets = Vec::with_capacity(order.len());
        let mut dim = 0;
        for &id in order {
            offsets.push(dim);
            dim += self.vertex(id)?.dimension();
        }
        let position = |id: VertexId| order.iter().position(|&v| v == id);

        let mut h = DMatrix::zeros(dim, dim);
        for (index, entry) in self.factors.iter().enumerate() {
            if !entry.active || !entry.vertices.iter().all(|&v| position(v).is_some()) {
                continue;
            }
            let lin = entry
                .linearization
                .as_ref()
                .ok_or(ProblemError::NotLinearized(index))?;
            let information = entry.factor.information();
            for (i, &id_i) in entry.vertices.iter().enumerate() {
                let row = position(id_i).map_or(0, |p| offsets[p]);
                let jt_w = lin.jacobians[i].transpose() * &information;
                for (j, &id_j) in entry.vertices.iter().enumerate() {
                    let col = position(id_j).map_or(0, |p| offsets[p]);
                    let block = &jt_w * &lin.jacobians[j];
                    let mut view = h.view_mut((row, col), block.shape());
                    view += &block;
                }
            }
        }
        Ok(h)
    }
}

fn stack_columns(blocks: &[DMatrix<f64>]) -> DMatrix<f64> {
    let rows = blocks.first().map_or(0, DMatrix::nrows);
    let cols = blocks.iter().map(DMatrix::ncols).sum();
    let mut stacked = DMatrix::zeros(rows, cols);
    let mut offset = 0;
    for block in blocks {
        stacked
            .view_mut((0, offset), block.shape())
            .copy_from(block);
        offset += block.ncols();
    }
    stacked
}
