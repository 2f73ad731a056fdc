//! Sliding-window marginalization via Schur complement.
//!
//! Residuals touching the frames to be removed are linearized at the current
//! estimate; the parameter blocks are sorted keep-first, the stacked system
//! `H = JᵀJ, g = Jᵀr` is block-partitioned, and the removed block is
//! eliminated:
//!
//! ```text
//! A = H11 − H12 · H22⁻¹ · H21      b = g1 − H12 · H22⁻¹ · g2
//! ```
//!
//! yielding a [`PriorFactor`] over the kept parameters. `H22⁻¹` is a
//! spectral pseudo-inverse, so a rank-deficient removed block (a landmark
//! seen once, an unobservable direction) degrades gracefully instead of
//! poisoning the prior.

use std::collections::{HashMap, HashSet};

use nalgebra::{DMatrix, DVector};

use crate::factors::{ParamInfo, PriorFactor, PriorParam, ResidualInfo};
use crate::state::{FrameId, GraphState, ParamBlockId, ParamKind};

/// Eigenvalue cutoff of the H22 pseudo-inverse.
const RANK_EPS: f64 = 1e-10;

/// Builds the linearized system for removed frames and condenses it into a
/// prior on the remaining parameters.
#[derive(Default)]
pub struct Marginalizer {
    residuals: Vec<ResidualInfo>,
}

impl Marginalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a residual of the full problem. Residuals that do not touch
    /// a removed frame are filtered out at marginalization time.
    pub fn add_residual(&mut self, info: ResidualInfo) {
        self.residuals.push(info);
    }

    pub fn residual_count(&self) -> usize {
        self.residuals.len()
    }

    /// Marginalize the given frames out of the registered problem.
    ///
    /// Returns None when nothing is removed or nothing would remain.
    pub fn marginalize(
        &self,
        state: &GraphState,
        remove_frame_ids: &HashSet<FrameId>,
    ) -> Option<PriorFactor> {
        // Retain residuals touching a removed frame; flag removed blocks.
        // A pose or speed-bias block is removed with its frame; a landmark
        // is removed when its base frame is removed.
        let retained: Vec<&ResidualInfo> = self
            .residuals
            .iter()
            .filter(|r| r.relevant(remove_frame_ids))
            .collect();
        if retained.is_empty() {
            return None;
        }

        let mut params: HashMap<ParamBlockId, ParamInfo> = HashMap::new();
        let mut eff_residual_size = 0;
        for info in &retained {
            eff_residual_size += info.residual_size();
            for mut p in info.params_list(state) {
                p.is_remove = match p.kind {
                    ParamKind::Pose | ParamKind::SpeedBias | ParamKind::Landmark => p
                        .frame
                        .map(|f| remove_frame_ids.contains(&f))
                        .unwrap_or(false),
                    ParamKind::Extrinsic | ParamKind::TimeOffset => false,
                };
                params.insert(p.block, p);
            }
        }

        // Sort keep-first and assign cumulative tangent indices.
        let mut params_list: Vec<ParamInfo> = params.into_values().collect();
        params_list.sort_by_key(|p| (p.is_remove, p.block));
        let mut cul_param_size = 0;
        let mut remove_size = 0;
        for p in &mut params_list {
            p.index = cul_param_size;
            cul_param_size += p.eff_size;
            if p.is_remove {
                remove_size += p.eff_size;
            }
        }
        let eff_param_size = cul_param_size;
        let keep_size = eff_param_size - remove_size;
        if remove_size == 0 || keep_size == 0 {
            return None;
        }
        let index_of: HashMap<ParamBlockId, usize> =
            params_list.iter().map(|p| (p.block, p.index)).collect();

        tracing::debug!(
            "marginalize: {} residuals, {} params ({} removed)",
            retained.len(),
            eff_param_size,
            remove_size
        );

        // Stack residuals and scatter tangent-space Jacobian blocks.
        let mut jac = DMatrix::zeros(eff_residual_size, eff_param_size);
        let mut res_vec = DVector::zeros(eff_residual_size);
        let mut cul_res_size = 0;
        for info in &retained {
            let (r, jacs) = info.evaluate(state);
            let rows = r.len();
            res_vec.rows_mut(cul_res_size, rows).copy_from(&r);
            for (k, p) in info.params_list(state).iter().enumerate() {
                let col = index_of[&p.block];
                assert!(
                    cul_res_size + rows <= eff_residual_size
                        && col + p.eff_size <= eff_param_size,
                    "jacobian index out of bounds during marginalization"
                );
                jac.view_mut((cul_res_size, col), (rows, p.eff_size))
                    .copy_from(&jacs[k]);
            }
            cul_res_size += rows;
        }

        // Schur complement with the keep block first.
        let h = jac.transpose() * &jac;
        let g = jac.transpose() * &res_vec;
        let h11 = h.view((0, 0), (keep_size, keep_size)).into_owned();
        let h12 = h.view((0, keep_size), (keep_size, remove_size)).into_owned();
        let h22 = h
            .view((keep_size, keep_size), (remove_size, remove_size))
            .into_owned();
        let g1 = g.rows(0, keep_size).into_owned();
        let g2 = g.rows(keep_size, remove_size).into_owned();

        let h22_inv = spectral_pseudo_inverse(&h22);
        let a = &h11 - &h12 * &h22_inv * h12.transpose();
        let b = &g1 - &h12 * &h22_inv * &g2;

        let keep_params: Vec<PriorParam> = params_list
            .iter()
            .filter(|p| !p.is_remove)
            .map(|p| PriorParam {
                block: p.block,
                kind: p.kind,
                frame: p.frame,
                manifold: p.manifold,
                x0: state.block_values(p.block).to_vec(),
                index: p.index,
            })
            .collect();

        Some(PriorFactor::new(keep_params, &a, &b))
    }
}

/// Pseudo-inverse of a symmetric PSD matrix via eigendecomposition.
fn spectral_pseudo_inverse(m: &DMatrix<f64>) -> DMatrix<f64> {
    let sym = 0.5 * (m + m.transpose());
    let eigen = nalgebra::SymmetricEigen::new(sym);
    let mut inv_s = DVector::zeros(m.nrows());
    for i in 0..m.nrows() {
        let s = eigen.eigenvalues[i];
        if s.abs() > RANK_EPS {
            inv_s[i] = 1.0 / s;
        }
    }
    &eigen.eigenvectors * DMatrix::from_diagonal(&inv_s) * eigen.eigenvectors.transpose()
}
