//! Thin adapter over the Levenberg-Marquardt engine.
//!
//! Residual blocks are registered as `ResidualInfo` records; at `solve` time
//! the adapter packs every non-constant parameter block into one minimal
//! chart-coordinate vector, hands the assembled problem to
//! `levenberg_marquardt::LevenbergMarquardt`, and unpacks the result back
//! into the `GraphState` arenas. Constant blocks (the gauge anchor) are
//! excluded from the parameter vector entirely, so they are bit-identical
//! before and after a solve.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DMatrix, DVector, Dyn, Owned};

use crate::factors::{Manifold, ResidualInfo};
use crate::state::{GraphState, ParamBlockId};

/// Options forwarded to the nonlinear engine.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Iteration budget (LM patience).
    pub max_iterations: usize,
    /// Relative reduction tolerance on the cost.
    pub ftol: f64,
    /// Relative tolerance on the parameter step.
    pub xtol: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            ftol: 1e-12,
            xtol: 1e-12,
        }
    }
}

/// Outcome of one nonlinear solve.
#[derive(Debug, Clone)]
pub struct SolveReport {
    /// Cost 0.5·‖r‖² before optimization.
    pub initial_cost: f64,
    /// Cost 0.5·‖r‖² after optimization.
    pub final_cost: f64,
    /// Wall-clock time in seconds.
    pub total_time: f64,
    /// Residual/Jacobian evaluations spent.
    pub iterations: usize,
    /// Whether the engine reported successful termination.
    pub converged: bool,
}

/// Wraps the nonlinear-least-squares engine behind residual-info records.
pub struct SolverAdapter {
    config: SolverConfig,
    residuals: Vec<ResidualInfo>,
    manifolds: HashMap<ParamBlockId, Manifold>,
    constants: HashSet<ParamBlockId>,
}

impl SolverAdapter {
    pub fn new(config: SolverConfig) -> Self {
        Self {
            config,
            residuals: Vec::new(),
            manifolds: HashMap::new(),
            constants: HashSet::new(),
        }
    }

    /// Register a residual block. The adapter owns it until reset.
    pub fn add_residual(&mut self, info: ResidualInfo) {
        self.residuals.push(info);
    }

    pub fn residuals(&self) -> &[ResidualInfo] {
        &self.residuals
    }

    /// Drop all registered residuals (distributed-mode solver reuse).
    pub fn reset_residuals(&mut self) {
        self.residuals.clear();
        self.manifolds.clear();
        self.constants.clear();
    }

    /// Install a parameterization on a block.
    pub fn set_manifold(&mut self, block: ParamBlockId, manifold: Manifold) {
        self.manifolds.insert(block, manifold);
    }

    /// Hold a block constant for the duration of the solve (gauge fixing).
    pub fn set_constant(&mut self, block: ParamBlockId) {
        self.constants.insert(block);
    }

    pub fn is_constant(&self, block: ParamBlockId) -> bool {
        self.constants.contains(&block)
    }

    /// Run the engine and write the optimized values back into `state`.
    pub fn solve(&mut self, state: &mut GraphState) -> SolveReport {
        let start = Instant::now();

        // Collect every referenced block, in deterministic order.
        let mut seen = HashSet::new();
        let mut blocks: Vec<ParamBlockId> = Vec::new();
        for info in &self.residuals {
            for block in info.blocks(state) {
                if seen.insert(block) {
                    blocks.push(block);
                }
            }
        }
        blocks.sort();

        let slot_of: HashMap<ParamBlockId, usize> =
            blocks.iter().enumerate().map(|(i, &b)| (b, i)).collect();
        let manifold_of = |adapter: &Self, block: ParamBlockId| -> Manifold {
            adapter.manifolds.get(&block).copied().unwrap_or_else(|| {
                Manifold::for_kind(
                    state.block_kind(block),
                    state.pose_dof(),
                    state.block_values(block).len(),
                )
            })
        };

        // Snapshot ambient values; constants stay frozen in the snapshot.
        let ambient: Vec<Vec<f64>> = blocks
            .iter()
            .map(|&b| state.block_values(b).to_vec())
            .collect();

        // Free blocks get a contiguous chart-coordinate range.
        let mut free_slots: Vec<(usize, Manifold, usize)> = Vec::new();
        let mut n_params = 0;
        for (slot, &block) in blocks.iter().enumerate() {
            if self.constants.contains(&block) {
                continue;
            }
            let manifold = manifold_of(self, block);
            free_slots.push((slot, manifold, n_params));
            n_params += manifold.tangent_size();
        }

        // Per-residual slot and manifold resolution, done once.
        let res_slots: Vec<Vec<usize>> = self
            .residuals
            .iter()
            .map(|info| info.blocks(state).iter().map(|b| slot_of[b]).collect())
            .collect();
        let res_manifolds: Vec<Vec<Manifold>> = self
            .residuals
            .iter()
            .map(|info| {
                info.blocks(state)
                    .iter()
                    .map(|&b| manifold_of(self, b))
                    .collect()
            })
            .collect();
        let n_residuals: usize = self.residuals.iter().map(|r| r.residual_size()).sum();

        let mut x0 = DVector::zeros(n_params);
        for &(slot, manifold, offset) in &free_slots {
            manifold.pack(
                &ambient[slot],
                &mut x0.as_mut_slice()[offset..offset + manifold.tangent_size()],
            );
        }

        let problem = PgoProblem {
            residuals: &self.residuals,
            res_slots: &res_slots,
            res_manifolds: &res_manifolds,
            free_slots: &free_slots,
            ambient,
            n_residuals,
            x: x0,
        };
        let initial_cost = problem
            .residuals()
            .map(|r| 0.5 * r.norm_squared())
            .unwrap_or(0.0);

        if n_params == 0 || n_residuals == 0 {
            return SolveReport {
                initial_cost,
                final_cost: initial_cost,
                total_time: start.elapsed().as_secs_f64(),
                iterations: 0,
                converged: true,
            };
        }

        let engine = LevenbergMarquardt::new()
            .with_patience(self.config.max_iterations)
            .with_ftol(self.config.ftol)
            .with_xtol(self.config.xtol);
        let (solved, report) = engine.minimize(problem);

        let final_cost = solved
            .residuals()
            .map(|r| 0.5 * r.norm_squared())
            .unwrap_or(f64::NAN);

        // Write optimized blocks back into the arenas.
        for &(slot, manifold, offset) in &free_slots {
            let block = blocks[slot];
            let chart = &solved.x.as_slice()[offset..offset + manifold.tangent_size()];
            manifold.unpack(chart, state.block_values_mut(block));
        }

        let converged = report.termination.was_successful();
        if !converged {
            tracing::warn!(
                "solver did not converge: {:?} (cost {:.3e} -> {:.3e})",
                report.termination,
                initial_cost,
                final_cost
            );
        }

        SolveReport {
            initial_cost,
            final_cost,
            total_time: start.elapsed().as_secs_f64(),
            iterations: report.number_of_evaluations,
            converged,
        }
    }
}

/// Assembled least-squares problem over the free chart coordinates.
struct PgoProblem<'a> {
    residuals: &'a [ResidualInfo],
    res_slots: &'a [Vec<usize>],
    res_manifolds: &'a [Vec<Manifold>],
    free_slots: &'a [(usize, Manifold, usize)],
    /// Current ambient values per slot (constants never change).
    ambient: Vec<Vec<f64>>,
    n_residuals: usize,
    x: DVector<f64>,
}

impl<'a> LeastSquaresProblem<f64, Dyn, Dyn> for PgoProblem<'a> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.x.copy_from(x);
        for &(slot, manifold, offset) in self.free_slots {
            let chart = &x.as_slice()[offset..offset + manifold.tangent_size()];
            manifold.unpack(chart, &mut self.ambient[slot]);
        }
    }

    fn params(&self) -> DVector<f64> {
        self.x.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut out = DVector::zeros(self.n_residuals);
        let mut row = 0;
        for (info, slots) in self.residuals.iter().zip(self.res_slots) {
            let values: Vec<&[f64]> = slots.iter().map(|&s| self.ambient[s].as_slice()).collect();
            let r = info.residual_from(&values);
            out.rows_mut(row, r.len()).copy_from(&r);
            row += r.len();
        }
        Some(out)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let n_params: usize = self
            .free_slots
            .iter()
            .map(|(_, m, _)| m.tangent_size())
            .sum();
        let offset_of: HashMap<usize, (usize, usize)> = self
            .free_slots
            .iter()
            .map(|&(slot, manifold, offset)| (slot, (offset, manifold.tangent_size())))
            .collect();

        let mut jac = DMatrix::zeros(self.n_residuals, n_params);
        let mut row = 0;
        for ((info, slots), manifolds) in self
            .residuals
            .iter()
            .zip(self.res_slots)
            .zip(self.res_manifolds)
        {
            let values: Vec<&[f64]> = slots.iter().map(|&s| self.ambient[s].as_slice()).collect();
            let block_jacs = info.jacobians_from(&values, manifolds);
            let n_rows = info.residual_size();
            for (k, &slot) in slots.iter().enumerate() {
                if let Some(&(offset, width)) = offset_of.get(&slot) {
                    jac.view_mut((row, offset), (n_rows, width))
                        .copy_from(&block_jacs[k]);
                }
            }
            row += n_rows;
        }
        Some(jac)
    }
}
