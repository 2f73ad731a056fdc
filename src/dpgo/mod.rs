//! Distributed pose-graph consensus (ADMM / AROCK style).
//!
//! Each agent repeatedly solves its local augmented-Lagrangian problem,
//! broadcasts its estimates of the shared pose blocks (frames touched by
//! inter-agent loops) as [`DpgoData`], and folds received peer estimates
//! into a consensus table `z` with dual variables `y`:
//!
//! ```text
//! x ← argmin  f_local(x) + Σ ρ/2 ‖x_s − z_s + y_s/ρ‖²
//! z ← average of local and neighbor estimates
//! y ← y + ρ (x − z)
//! ```
//!
//! Stale messages (iteration counter behind what was already heard from the
//! sender) and unknown frame ids are dropped. Convergence is declared on
//! primal and dual residual thresholds or on the iteration budget.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use nalgebra::DVector;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::factors::{Manifold, PosePriorFactor, ResidualCost, ResidualInfo};
use crate::geometry::normalize_angle;
use crate::solver::{SolveReport, SolverAdapter, SolverConfig};
use crate::state::{DroneId, FrameId, GraphState, ParamBlockId, ParamKind, PoseDof};

/// Peer exchange message: one agent's current estimates of the shared pose
/// blocks, in minimal chart coordinates, plus its dual values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpgoData {
    pub drone_id: DroneId,
    pub reference_frame_id: DroneId,
    pub iteration_count: u64,
    pub frame_poses: HashMap<FrameId, Vec<f64>>,
    pub frame_duals: HashMap<FrameId, Vec<f64>>,
}

/// ADMM options of the distributed solver.
#[derive(Debug, Clone)]
pub struct ArockConfig {
    /// Penalty parameter ρ of the augmented Lagrangian.
    pub rho: f64,
    /// Consensus iterations per `solve` call.
    pub max_steps: usize,
    /// Gate on max |x − z| (meters / radians in chart coordinates).
    pub primal_tol: f64,
    /// Gate on max ρ·|z − z_prev|.
    pub dual_tol: f64,
    /// Options of the inner nonlinear solves.
    pub solver: SolverConfig,
}

impl Default for ArockConfig {
    fn default() -> Self {
        Self {
            rho: 0.1,
            max_steps: 5,
            primal_tol: 1e-4,
            dual_tol: 1e-4,
            solver: SolverConfig::default(),
        }
    }
}

/// Per-solve context handed down by the engine.
pub struct ArockContext<'a> {
    pub self_id: DroneId,
    pub reference_frame_id: DroneId,
    /// Gauge anchor, when this agent owns one.
    pub gauge_block: Option<ParamBlockId>,
    pub broadcast: Option<&'a (dyn Fn(DpgoData) + Send + Sync)>,
}

/// Consensus solver state persisted across engine solves.
pub struct ArockPgo {
    config: ArockConfig,
    residuals: Vec<ResidualInfo>,
    queue: Arc<Mutex<VecDeque<DpgoData>>>,
    duals: HashMap<FrameId, DVector<f64>>,
    consensus: HashMap<FrameId, DVector<f64>>,
    remote_estimates: HashMap<(DroneId, FrameId), DVector<f64>>,
    last_heard: HashMap<DroneId, u64>,
    iteration_count: u64,
}

impl ArockPgo {
    pub fn new(config: ArockConfig, queue: Arc<Mutex<VecDeque<DpgoData>>>) -> Self {
        Self {
            config,
            residuals: Vec::new(),
            queue,
            duals: HashMap::new(),
            consensus: HashMap::new(),
            remote_estimates: HashMap::new(),
            last_heard: HashMap::new(),
            iteration_count: 0,
        }
    }

    /// Register a residual for the next solve. The solver owns it until
    /// `reset_residuals`.
    pub fn add_residual(&mut self, info: ResidualInfo) {
        self.residuals.push(info);
    }

    /// Drop accumulated residuals (called on solver reuse); dual and
    /// consensus tables survive so iterations warm-start.
    pub fn reset_residuals(&mut self) {
        self.residuals.clear();
    }

    /// Run the consensus iterations.
    pub fn solve(&mut self, state: &mut GraphState, ctx: &ArockContext<'_>) -> SolveReport {
        let start = Instant::now();
        let manifold = match state.pose_dof() {
            PoseDof::Four => Manifold::PosYaw,
            PoseDof::Six => Manifold::Se3,
        };
        let tangent = manifold.tangent_size();
        let rho = self.config.rho;

        let shared = self.shared_frames(state);

        let mut initial_cost = 0.0;
        let mut final_cost = 0.0;
        let mut iterations = 0;
        let mut converged = false;

        for step in 0..self.config.max_steps {
            self.iteration_count += 1;

            // (i) Local augmented-Lagrangian solve.
            let mut adapter = SolverAdapter::new(self.config.solver.clone());
            for info in &self.residuals {
                adapter.add_residual(info.clone());
            }
            for &frame in &shared {
                if let (Some(z), Some(y)) = (self.consensus.get(&frame), self.duals.get(&frame)) {
                    let target_chart = z - y / rho;
                    let mut ambient = vec![0.0; manifold.ambient_size()];
                    manifold.unpack(target_chart.as_slice(), &mut ambient);
                    adapter.add_residual(ResidualInfo::new(ResidualCost::PosePrior {
                        factor: PosePriorFactor::new(ambient, rho.sqrt(), manifold),
                        frame,
                    }));
                }
            }
            if let Some(block) = ctx.gauge_block {
                adapter.set_constant(block);
            }
            let report = adapter.solve(state);
            if step == 0 {
                initial_cost = report.initial_cost;
            }
            final_cost = report.final_cost;
            iterations += report.iterations;

            // (ii) Package and emit local estimates of the shared blocks.
            if let Some(broadcast) = ctx.broadcast {
                let mut data = DpgoData {
                    drone_id: ctx.self_id,
                    reference_frame_id: ctx.reference_frame_id,
                    iteration_count: self.iteration_count,
                    frame_poses: HashMap::new(),
                    frame_duals: HashMap::new(),
                };
                for &frame in &shared {
                    data.frame_poses
                        .insert(frame, self.chart_of(state, frame, &manifold));
                    if let Some(y) = self.duals.get(&frame) {
                        data.frame_duals.insert(frame, y.as_slice().to_vec());
                    }
                }
                broadcast(data);
            }

            // (iii) Fold in peer estimates; update consensus and duals.
            self.drain_queue(state, ctx.self_id);

            if shared.is_empty() {
                converged = report.converged;
                break;
            }

            let mut primal = 0.0_f64;
            let mut dual = f64::INFINITY;
            for &frame in &shared {
                let x = DVector::from_vec(self.chart_of(state, frame, &manifold));
                let mut delta_sum = DVector::zeros(tangent);
                let mut count = 1.0;
                for ((_, f), est) in &self.remote_estimates {
                    if *f == frame {
                        delta_sum += chart_diff(&manifold, est, &x);
                        count += 1.0;
                    }
                }
                let mut z_new = &x + delta_sum / count;
                if manifold == Manifold::PosYaw {
                    z_new[3] = normalize_angle(z_new[3]);
                }

                let y = self
                    .duals
                    .entry(frame)
                    .or_insert_with(|| DVector::zeros(tangent));
                let x_minus_z = chart_diff(&manifold, &x, &z_new);
                *y += rho * &x_minus_z;
                primal = primal.max(x_minus_z.amax());

                if let Some(z_old) = self.consensus.get(&frame) {
                    let d = rho * chart_diff(&manifold, &z_new, z_old).amax();
                    if dual.is_infinite() {
                        dual = d;
                    } else {
                        dual = dual.max(d);
                    }
                }
                self.consensus.insert(frame, z_new);
            }

            if step > 0 && primal < self.config.primal_tol && dual < self.config.dual_tol {
                converged = true;
                break;
            }
        }

        tracing::debug!(
            "arock solve: {} shared blocks, {} iterations, converged {}",
            shared.len(),
            iterations,
            converged
        );

        SolveReport {
            initial_cost,
            final_cost,
            total_time: start.elapsed().as_secs_f64(),
            iterations,
            converged,
        }
    }

    /// Frames coupled across agents by relative-pose residuals.
    fn shared_frames(&self, state: &GraphState) -> BTreeSet<FrameId> {
        let mut shared = BTreeSet::new();
        for info in &self.residuals {
            let frames = info.frames();
            if frames.len() != 2 {
                continue;
            }
            let drones: Vec<Option<DroneId>> = frames
                .iter()
                .map(|&f| state.frame(f).map(|fr| fr.drone_id))
                .collect();
            if let (Some(da), Some(db)) = (drones[0], drones[1]) {
                if da != db {
                    shared.insert(frames[0]);
                    shared.insert(frames[1]);
                }
            }
        }
        shared
    }

    fn chart_of(&self, state: &GraphState, frame: FrameId, manifold: &Manifold) -> Vec<f64> {
        let block = state
            .pose_state(frame)
            .expect("shared frame lost its pose block");
        debug_assert_eq!(state.block_kind(block), ParamKind::Pose);
        let mut chart = vec![0.0; manifold.tangent_size()];
        manifold.pack(state.block_values(block), &mut chart);
        chart
    }

    fn drain_queue(&mut self, state: &GraphState, self_id: DroneId) {
        let drained: Vec<DpgoData> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        for data in drained {
            if data.drone_id == self_id {
                continue;
            }
            let heard = self.last_heard.get(&data.drone_id).copied().unwrap_or(0);
            if data.iteration_count <= heard && heard != 0 {
                tracing::debug!(
                    "dropping stale dpgo data from {} (iter {} <= {})",
                    data.drone_id,
                    data.iteration_count,
                    heard
                );
                continue;
            }
            self.last_heard.insert(data.drone_id, data.iteration_count);
            for (frame, chart) in data.frame_poses {
                if !state.has_frame(frame) {
                    tracing::debug!("ignoring unknown shared frame {}", frame);
                    continue;
                }
                self.remote_estimates
                    .insert((data.drone_id, frame), DVector::from_vec(chart));
            }
        }
    }
}

/// Chart difference a − b with the yaw component wrapped.
fn chart_diff(manifold: &Manifold, a: &DVector<f64>, b: &DVector<f64>) -> DVector<f64> {
    let mut d = a - b;
    if *manifold == Manifold::PosYaw {
        d[3] = normalize_angle(d[3]);
    }
    d
}
