//! Top-level orchestration for multi-agent pose-graph optimization.
//!
//! The engine owns the graph state, the loop store and the per-agent
//! ego-motion trajectories behind one mutex; `add_frame`, `add_loop`,
//! `solve` and the trajectory getters each take it exclusively, so the
//! solver never races concurrent mutation. A solve composes ego-motion
//! factors from consecutive frames and loop factors from the store (after
//! optional PCM filtering), optionally seeds rotations, installs manifolds
//! and the gauge anchor, and runs either the centralized adapter or the
//! distributed consensus solver.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use nalgebra::Matrix6;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::dpgo::{ArockConfig, ArockContext, ArockPgo, DpgoData};
use crate::factors::{Manifold, RelPoseFactor, RelPoseFactor4d, ResidualCost, ResidualInfo};
use crate::geometry::SE3;
use crate::loops::pcm::pairwise_consistent_loops;
use crate::loops::{LoopEdge, LoopStore};
use crate::solver::{SolverAdapter, SolverConfig};
use crate::state::{
    DroneId, DroneTrajectory, Frame, FrameId, GraphState, ParamBlockId, PoseDof,
};

use super::g2o::write_g2o;
use super::rotation_init::initialize_rotations;

/// Optimization topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgoMode {
    /// Single solver over every agent's frames.
    NonDistributed,
    /// ADMM/AROCK consensus with peer exchange.
    DistributedArock,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct PgoConfig {
    /// This agent.
    pub self_id: DroneId,
    /// Agent whose coordinate frame anchors the swarm.
    pub main_id: DroneId,
    pub mode: PgoMode,
    pub pose_dof: PoseDof,
    /// Propagate new frames from the last estimate instead of raw odometry.
    pub is_realtime: bool,
    /// Minimum local frame count before a non-forced solve runs.
    pub min_solve_size: usize,
    /// Loops with a longer translation are rejected on input.
    pub loop_distance_threshold: f64,
    pub enable_pcm: bool,
    /// Chi-square gate for PCM (4 DoF).
    pub pcm_threshold: f64,
    pub enable_ego_motion: bool,
    pub enable_rotation_initialization: bool,
    /// Floor on the path length used for ego-motion covariance.
    pub min_cov_len: f64,
    pub pos_covariance_per_meter: f64,
    pub yaw_covariance_per_meter: f64,
    pub solver: SolverConfig,
    pub arock: ArockConfig,
    pub write_g2o: bool,
    pub g2o_output_path: PathBuf,
    /// Write raw measurements instead of estimates to the g2o sink.
    pub g2o_use_raw_data: bool,
}

impl Default for PgoConfig {
    fn default() -> Self {
        Self {
            self_id: DroneId::new(0),
            main_id: DroneId::new(0),
            mode: PgoMode::NonDistributed,
            pose_dof: PoseDof::Four,
            is_realtime: false,
            min_solve_size: 2,
            loop_distance_threshold: 3.0,
            enable_pcm: false,
            pcm_threshold: 9.488,
            enable_ego_motion: true,
            enable_rotation_initialization: false,
            min_cov_len: 0.1,
            pos_covariance_per_meter: 4e-3,
            yaw_covariance_per_meter: 5e-5,
            solver: SolverConfig::default(),
            arock: ArockConfig::default(),
            write_g2o: false,
            g2o_output_path: PathBuf::from("pgo.g2o"),
            g2o_use_raw_data: false,
        }
    }
}

/// Square-root information of a synthesized ego-motion edge of path length
/// `len`: Σ_pos = σ_p·L·I + ½·σ_yaw·L²·I, Σ_rot = σ_yaw·L·I, inverted and
/// square-rooted elementwise.
pub fn ego_motion_sqrt_info(
    pos_covariance_per_meter: f64,
    yaw_covariance_per_meter: f64,
    len: f64,
) -> Matrix6<f64> {
    let pos_cov = pos_covariance_per_meter * len + 0.5 * yaw_covariance_per_meter * len * len;
    let rot_cov = yaw_covariance_per_meter * len;
    let mut sqrt_info = Matrix6::zeros();
    for i in 0..3 {
        sqrt_info[(i, i)] = 1.0 / pos_cov.sqrt();
        sqrt_info[(i + 3, i + 3)] = 1.0 / rot_cov.sqrt();
    }
    sqrt_info
}

type BroadcastCallback = Box<dyn Fn(DpgoData) + Send + Sync>;
type PostsolveCallback = Box<dyn Fn() + Send + Sync>;

/// Multi-agent pose-graph optimization engine.
pub struct PgoEngine {
    config: PgoConfig,
    inner: Mutex<EngineInner>,
    /// Peer messages land here without taking the engine lock, so receipt
    /// during a running solve cannot deadlock.
    dpgo_queue: Arc<Mutex<VecDeque<DpgoData>>>,
}

struct EngineInner {
    state: GraphState,
    loops: LoopStore,
    ego_motion_trajs: HashMap<DroneId, DroneTrajectory>,
    solver: Option<ArockPgo>,
    updated: bool,
    solve_count: usize,
    used_frames: HashSet<FrameId>,
    used_loops: Vec<LoopEdge>,
    broadcast_cb: Option<BroadcastCallback>,
    postsolve_cb: Option<PostsolveCallback>,
}

impl PgoEngine {
    pub fn new(config: PgoConfig) -> Self {
        let inner = EngineInner {
            state: GraphState::new(config.pose_dof, config.is_realtime),
            loops: LoopStore::new(config.loop_distance_threshold),
            ego_motion_trajs: HashMap::new(),
            solver: None,
            updated: false,
            solve_count: 0,
            used_frames: HashSet::new(),
            used_loops: Vec::new(),
            broadcast_cb: None,
            postsolve_cb: None,
        };
        Self {
            config,
            inner: Mutex::new(inner),
            dpgo_queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Install the callback that ships [`DpgoData`] to peers.
    pub fn set_broadcast_callback(&self, cb: BroadcastCallback) {
        self.inner.lock().broadcast_cb = Some(cb);
    }

    /// Install the callback invoked synchronously after each solve.
    pub fn set_postsolve_callback(&self, cb: PostsolveCallback) {
        self.inner.lock().postsolve_cb = Some(cb);
    }

    /// Register a frame.
    pub fn add_frame(&self, frame: Frame) -> bool {
        self.inner.lock().add_frame(&self.config, frame)
    }

    /// Register a loop edge. With `add_state_by_loop`, a missing endpoint is
    /// auto-instantiated from the known one (bootstrap/debug path).
    pub fn add_loop(&self, edge: LoopEdge, add_state_by_loop: bool) -> bool {
        self.inner.lock().add_loop(&self.config, edge, add_state_by_loop)
    }

    /// Feed a peer exchange message to the distributed solver.
    pub fn input_dpgo_data(&self, data: DpgoData) {
        if self.config.mode == PgoMode::DistributedArock {
            self.dpgo_queue.lock().push_back(data);
        }
    }

    /// Run an optimization pass. Returns false when there is nothing to do
    /// (insufficient frames or no new input) and `force` is unset.
    pub fn solve(&self, force: bool) -> bool {
        self.inner.lock().solve(&self.config, &self.dpgo_queue, force)
    }

    /// Optimized trajectory per agent. In 4-DoF mode roll/pitch are
    /// re-composed from the ego attitude.
    pub fn optimized_trajs(&self) -> HashMap<DroneId, DroneTrajectory> {
        self.inner.lock().optimized_trajs(&self.config)
    }

    /// All frames of the local agent, in insertion order.
    pub fn all_local_frames(&self) -> Vec<Frame> {
        let inner = self.inner.lock();
        inner
            .state
            .frames_of(self.config.self_id)
            .iter()
            .filter_map(|&f| inner.state.frame(f).cloned())
            .collect()
    }

    /// Number of stored loop edges.
    pub fn loop_count(&self) -> usize {
        self.inner.lock().loops.len()
    }

    /// Snapshot of one frame, if known.
    pub fn frame(&self, frame_id: FrameId) -> Option<Frame> {
        self.inner.lock().state.frame(frame_id).cloned()
    }
}

impl EngineInner {
    fn add_frame(&mut self, config: &PgoConfig, frame: Frame) -> bool {
        let frame_id = frame.frame_id;
        let drone_id = frame.drone_id;
        let stamp = frame.stamp;
        let ego_pose = frame.initial_ego_pose;
        if !self.state.add_frame(frame) {
            return false;
        }
        info!(
            "[pgo@{}] add frame {} drone {} stamp {:.3}",
            config.self_id, frame_id, drone_id, stamp
        );
        self.ego_motion_trajs
            .entry(drone_id)
            .or_insert_with(|| DroneTrajectory::new(drone_id))
            .push(stamp, ego_pose, frame_id);
        self.updated = true;
        true
    }

    fn add_loop(&mut self, config: &PgoConfig, edge: LoopEdge, add_state_by_loop: bool) -> bool {
        let accepted = self.loops.add(edge.clone());
        if !accepted {
            return false;
        }
        if add_state_by_loop {
            let has_a = self.state.has_frame(edge.keyframe_id_a);
            let has_b = self.state.has_frame(edge.keyframe_id_b);
            if has_a && !has_b {
                let known = self.state.frame(edge.keyframe_id_a).unwrap();
                let pose = known.odom_pose.compose(&edge.relative_pose);
                let reference = known.reference_frame_id;
                self.add_frame(
                    config,
                    Frame::new(edge.keyframe_id_b, edge.drone_id_b, reference, edge.stamp, pose),
                );
            } else if !has_a && has_b {
                let known = self.state.frame(edge.keyframe_id_b).unwrap();
                let pose = known.odom_pose.compose(&edge.relative_pose.inverse());
                let reference = known.reference_frame_id;
                self.add_frame(
                    config,
                    Frame::new(edge.keyframe_id_a, edge.drone_id_a, reference, edge.stamp, pose),
                );
            }
        }
        self.updated = true;
        true
    }

    fn solve(
        &mut self,
        config: &PgoConfig,
        queue: &Arc<Mutex<VecDeque<DpgoData>>>,
        force: bool,
    ) -> bool {
        if (self.state.size(config.self_id) < config.min_solve_size || !self.updated) && !force {
            return false;
        }

        // Loops with both endpoints known, then PCM if enabled.
        let available: Vec<LoopEdge> = self
            .loops
            .iter()
            .filter(|l| {
                self.state.has_frame(l.keyframe_id_a) && self.state.has_frame(l.keyframe_id_b)
            })
            .cloned()
            .collect();
        let good_loops = if config.enable_pcm {
            pairwise_consistent_loops(&available, &self.ego_motion_trajs, config.pcm_threshold)
        } else {
            available
        };

        self.used_frames.clear();
        self.used_loops.clear();

        let mut residuals: Vec<ResidualInfo> = Vec::new();
        for edge in &good_loops {
            residuals.push(loop_residual(config.pose_dof, edge));
            self.used_frames.insert(edge.keyframe_id_a);
            self.used_frames.insert(edge.keyframe_id_b);
            self.used_loops.push(edge.clone());
        }
        let used_loops_count = self.used_loops.len();

        if config.enable_ego_motion {
            let drones = match config.mode {
                PgoMode::NonDistributed => self.state.available_drones(),
                PgoMode::DistributedArock => vec![config.self_id],
            };
            for drone in drones {
                for edge in ego_motion_edges(&self.state, config, drone) {
                    residuals.push(loop_residual(config.pose_dof, &edge));
                    self.used_frames.insert(edge.keyframe_id_a);
                    self.used_frames.insert(edge.keyframe_id_b);
                    self.used_loops.push(edge);
                }
            }
        }

        if config.enable_rotation_initialization {
            if let Some(anchor) = self.state.head_id(config.self_id) {
                initialize_rotations(&mut self.state, &self.used_loops, anchor);
            }
        }

        let gauge_block = self.gauge_block(config);

        if config.write_g2o {
            let frames: Vec<&Frame> = self
                .used_frames
                .iter()
                .filter_map(|&f| self.state.frame(f))
                .collect();
            if let Err(err) = write_g2o(
                &config.g2o_output_path,
                &frames,
                &self.used_loops,
                config.g2o_use_raw_data,
            ) {
                warn!("g2o sink failed: {err:#}");
            }
        }

        let manifold = match config.pose_dof {
            PoseDof::Four => Manifold::PosYaw,
            PoseDof::Six => Manifold::Se3,
        };

        let report = match config.mode {
            PgoMode::NonDistributed => {
                let mut adapter = SolverAdapter::new(config.solver.clone());
                for info in residuals {
                    adapter.add_residual(info);
                }
                for &frame in &self.used_frames {
                    if let Some(block) = self.state.pose_state(frame) {
                        adapter.set_manifold(block, manifold);
                    }
                }
                if let Some(block) = gauge_block {
                    adapter.set_constant(block);
                }
                adapter.solve(&mut self.state)
            }
            PgoMode::DistributedArock => {
                let arock = self.solver.get_or_insert_with(|| {
                    ArockPgo::new(config.arock.clone(), Arc::clone(queue))
                });
                arock.reset_residuals();
                for info in residuals {
                    arock.add_residual(info);
                }
                let ctx = ArockContext {
                    self_id: config.self_id,
                    reference_frame_id: config.main_id,
                    gauge_block,
                    broadcast: self.broadcast_cb.as_deref(),
                };
                arock.solve(&mut self.state, &ctx)
            }
        };

        self.state.sync_from_state();
        if let Some(cb) = &self.postsolve_cb {
            cb();
        }
        info!(
            "[pgo@{}] solve {} mode {:?} frames {} loops {} time {:.1}ms cost {:.2e} -> {:.2e}",
            config.self_id,
            self.solve_count,
            config.mode,
            self.used_frames.len(),
            used_loops_count,
            report.total_time * 1e3,
            report.initial_cost,
            report.final_cost
        );
        self.solve_count += 1;
        self.updated = false;
        true
    }

    /// Which pose block to hold constant, per mode (gauge fixing).
    fn gauge_block(&self, config: &PgoConfig) -> Option<ParamBlockId> {
        let anchored_locally = config.mode == PgoMode::NonDistributed
            || config.self_id == config.main_id;
        if anchored_locally {
            return self
                .state
                .head_id(config.self_id)
                .and_then(|f| self.state.pose_state(f));
        }
        // Anchor the first local frame expressed in the main agent's frame.
        self.state
            .frames_of(config.self_id)
            .iter()
            .find(|&&f| {
                self.state
                    .frame(f)
                    .map(|fr| fr.reference_frame_id == config.main_id)
                    .unwrap_or(false)
            })
            .and_then(|&f| self.state.pose_state(f))
    }

    fn optimized_trajs(&self, config: &PgoConfig) -> HashMap<DroneId, DroneTrajectory> {
        let mut trajs = HashMap::new();
        for drone in self.state.available_drones() {
            let mut traj = DroneTrajectory::new(drone);
            for &frame_id in self.state.frames_of(drone) {
                if !self.used_frames.contains(&frame_id) {
                    continue;
                }
                let frame = match self.state.frame(frame_id) {
                    Some(f) => f,
                    None => continue,
                };
                let mut pose = frame.odom_pose;
                if config.pose_dof == PoseDof::Four {
                    // Re-compose roll/pitch from the ego attitude.
                    let ego = &frame.initial_ego_pose;
                    let delta_att = ego.att_yaw_only().inverse() * ego.rotation;
                    pose.rotation *= delta_att;
                }
                traj.push(frame.stamp, pose, frame_id);
            }
            trajs.insert(drone, traj);
        }
        trajs
    }
}

/// Relative-pose residual for one edge, at the configured DoF.
fn loop_residual(dof: PoseDof, edge: &LoopEdge) -> ResidualInfo {
    let cost = match dof {
        PoseDof::Four => ResidualCost::RelPose4d {
            factor: RelPoseFactor4d::new(&edge.relative_pose, edge.sqrt_information_4d()),
            frame_a: edge.keyframe_id_a,
            frame_b: edge.keyframe_id_b,
        },
        PoseDof::Six => ResidualCost::RelPose {
            factor: RelPoseFactor::new(edge.relative_pose, edge.sqrt_info),
            frame_a: edge.keyframe_id_a,
            frame_b: edge.keyframe_id_b,
        },
    };
    ResidualInfo::new(cost)
}

/// Ego-motion edges between consecutive frames of one agent, with a
/// covariance growing along the path length.
fn ego_motion_edges(state: &GraphState, config: &PgoConfig, drone: DroneId) -> Vec<LoopEdge> {
    let frames = state.frames_of(drone);
    let mut edges = Vec::new();
    for pair in frames.windows(2) {
        let fa = match state.frame(pair[0]) {
            Some(f) => f,
            None => continue,
        };
        let fb = match state.frame(pair[1]) {
            Some(f) => f,
            None => continue,
        };
        let rel = match config.pose_dof {
            PoseDof::Four => SE3::delta_4dof(&fa.initial_ego_pose, &fb.initial_ego_pose),
            PoseDof::Six => SE3::delta(&fa.initial_ego_pose, &fb.initial_ego_pose),
        };
        let len = rel.translation.norm().max(config.min_cov_len);
        let sqrt_info = ego_motion_sqrt_info(
            config.pos_covariance_per_meter,
            config.yaw_covariance_per_meter,
            len,
        );
        edges.push(LoopEdge::new(
            fa.frame_id,
            fb.frame_id,
            drone,
            drone,
            rel,
            sqrt_info,
            fb.stamp,
        ));
    }
    edges
}
