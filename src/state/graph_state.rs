//! Mutable registry of frames, landmarks, extrinsics and time offsets.
//!
//! All raw parameter storage lives here, in typed arenas indexed by stable
//! `ParamBlockId` handles. Factors reference parameters by id and resolve to
//! raw storage only at evaluation time, so no raw pointers cross module
//! boundaries and blocks stay valid for the engine's lifetime.

use std::collections::HashMap;

use crate::geometry::{normalize_angle, SE3};

use super::frame::Frame;
use super::types::{CameraId, DroneId, FrameId, LandmarkId};

/// Degrees of freedom used for pose parameter blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseDof {
    /// (x, y, z, yaw) — roll/pitch taken from the ego attitude.
    Four,
    /// Full SE(3), stored as position + quaternion.
    Six,
}

impl PoseDof {
    /// Ambient size of a pose block (doubles stored).
    pub fn pose_block_size(self) -> usize {
        match self {
            PoseDof::Four => 4,
            PoseDof::Six => 7,
        }
    }

    /// Tangent-space size of a pose block.
    pub fn pose_tangent_size(self) -> usize {
        match self {
            PoseDof::Four => 4,
            PoseDof::Six => 6,
        }
    }
}

/// Semantic kind of a raw parameter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Pose,
    SpeedBias,
    Landmark,
    Extrinsic,
    TimeOffset,
}

/// Stable handle to a parameter block in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamBlockId(pub usize);

struct ParamBlock {
    kind: ParamKind,
    values: Vec<f64>,
}

/// Owner of all raw parameter storage and frame metadata.
pub struct GraphState {
    pose_dof: PoseDof,
    is_realtime: bool,
    blocks: Vec<ParamBlock>,
    frames: HashMap<FrameId, Frame>,
    drone_frames: HashMap<DroneId, Vec<FrameId>>,
    pose_index: HashMap<FrameId, ParamBlockId>,
    spd_bias_index: HashMap<FrameId, ParamBlockId>,
    landmark_index: HashMap<LandmarkId, (ParamBlockId, FrameId)>,
    extrinsic_index: HashMap<CameraId, ParamBlockId>,
    td_index: HashMap<CameraId, ParamBlockId>,
}

impl GraphState {
    pub fn new(pose_dof: PoseDof, is_realtime: bool) -> Self {
        Self {
            pose_dof,
            is_realtime,
            blocks: Vec::new(),
            frames: HashMap::new(),
            drone_frames: HashMap::new(),
            pose_index: HashMap::new(),
            spd_bias_index: HashMap::new(),
            landmark_index: HashMap::new(),
            extrinsic_index: HashMap::new(),
            td_index: HashMap::new(),
        }
    }

    pub fn pose_dof(&self) -> PoseDof {
        self.pose_dof
    }

    fn alloc_block(&mut self, kind: ParamKind, values: Vec<f64>) -> ParamBlockId {
        let id = ParamBlockId(self.blocks.len());
        self.blocks.push(ParamBlock { kind, values });
        id
    }

    /// Raw values of a block.
    pub fn block_values(&self, id: ParamBlockId) -> &[f64] {
        &self.blocks[id.0].values
    }

    /// Mutable raw values of a block (solver write-back path).
    pub fn block_values_mut(&mut self, id: ParamBlockId) -> &mut [f64] {
        &mut self.blocks[id.0].values
    }

    /// Semantic kind of a block.
    pub fn block_kind(&self, id: ParamBlockId) -> ParamKind {
        self.blocks[id.0].kind
    }

    /// Register a frame. Returns false and leaves the state untouched on a
    /// duplicate frame id.
    ///
    /// In real-time mode a new frame of an already-known agent is initialized
    /// by composing the last estimated pose with the ego-motion delta since
    /// the last frame, so stale odometry never overwrites a corrected
    /// estimate.
    pub fn add_frame(&mut self, mut frame: Frame) -> bool {
        if self.frames.contains_key(&frame.frame_id) {
            tracing::warn!("duplicate frame {} ignored", frame.frame_id);
            return false;
        }
        if self.is_realtime {
            if let Some(last_id) = self
                .drone_frames
                .get(&frame.drone_id)
                .and_then(|v| v.last())
            {
                let last = &self.frames[last_id];
                let ego_delta = SE3::delta(&last.initial_ego_pose, &frame.initial_ego_pose);
                frame.odom_pose = last.odom_pose.compose(&ego_delta);
            }
        }
        let block = self.pose_block_from(&frame.odom_pose);
        let id = self.alloc_block(ParamKind::Pose, block);
        self.pose_index.insert(frame.frame_id, id);
        self.drone_frames
            .entry(frame.drone_id)
            .or_default()
            .push(frame.frame_id);
        self.frames.insert(frame.frame_id, frame);
        true
    }

    /// Register a 9-dim speed/bias block [v, ba, bg] for a frame.
    pub fn add_speed_bias(&mut self, frame_id: FrameId, values: [f64; 9]) -> ParamBlockId {
        let id = self.alloc_block(ParamKind::SpeedBias, values.to_vec());
        self.spd_bias_index.insert(frame_id, id);
        id
    }

    /// Register an inverse-depth landmark anchored at `base_frame`.
    pub fn add_landmark(
        &mut self,
        landmark_id: LandmarkId,
        base_frame: FrameId,
        inv_depth: f64,
    ) -> ParamBlockId {
        let id = self.alloc_block(ParamKind::Landmark, vec![inv_depth]);
        self.landmark_index.insert(landmark_id, (id, base_frame));
        id
    }

    /// Register a camera extrinsic (body-to-camera transform).
    pub fn add_extrinsic(&mut self, camera_id: CameraId, pose: SE3) -> ParamBlockId {
        let values = vec![
            pose.translation.x,
            pose.translation.y,
            pose.translation.z,
            pose.rotation.i,
            pose.rotation.j,
            pose.rotation.k,
            pose.rotation.w,
        ];
        let id = self.alloc_block(ParamKind::Extrinsic, values);
        self.extrinsic_index.insert(camera_id, id);
        id
    }

    /// Register a scalar time-offset parameter for a camera.
    pub fn add_td(&mut self, camera_id: CameraId, td: f64) -> ParamBlockId {
        let id = self.alloc_block(ParamKind::TimeOffset, vec![td]);
        self.td_index.insert(camera_id, id);
        id
    }

    pub fn pose_state(&self, frame_id: FrameId) -> Option<ParamBlockId> {
        self.pose_index.get(&frame_id).copied()
    }

    pub fn spd_bias_state(&self, frame_id: FrameId) -> Option<ParamBlockId> {
        self.spd_bias_index.get(&frame_id).copied()
    }

    pub fn landmark_state(&self, landmark_id: LandmarkId) -> Option<ParamBlockId> {
        self.landmark_index.get(&landmark_id).map(|&(id, _)| id)
    }

    /// Frame a landmark's inverse depth is anchored in.
    pub fn landmark_base_frame(&self, landmark_id: LandmarkId) -> Option<FrameId> {
        self.landmark_index.get(&landmark_id).map(|&(_, f)| f)
    }

    pub fn extrinsic_state(&self, camera_id: CameraId) -> Option<ParamBlockId> {
        self.extrinsic_index.get(&camera_id).copied()
    }

    pub fn td_state(&self, camera_id: CameraId) -> Option<ParamBlockId> {
        self.td_index.get(&camera_id).copied()
    }

    pub fn has_frame(&self, frame_id: FrameId) -> bool {
        self.frames.contains_key(&frame_id)
    }

    pub fn frame(&self, frame_id: FrameId) -> Option<&Frame> {
        self.frames.get(&frame_id)
    }

    /// Frame ids of one agent, in insertion order.
    pub fn frames_of(&self, drone_id: DroneId) -> &[FrameId] {
        self.drone_frames
            .get(&drone_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Number of frames of one agent.
    pub fn size(&self, drone_id: DroneId) -> usize {
        self.frames_of(drone_id).len()
    }

    /// First (oldest) frame of one agent.
    pub fn head_id(&self, drone_id: DroneId) -> Option<FrameId> {
        self.frames_of(drone_id).first().copied()
    }

    /// All agents with at least one frame, in id order.
    pub fn available_drones(&self) -> Vec<DroneId> {
        let mut ids: Vec<DroneId> = self.drone_frames.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Pack a pose into the raw block layout for the configured DoF.
    fn pose_block_from(&self, pose: &SE3) -> Vec<f64> {
        match self.pose_dof {
            PoseDof::Four => vec![
                pose.translation.x,
                pose.translation.y,
                pose.translation.z,
                pose.yaw(),
            ],
            PoseDof::Six => vec![
                pose.translation.x,
                pose.translation.y,
                pose.translation.z,
                pose.rotation.i,
                pose.rotation.j,
                pose.rotation.k,
                pose.rotation.w,
            ],
        }
    }

    /// Read a pose block back into an SE3.
    pub fn read_pose(&self, id: ParamBlockId) -> SE3 {
        let v = self.block_values(id);
        match self.pose_dof {
            PoseDof::Four => SE3::from_xyz_yaw(v[0], v[1], v[2], normalize_angle(v[3])),
            PoseDof::Six => SE3::from_quaternion(
                v[6],
                v[3],
                v[4],
                v[5],
                nalgebra::Vector3::new(v[0], v[1], v[2]),
            ),
        }
    }

    /// Overwrite a frame's pose block (rotation initialization write-back).
    pub fn write_pose(&mut self, frame_id: FrameId, pose: &SE3) {
        let block = self.pose_block_from(pose);
        if let Some(id) = self.pose_state(frame_id) {
            self.block_values_mut(id).copy_from_slice(&block);
        }
    }

    /// Re-pack solver-mutated raw buffers into the typed frame poses.
    pub fn sync_from_state(&mut self) {
        let updates: Vec<(FrameId, SE3)> = self
            .pose_index
            .iter()
            .map(|(&frame_id, &block)| (frame_id, self.read_pose(block)))
            .collect();
        for (frame_id, pose) in updates {
            if let Some(frame) = self.frames.get_mut(&frame_id) {
                frame.odom_pose = pose;
            }
        }
    }
}
