//! Frame records and per-agent trajectories.

use std::collections::HashMap;

use crate::geometry::SE3;

use super::types::{DroneId, FrameId};

/// A pose-graph frame: one keyframe of one agent's trajectory.
///
/// `initial_ego_pose` is the odometry snapshot at capture time and never
/// changes; `odom_pose` is the current estimate and is rewritten by the
/// solver after every optimization.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Globally unique frame identifier.
    pub frame_id: FrameId,

    /// Agent that captured this frame.
    pub drone_id: DroneId,

    /// Agent whose coordinate frame `initial_ego_pose` is expressed in.
    pub reference_frame_id: DroneId,

    /// Capture timestamp in seconds.
    pub stamp: f64,

    /// Ego-motion pose at capture time (immutable odometry snapshot).
    pub initial_ego_pose: SE3,

    /// Current pose estimate, mutated by the solver.
    pub odom_pose: SE3,
}

impl Frame {
    /// Create a frame whose estimate starts at the ego pose.
    pub fn new(
        frame_id: FrameId,
        drone_id: DroneId,
        reference_frame_id: DroneId,
        stamp: f64,
        initial_ego_pose: SE3,
    ) -> Self {
        Self {
            frame_id,
            drone_id,
            reference_frame_id,
            stamp,
            initial_ego_pose,
            odom_pose: initial_ego_pose,
        }
    }
}

/// Time-ordered trajectory of one agent.
///
/// Used for ego-motion relative constraints, PCM odometry chains, and the
/// optimized-trajectory output.
#[derive(Debug, Clone)]
pub struct DroneTrajectory {
    drone_id: DroneId,
    stamps: Vec<f64>,
    poses: Vec<SE3>,
    frame_ids: Vec<FrameId>,
    index_of: HashMap<FrameId, usize>,
}

impl DroneTrajectory {
    pub fn new(drone_id: DroneId) -> Self {
        Self {
            drone_id,
            stamps: Vec::new(),
            poses: Vec::new(),
            frame_ids: Vec::new(),
            index_of: HashMap::new(),
        }
    }

    pub fn drone_id(&self) -> DroneId {
        self.drone_id
    }

    /// Append a pose sample. Samples are expected in time order.
    pub fn push(&mut self, stamp: f64, pose: SE3, frame_id: FrameId) {
        self.index_of.insert(frame_id, self.poses.len());
        self.stamps.push(stamp);
        self.poses.push(pose);
        self.frame_ids.push(frame_id);
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    /// Pose recorded for a frame, if present.
    pub fn pose_of(&self, frame_id: FrameId) -> Option<SE3> {
        self.index_of.get(&frame_id).map(|&i| self.poses[i])
    }

    /// Relative transform between two recorded frames: T_a^{-1} * T_b.
    pub fn relative_pose(&self, frame_a: FrameId, frame_b: FrameId) -> Option<SE3> {
        let a = self.pose_of(frame_a)?;
        let b = self.pose_of(frame_b)?;
        Some(SE3::delta(&a, &b))
    }

    /// Sample at index i as (stamp, pose, frame_id).
    pub fn get(&self, i: usize) -> (f64, SE3, FrameId) {
        (self.stamps[i], self.poses[i], self.frame_ids[i])
    }

    /// Iterate samples in time order.
    pub fn iter(&self) -> impl Iterator<Item = (f64, &SE3, FrameId)> + '_ {
        self.stamps
            .iter()
            .zip(self.poses.iter())
            .zip(self.frame_ids.iter())
            .map(|((&s, p), &f)| (s, p, f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    #[test]
    fn test_trajectory_relative_pose() {
        let mut traj = DroneTrajectory::new(DroneId::new(0));
        traj.push(0.0, SE3::from_xyz_yaw(0.0, 0.0, 0.0, 0.0), FrameId::new(1));
        traj.push(1.0, SE3::from_xyz_yaw(1.0, 0.0, 0.0, 0.5), FrameId::new(2));

        let rel = traj
            .relative_pose(FrameId::new(1), FrameId::new(2))
            .unwrap();
        assert_relative_eq!(rel.translation, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(rel.yaw(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_trajectory_missing_frame() {
        let traj = DroneTrajectory::new(DroneId::new(0));
        assert!(traj.pose_of(FrameId::new(9)).is_none());
    }
}
