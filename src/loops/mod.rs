//! Loop-closure edges and their append-only store.

pub mod pcm;

use nalgebra::{Matrix4, Matrix6};

use crate::geometry::SE3;
use crate::state::{DroneId, FrameId};

/// A relative-pose measurement between two frames.
///
/// Immutable after creation; the store assigns the monotonic `id`.
#[derive(Debug, Clone)]
pub struct LoopEdge {
    /// Insertion id, assigned by the store.
    pub id: u64,
    pub keyframe_id_a: FrameId,
    pub keyframe_id_b: FrameId,
    pub drone_id_a: DroneId,
    pub drone_id_b: DroneId,
    /// Measured T_ab.
    pub relative_pose: SE3,
    /// 6×6 square-root information, position block first.
    pub sqrt_info: Matrix6<f64>,
    pub stamp: f64,
}

impl LoopEdge {
    pub fn new(
        keyframe_id_a: FrameId,
        keyframe_id_b: FrameId,
        drone_id_a: DroneId,
        drone_id_b: DroneId,
        relative_pose: SE3,
        sqrt_info: Matrix6<f64>,
        stamp: f64,
    ) -> Self {
        Self {
            id: 0,
            keyframe_id_a,
            keyframe_id_b,
            drone_id_a,
            drone_id_b,
            relative_pose,
            sqrt_info,
            stamp,
        }
    }

    /// The (x, y, z, yaw) block of the square-root information.
    pub fn sqrt_information_4d(&self) -> Matrix4<f64> {
        let idx = [0, 1, 2, 5];
        let mut out = Matrix4::zeros();
        for (i, &ri) in idx.iter().enumerate() {
            for (j, &rj) in idx.iter().enumerate() {
                out[(i, j)] = self.sqrt_info[(ri, rj)];
            }
        }
        out
    }

    /// 4-DoF covariance implied by the square-root information.
    pub fn covariance_4d(&self) -> Matrix4<f64> {
        let sqrt = self.sqrt_information_4d();
        (sqrt.transpose() * sqrt)
            .try_inverse()
            .unwrap_or_else(Matrix4::identity)
    }

    /// Whether the edge connects frames of two different agents.
    pub fn is_inter_drone(&self) -> bool {
        self.drone_id_a != self.drone_id_b
    }

    /// Same measurement viewed from the other endpoint.
    pub fn inverted(&self) -> LoopEdge {
        LoopEdge {
            id: self.id,
            keyframe_id_a: self.keyframe_id_b,
            keyframe_id_b: self.keyframe_id_a,
            drone_id_a: self.drone_id_b,
            drone_id_b: self.drone_id_a,
            relative_pose: self.relative_pose.inverse(),
            sqrt_info: self.sqrt_info,
            stamp: self.stamp,
        }
    }
}

/// Append-only store of loop edges with distance-based input rejection.
pub struct LoopStore {
    loops: Vec<LoopEdge>,
    distance_threshold: f64,
}

impl LoopStore {
    pub fn new(distance_threshold: f64) -> Self {
        Self {
            loops: Vec::new(),
            distance_threshold,
        }
    }

    /// Append an edge. Edges whose translation exceeds the distance
    /// threshold are rejected and leave the store unchanged.
    pub fn add(&mut self, mut edge: LoopEdge) -> bool {
        let dist = edge.relative_pose.translation.norm();
        if dist > self.distance_threshold {
            tracing::warn!(
                "loop {}<->{} distance {:.1}m over threshold, ignored",
                edge.keyframe_id_a,
                edge.keyframe_id_b,
                dist
            );
            return false;
        }
        edge.id = self.loops.len() as u64;
        self.loops.push(edge);
        true
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoopEdge> {
        self.loops.iter()
    }
}
