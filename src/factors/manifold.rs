//! On-manifold parameterizations for the solver.
//!
//! Pose blocks live in an ambient space (position + quaternion, or
//! position + yaw) while the solver iterates on minimal chart coordinates.
//! The manifold provides the retraction `x ⊞ δ`, plus the pack/unpack maps
//! between ambient blocks and the chart the solver and marginalizer share.

use nalgebra::{UnitQuaternion, Vector3};

use crate::geometry::normalize_angle;
use crate::geometry::so3::{exp_so3, log_so3};
use crate::state::{ParamKind, PoseDof};

/// Parameterization of one raw block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Manifold {
    /// SE(3): ambient [x, y, z, qx, qy, qz, qw], tangent [δp (3), δθ (3)].
    Se3,
    /// 4-DoF: ambient and tangent [x, y, z, yaw], yaw wrapped to (−π, π].
    PosYaw,
    /// Flat block of the given size (speed-bias, landmark, time offset).
    Euclidean(usize),
}

impl Manifold {
    /// Manifold used for a block of the given kind.
    pub fn for_kind(kind: ParamKind, dof: PoseDof, ambient_size: usize) -> Manifold {
        match kind {
            ParamKind::Pose => match dof {
                PoseDof::Four => Manifold::PosYaw,
                PoseDof::Six => Manifold::Se3,
            },
            // Extrinsics are full SE(3) regardless of the pose DoF.
            ParamKind::Extrinsic => Manifold::Se3,
            _ => Manifold::Euclidean(ambient_size),
        }
    }

    pub fn ambient_size(&self) -> usize {
        match self {
            Manifold::Se3 => 7,
            Manifold::PosYaw => 4,
            Manifold::Euclidean(n) => *n,
        }
    }

    pub fn tangent_size(&self) -> usize {
        match self {
            Manifold::Se3 => 6,
            Manifold::PosYaw => 4,
            Manifold::Euclidean(n) => *n,
        }
    }

    /// Retraction x ⊞ δ.
    ///
    /// Translation is additive; the quaternion is right-multiplied by
    /// `exp([δθ]×)`; yaw is additive modulo 2π.
    pub fn plus(&self, x: &[f64], delta: &[f64], out: &mut [f64]) {
        match self {
            Manifold::Se3 => {
                out[0] = x[0] + delta[0];
                out[1] = x[1] + delta[1];
                out[2] = x[2] + delta[2];
                let q = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
                    x[6], x[3], x[4], x[5],
                ));
                let dq = exp_so3(&Vector3::new(delta[3], delta[4], delta[5]));
                let q_new = q * dq;
                out[3] = q_new.i;
                out[4] = q_new.j;
                out[5] = q_new.k;
                out[6] = q_new.w;
            }
            Manifold::PosYaw => {
                out[0] = x[0] + delta[0];
                out[1] = x[1] + delta[1];
                out[2] = x[2] + delta[2];
                out[3] = normalize_angle(x[3] + delta[3]);
            }
            Manifold::Euclidean(n) => {
                for i in 0..*n {
                    out[i] = x[i] + delta[i];
                }
            }
        }
    }

    /// Project an ambient block to minimal chart coordinates.
    pub fn pack(&self, ambient: &[f64], out: &mut [f64]) {
        match self {
            Manifold::Se3 => {
                out[..3].copy_from_slice(&ambient[..3]);
                let q = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(
                    ambient[6], ambient[3], ambient[4], ambient[5],
                ));
                let phi = log_so3(&q);
                out[3] = phi.x;
                out[4] = phi.y;
                out[5] = phi.z;
            }
            Manifold::PosYaw | Manifold::Euclidean(_) => {
                out.copy_from_slice(&ambient[..out.len()]);
            }
        }
    }

    /// Lift minimal chart coordinates back to the ambient block.
    pub fn unpack(&self, minimal: &[f64], out: &mut [f64]) {
        match self {
            Manifold::Se3 => {
                out[..3].copy_from_slice(&minimal[..3]);
                let q = exp_so3(&Vector3::new(minimal[3], minimal[4], minimal[5]));
                out[3] = q.i;
                out[4] = q.j;
                out[5] = q.k;
                out[6] = q.w;
            }
            Manifold::PosYaw | Manifold::Euclidean(_) => {
                out[..minimal.len()].copy_from_slice(minimal);
            }
        }
    }
}
