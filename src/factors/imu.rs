//! Preintegrated IMU factor between consecutive frames.
//!
//! The preintegrated measurements (ΔR, Δv, Δp over the interval) arrive from
//! the local estimator as an opaque package; the factor only re-evaluates the
//! 15-dimensional residual following "On-Manifold Preintegration"
//! (Forster et al.):
//!
//! ```text
//! r = [ R_a^T · (p_b - p_a - v_a·Δt - 0.5·g·Δt²) - Δp ]   // position (3)
//!     [ Log(ΔR^T · R_a^T · R_b) ]                          // rotation (3)
//!     [ R_a^T · (v_b - v_a - g·Δt) - Δv ]                  // velocity (3)
//!     [ ba_b - ba_a ]                                      // accel bias walk (3)
//!     [ bg_b - bg_a ]                                      // gyro bias walk (3)
//! ```
//!
//! weighted by the 15×15 square-root information of the preintegration.

use nalgebra::{DVector, SMatrix, SVector, UnitQuaternion, Vector3};

use super::se3_from_block;

/// Gravity in the world frame (z-up).
pub const GRAVITY: Vector3<f64> = Vector3::new(0.0, 0.0, -9.81);

/// Opaque preintegrated IMU measurement over one frame interval.
#[derive(Debug, Clone)]
pub struct ImuPreintegration {
    /// Integration interval (seconds).
    pub dt: f64,
    /// Preintegrated position delta Δp (frame a body frame).
    pub delta_p: Vector3<f64>,
    /// Preintegrated rotation delta ΔR.
    pub delta_q: UnitQuaternion<f64>,
    /// Preintegrated velocity delta Δv.
    pub delta_v: Vector3<f64>,
    /// Square-root information of the stacked 15-dim residual.
    pub sqrt_info: SMatrix<f64, 15, 15>,
}

/// IMU residual over (pose_a, speed_bias_a, pose_b, speed_bias_b).
#[derive(Debug, Clone)]
pub struct ImuFactor {
    preint: ImuPreintegration,
}

impl ImuFactor {
    pub fn new(preint: ImuPreintegration) -> Self {
        Self { preint }
    }

    pub const RESIDUAL_SIZE: usize = 15;

    /// Residual from ambient blocks
    /// [pose_a (7), sb_a (9), pose_b (7), sb_b (9)].
    ///
    /// Speed-bias layout: [v (3), ba (3), bg (3)].
    pub fn residual(&self, params: &[&[f64]]) -> DVector<f64> {
        let pose_a = se3_from_block(params[0]);
        let pose_b = se3_from_block(params[2]);
        let sb_a = params[1];
        let sb_b = params[3];
        let v_a = Vector3::new(sb_a[0], sb_a[1], sb_a[2]);
        let v_b = Vector3::new(sb_b[0], sb_b[1], sb_b[2]);

        let dt = self.preint.dt;
        let r_a_inv = pose_a.rotation.inverse();

        let r_p = r_a_inv
            * (pose_b.translation - pose_a.translation - v_a * dt - 0.5 * GRAVITY * dt * dt)
            - self.preint.delta_p;
        let rot_err = self.preint.delta_q.inverse() * r_a_inv * pose_b.rotation;
        let r_theta = rot_err.scaled_axis();
        let r_v = r_a_inv * (v_b - v_a - GRAVITY * dt) - self.preint.delta_v;

        let mut r = SVector::<f64, 15>::zeros();
        r.fixed_rows_mut::<3>(0).copy_from(&r_p);
        r.fixed_rows_mut::<3>(3).copy_from(&r_theta);
        r.fixed_rows_mut::<3>(6).copy_from(&r_v);
        for i in 0..3 {
            r[9 + i] = sb_b[3 + i] - sb_a[3 + i];
            r[12 + i] = sb_b[6 + i] - sb_a[6 + i];
        }

        let weighted = self.preint.sqrt_info * r;
        DVector::from_column_slice(weighted.as_slice())
    }
}
