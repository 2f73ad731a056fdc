//! Relative-pose factors between two frames.
//!
//! Both loop closures and synthesized ego-motion constraints reduce to one
//! of these. The 6-DoF residual is the decoupled log of the error transform;
//! the 4-DoF residual works directly in (x, y, z, yaw) with the yaw row
//! wrapped to the minimal geodesic difference.

use nalgebra::{DVector, Matrix3, Matrix4, Vector3, Vector4};

use crate::geometry::{angle_diff, SE3};

use super::se3_from_block;

/// 6-DoF relative-pose residual: √Λ · log(T_meas⁻¹ · T_a⁻¹ · T_b).
#[derive(Debug, Clone)]
pub struct RelPoseFactor {
    measurement: SE3,
    sqrt_info: nalgebra::Matrix6<f64>,
}

impl RelPoseFactor {
    pub fn new(measurement: SE3, sqrt_info: nalgebra::Matrix6<f64>) -> Self {
        Self {
            measurement,
            sqrt_info,
        }
    }

    pub const RESIDUAL_SIZE: usize = 6;

    /// Residual from ambient blocks [pose_a (7), pose_b (7)].
    pub fn residual(&self, params: &[&[f64]]) -> DVector<f64> {
        let pose_a = se3_from_block(params[0]);
        let pose_b = se3_from_block(params[1]);
        let est = SE3::delta(&pose_a, &pose_b);
        let err = self.measurement.inverse().compose(&est);
        let weighted = self.sqrt_info * err.log();
        DVector::from_column_slice(weighted.as_slice())
    }
}

/// 4-DoF relative-pose residual: √Λ₄ · [R_yaw(a)ᵀ(p_b − p_a) − p_meas; Δyaw].
#[derive(Debug, Clone)]
pub struct RelPoseFactor4d {
    dp: Vector3<f64>,
    dyaw: f64,
    sqrt_info: Matrix4<f64>,
}

impl RelPoseFactor4d {
    /// Build from a measured relative pose; only its translation and yaw are
    /// used.
    pub fn new(measurement: &SE3, sqrt_info: Matrix4<f64>) -> Self {
        Self {
            dp: measurement.translation,
            dyaw: measurement.yaw(),
            sqrt_info,
        }
    }

    pub const RESIDUAL_SIZE: usize = 4;

    /// Residual from ambient blocks [pose_a (4), pose_b (4)].
    pub fn residual(&self, params: &[&[f64]]) -> DVector<f64> {
        let a = params[0];
        let b = params[1];
        let (c, s) = (a[3].cos(), a[3].sin());
        // R(-yaw_a) * (p_b - p_a)
        let dx = b[0] - a[0];
        let dy = b[1] - a[1];
        let dz = b[2] - a[2];
        let e = Vector4::new(
            c * dx + s * dy - self.dp.x,
            -s * dx + c * dy - self.dp.y,
            dz - self.dp.z,
            angle_diff(b[3] - a[3], self.dyaw),
        );
        let weighted = self.sqrt_info * e;
        DVector::from_column_slice(weighted.as_slice())
    }

    /// Analytic Jacobians with respect to the two (x, y, z, yaw) blocks.
    pub fn jacobians(&self, params: &[&[f64]]) -> [Matrix4<f64>; 2] {
        let a = params[0];
        let b = params[1];
        let (c, s) = (a[3].cos(), a[3].sin());
        let dx = b[0] - a[0];
        let dy = b[1] - a[1];

        let r_neg_yaw = Matrix3::new(
            c, s, 0.0,
            -s, c, 0.0,
            0.0, 0.0, 1.0,
        );

        let mut j_a = Matrix4::zeros();
        j_a.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-r_neg_yaw));
        // d/dyaw_a of R(-yaw_a) * (p_b - p_a)
        j_a[(0, 3)] = -s * dx + c * dy;
        j_a[(1, 3)] = -c * dx - s * dy;
        j_a[(3, 3)] = -1.0;

        let mut j_b = Matrix4::zeros();
        j_b.fixed_view_mut::<3, 3>(0, 0).copy_from(&r_neg_yaw);
        j_b[(3, 3)] = 1.0;

        [self.sqrt_info * j_a, self.sqrt_info * j_b]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::{numeric_jacobians, Manifold};
    use approx::assert_relative_eq;
    use nalgebra::{Matrix6, UnitQuaternion};

    #[test]
    fn test_rel_pose_zero_at_truth() {
        let pose_a = SE3::from_xyz_yaw(1.0, 2.0, 0.0, 0.4);
        let rel = SE3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
            Vector3::new(0.5, 0.0, -0.1),
        );
        let pose_b = pose_a.compose(&rel);
        let factor = RelPoseFactor::new(rel, Matrix6::identity());

        let blk_a = [
            pose_a.translation.x,
            pose_a.translation.y,
            pose_a.translation.z,
            pose_a.rotation.i,
            pose_a.rotation.j,
            pose_a.rotation.k,
            pose_a.rotation.w,
        ];
        let blk_b = [
            pose_b.translation.x,
            pose_b.translation.y,
            pose_b.translation.z,
            pose_b.rotation.i,
            pose_b.rotation.j,
            pose_b.rotation.k,
            pose_b.rotation.w,
        ];
        let r = factor.residual(&[&blk_a, &blk_b]);
        assert_relative_eq!(r.norm(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_rel_pose_4d_zero_at_truth() {
        let meas = SE3::from_xyz_yaw(1.0, 0.5, -0.2, 0.7);
        let factor = RelPoseFactor4d::new(&meas, Matrix4::identity());
        let a = [2.0, 1.0, 0.0, 0.3];
        let pose_a = SE3::from_xyz_yaw(a[0], a[1], a[2], a[3]);
        let pose_b = pose_a.compose(&meas);
        let b = [
            pose_b.translation.x,
            pose_b.translation.y,
            pose_b.translation.z,
            pose_b.yaw(),
        ];
        let r = factor.residual(&[&a, &b]);
        assert_relative_eq!(r.norm(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_rel_pose_4d_analytic_matches_numeric() {
        let meas = SE3::from_xyz_yaw(0.3, -0.4, 0.1, 0.2);
        let mut sqrt_info = Matrix4::identity();
        sqrt_info[(0, 0)] = 2.0;
        sqrt_info[(3, 3)] = 5.0;
        let factor = RelPoseFactor4d::new(&meas, sqrt_info);

        let a = [0.5, 0.2, 0.1, 0.9];
        let b = [1.1, -0.3, 0.2, 1.4];
        let analytic = factor.jacobians(&[&a, &b]);
        let numeric = numeric_jacobians(
            |p| factor.residual(p),
            &[&a, &b],
            &[Manifold::PosYaw, Manifold::PosYaw],
        );
        for k in 0..2 {
            for i in 0..4 {
                for j in 0..4 {
                    assert_relative_eq!(
                        analytic[k][(i, j)],
                        numeric[k][(i, j)],
                        epsilon = 1e-6
                    );
                }
            }
        }
    }

    #[test]
    fn test_rel_pose_4d_yaw_wrap() {
        // Measurement +179 deg, frame a at +179 deg: the wrapped residual at
        // the true composition (358 deg == -2 deg) must be zero.
        let meas = SE3::from_xyz_yaw(0.0, 0.0, 0.0, 179.0_f64.to_radians());
        let factor = RelPoseFactor4d::new(&meas, Matrix4::identity());
        let a = [0.0, 0.0, 0.0, 179.0_f64.to_radians()];
        let b = [0.0, 0.0, 0.0, (-2.0_f64).to_radians()];
        let r = factor.residual(&[&a, &b]);
        assert_relative_eq!(r.norm(), 0.0, epsilon = 1e-10);
    }
}
