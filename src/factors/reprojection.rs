//! Landmark reprojection factors.
//!
//! An inverse-depth landmark anchored in frame a is projected into frame b
//! through the camera extrinsic; the residual is the normalized-plane
//! reprojection error. The time-offset variant additionally shifts both
//! observations along their image velocities by the current offset estimate.

use nalgebra::{DVector, Matrix2, Vector2, Vector3};

use super::se3_from_block;

/// Reprojection residual over (pose_a, pose_b, extrinsic, inv_depth).
#[derive(Debug, Clone)]
pub struct LandmarkFactor {
    /// Normalized homogeneous observation in camera a: [x, y, 1].
    pub pt_a: Vector3<f64>,
    /// Normalized homogeneous observation in camera b.
    pub pt_b: Vector3<f64>,
    /// 2×2 square-root information of the normalized-plane residual.
    pub sqrt_info: Matrix2<f64>,
}

impl LandmarkFactor {
    pub fn new(pt_a: Vector3<f64>, pt_b: Vector3<f64>, sqrt_info: Matrix2<f64>) -> Self {
        Self {
            pt_a,
            pt_b,
            sqrt_info,
        }
    }

    pub const RESIDUAL_SIZE: usize = 2;

    fn project(
        pt_a: &Vector3<f64>,
        pt_b: &Vector3<f64>,
        sqrt_info: &Matrix2<f64>,
        params: &[&[f64]],
    ) -> DVector<f64> {
        let pose_a = se3_from_block(params[0]);
        let pose_b = se3_from_block(params[1]);
        let extrinsic = se3_from_block(params[2]);
        let inv_dep = params[3][0];

        let p_cam_a = pt_a / inv_dep;
        let p_imu_a = extrinsic.transform_point(&p_cam_a);
        let p_world = pose_a.transform_point(&p_imu_a);
        let p_imu_b = pose_b.inverse().transform_point(&p_world);
        let p_cam_b = extrinsic.inverse().transform_point(&p_imu_b);

        let pred = Vector2::new(p_cam_b.x / p_cam_b.z, p_cam_b.y / p_cam_b.z);
        let err = pred - Vector2::new(pt_b.x, pt_b.y);
        let weighted = sqrt_info * err;
        DVector::from_column_slice(weighted.as_slice())
    }

    /// Residual from ambient blocks [pose_a (7), pose_b (7), ext (7), λ (1)].
    pub fn residual(&self, params: &[&[f64]]) -> DVector<f64> {
        Self::project(&self.pt_a, &self.pt_b, &self.sqrt_info, params)
    }
}

/// Reprojection residual with a scalar time-offset parameter appended.
#[derive(Debug, Clone)]
pub struct LandmarkFactorTd {
    pub pt_a: Vector3<f64>,
    pub pt_b: Vector3<f64>,
    /// Image-plane velocity of the observation in camera a.
    pub vel_a: Vector2<f64>,
    /// Image-plane velocity of the observation in camera b.
    pub vel_b: Vector2<f64>,
    pub sqrt_info: Matrix2<f64>,
}

impl LandmarkFactorTd {
    pub const RESIDUAL_SIZE: usize = 2;

    /// Residual from ambient blocks
    /// [pose_a (7), pose_b (7), ext (7), λ (1), td (1)].
    pub fn residual(&self, params: &[&[f64]]) -> DVector<f64> {
        let td = params[4][0];
        let pt_a = self.pt_a - td * Vector3::new(self.vel_a.x, self.vel_a.y, 0.0);
        let pt_b = self.pt_b - td * Vector3::new(self.vel_b.x, self.vel_b.y, 0.0);
        LandmarkFactor::project(&pt_a, &pt_b, &self.sqrt_info, &params[..4])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn pose_block(pose: &SE3) -> [f64; 7] {
        [
            pose.translation.x,
            pose.translation.y,
            pose.translation.z,
            pose.rotation.i,
            pose.rotation.j,
            pose.rotation.k,
            pose.rotation.w,
        ]
    }

    /// Build a consistent two-view observation of a world point.
    fn synthesize() -> (SE3, SE3, SE3, Vector3<f64>, Vector3<f64>, f64) {
        let pose_a = SE3::identity();
        let pose_b = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0),
            Vector3::new(0.5, 0.0, 0.0),
        );
        let extrinsic = SE3::new(
            UnitQuaternion::identity(),
            Vector3::new(0.05, 0.0, 0.0),
        );
        let p_world = Vector3::new(0.4, -0.2, 5.0);

        let to_cam = |pose: &SE3| {
            let p_imu = pose.inverse().transform_point(&p_world);
            extrinsic.inverse().transform_point(&p_imu)
        };
        let p_cam_a = to_cam(&pose_a);
        let p_cam_b = to_cam(&pose_b);
        let pt_a = p_cam_a / p_cam_a.z;
        let pt_b = p_cam_b / p_cam_b.z;
        (pose_a, pose_b, extrinsic, pt_a, pt_b, 1.0 / p_cam_a.z)
    }

    #[test]
    fn test_residual_zero_at_truth() {
        let (pose_a, pose_b, extrinsic, pt_a, pt_b, inv_dep) = synthesize();
        let factor = LandmarkFactor::new(pt_a, pt_b, Matrix2::identity());
        let blk_a = pose_block(&pose_a);
        let blk_b = pose_block(&pose_b);
        let blk_e = pose_block(&extrinsic);
        let lam = [inv_dep];
        let r = factor.residual(&[&blk_a, &blk_b, &blk_e, &lam]);
        assert_relative_eq!(r.norm(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_td_variant_reduces_to_plain_at_zero_offset() {
        let (pose_a, pose_b, extrinsic, pt_a, pt_b, inv_dep) = synthesize();
        let factor = LandmarkFactorTd {
            pt_a,
            pt_b,
            vel_a: Vector2::new(0.1, -0.05),
            vel_b: Vector2::new(0.08, 0.02),
            sqrt_info: Matrix2::identity(),
        };
        let blk_a = pose_block(&pose_a);
        let blk_b = pose_block(&pose_b);
        let blk_e = pose_block(&extrinsic);
        let lam = [inv_dep];
        let td = [0.0];
        let r = factor.residual(&[&blk_a, &blk_b, &blk_e, &lam, &td]);
        assert_relative_eq!(r.norm(), 0.0, epsilon = 1e-10);

        let td_off = [0.1];
        let r_off = factor.residual(&[&blk_a, &blk_b, &blk_e, &lam, &td_off]);
        assert!(r_off.norm() > 1e-4);
    }
}
