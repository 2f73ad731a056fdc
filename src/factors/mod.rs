//! Residual factors for pose-graph optimization and marginalization.
//!
//! Each factor evaluates a square-root-information-weighted residual from
//! raw ambient parameter blocks. Jacobians are taken with respect to the
//! minimal chart coordinates the solver iterates on: analytically for the
//! 4-DoF relative-pose factor, by central differences everywhere else.
//! Residual records may carry an optional robust loss, applied to both the
//! residual and its Jacobians through the Triggs rescaling.

pub mod imu;
pub mod loss;
pub mod manifold;
pub mod prior;
pub mod rel_pose;
pub mod reprojection;
pub mod residual_info;

pub use imu::{ImuFactor, ImuPreintegration};
pub use loss::LossFunction;
pub use manifold::Manifold;
pub use prior::{PosePriorFactor, PriorFactor, PriorParam};
pub use rel_pose::{RelPoseFactor, RelPoseFactor4d};
pub use reprojection::{LandmarkFactor, LandmarkFactorTd};
pub use residual_info::{ParamInfo, ResidualCost, ResidualInfo};

use nalgebra::{DMatrix, DVector, Vector3};

use crate::geometry::{angle_diff, SE3};
use crate::geometry::so3::log_so3;

/// Read an SE(3) pose from a 7-double block [x, y, z, qx, qy, qz, qw].
pub(crate) fn se3_from_block(v: &[f64]) -> SE3 {
    SE3::from_quaternion(v[6], v[3], v[4], v[5], Vector3::new(v[0], v[1], v[2]))
}

/// Tangent-space deviation x ⊟ x0 for one block.
pub(crate) fn box_minus(manifold: &Manifold, x: &[f64], x0: &[f64], out: &mut [f64]) {
    match manifold {
        Manifold::Se3 => {
            out[0] = x[0] - x0[0];
            out[1] = x[1] - x0[1];
            out[2] = x[2] - x0[2];
            let q = se3_from_block(x).rotation;
            let q0 = se3_from_block(x0).rotation;
            let phi = log_so3(&(q0.inverse() * q));
            out[3] = phi.x;
            out[4] = phi.y;
            out[5] = phi.z;
        }
        Manifold::PosYaw => {
            out[0] = x[0] - x0[0];
            out[1] = x[1] - x0[1];
            out[2] = x[2] - x0[2];
            out[3] = angle_diff(x[3], x0[3]);
        }
        Manifold::Euclidean(n) => {
            for i in 0..*n {
                out[i] = x[i] - x0[i];
            }
        }
    }
}

/// Central-difference Jacobians of a residual with respect to the chart
/// coordinates of each parameter block.
pub(crate) fn numeric_jacobians<F>(
    residual_fn: F,
    params: &[&[f64]],
    manifolds: &[Manifold],
) -> Vec<DMatrix<f64>>
where
    F: Fn(&[&[f64]]) -> DVector<f64>,
{
    const STEP: f64 = 1e-6;

    let mut owned: Vec<Vec<f64>> = params.iter().map(|p| p.to_vec()).collect();
    let eval = |owned: &[Vec<f64>]| -> DVector<f64> {
        let views: Vec<&[f64]> = owned.iter().map(|o| o.as_slice()).collect();
        residual_fn(&views)
    };
    let residual_size = eval(&owned).len();

    let mut jacobians = Vec::with_capacity(params.len());
    for (k, manifold) in manifolds.iter().enumerate() {
        let tangent = manifold.tangent_size();
        let mut jac = DMatrix::zeros(residual_size, tangent);
        let mut chart = vec![0.0; tangent];
        manifold.pack(params[k], &mut chart);
        for j in 0..tangent {
            let orig = chart[j];

            chart[j] = orig + STEP;
            manifold.unpack(&chart, &mut owned[k]);
            let r_plus = eval(&owned);

            chart[j] = orig - STEP;
            manifold.unpack(&chart, &mut owned[k]);
            let r_minus = eval(&owned);

            chart[j] = orig;
            jac.set_column(j, &((r_plus - r_minus) / (2.0 * STEP)));
        }
        owned[k].copy_from_slice(params[k]);
        jacobians.push(jac);
    }
    jacobians
}
