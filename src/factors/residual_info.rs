//! Residual bookkeeping records for the solver and the marginalizer.
//!
//! A `ResidualInfo` couples one cost variant — a tagged enum naming the
//! fixed parameter tuple of the residual — with an optional robust loss.
//! Frame/landmark/camera ids resolve to arena blocks at evaluation time and
//! residual/Jacobian computation dispatches on the tag; when a loss is set,
//! both are rescaled with the Triggs correction. A missing parameter block
//! for a registered residual is a structural fault and aborts with a
//! diagnostic.

use std::collections::HashSet;

use nalgebra::{DMatrix, DVector};

use crate::state::{CameraId, FrameId, GraphState, LandmarkId, ParamBlockId, ParamKind};

use super::loss::triggs_correction;
use super::{
    numeric_jacobians, ImuFactor, LandmarkFactor, LandmarkFactorTd, LossFunction, Manifold,
    PosePriorFactor, PriorFactor, RelPoseFactor, RelPoseFactor4d,
};

/// Description of one raw parameter block inside a residual.
#[derive(Debug, Clone)]
pub struct ParamInfo {
    pub block: ParamBlockId,
    pub kind: ParamKind,
    pub manifold: Manifold,
    /// Owning frame for pose/speed-bias blocks, base frame for landmarks.
    pub frame: Option<FrameId>,
    /// Ambient size (doubles stored).
    pub size: usize,
    /// Tangent-space size.
    pub eff_size: usize,
    /// Set by the marginalizer for blocks to be eliminated.
    pub is_remove: bool,
    /// Tangent-space column assigned after sorting.
    pub index: usize,
}

/// Cost function of one residual block and the parameter tuple it depends
/// on.
#[derive(Clone)]
pub enum ResidualCost {
    /// Relative pose between two frames (6-DoF blocks).
    RelPose {
        factor: RelPoseFactor,
        frame_a: FrameId,
        frame_b: FrameId,
    },
    /// Relative pose between two frames (4-DoF blocks).
    RelPose4d {
        factor: RelPoseFactor4d,
        frame_a: FrameId,
        frame_b: FrameId,
    },
    /// Preintegrated IMU between consecutive frames.
    Imu {
        factor: ImuFactor,
        frame_a: FrameId,
        frame_b: FrameId,
    },
    /// Landmark reprojection through a camera extrinsic.
    Landmark {
        factor: LandmarkFactor,
        frame_a: FrameId,
        frame_b: FrameId,
        camera: CameraId,
        landmark: LandmarkId,
    },
    /// Landmark reprojection with a time-offset parameter.
    LandmarkTd {
        factor: LandmarkFactorTd,
        frame_a: FrameId,
        frame_b: FrameId,
        camera: CameraId,
        landmark: LandmarkId,
    },
    /// Marginalization prior over its kept parameters.
    Prior { factor: PriorFactor },
    /// Consensus pull on a single shared pose (distributed mode).
    PosePrior {
        factor: PosePriorFactor,
        frame: FrameId,
    },
}

impl ResidualCost {
    pub fn residual_size(&self) -> usize {
        match self {
            ResidualCost::RelPose { .. } => RelPoseFactor::RESIDUAL_SIZE,
            ResidualCost::RelPose4d { .. } => RelPoseFactor4d::RESIDUAL_SIZE,
            ResidualCost::Imu { .. } => ImuFactor::RESIDUAL_SIZE,
            ResidualCost::Landmark { .. } => LandmarkFactor::RESIDUAL_SIZE,
            ResidualCost::LandmarkTd { .. } => LandmarkFactorTd::RESIDUAL_SIZE,
            ResidualCost::Prior { factor } => factor.residual_size(),
            ResidualCost::PosePrior { factor, .. } => factor.residual_size(),
        }
    }

    fn pose_block(state: &GraphState, frame: FrameId) -> ParamBlockId {
        state
            .pose_state(frame)
            .unwrap_or_else(|| panic!("missing pose block for registered residual on {}", frame))
    }

    /// Arena blocks this residual depends on, in evaluation order.
    pub fn blocks(&self, state: &GraphState) -> Vec<ParamBlockId> {
        match self {
            ResidualCost::RelPose {
                frame_a, frame_b, ..
            }
            | ResidualCost::RelPose4d {
                frame_a, frame_b, ..
            } => vec![
                Self::pose_block(state, *frame_a),
                Self::pose_block(state, *frame_b),
            ],
            ResidualCost::Imu {
                frame_a, frame_b, ..
            } => vec![
                Self::pose_block(state, *frame_a),
                state
                    .spd_bias_state(*frame_a)
                    .unwrap_or_else(|| panic!("missing speed-bias block for {}", frame_a)),
                Self::pose_block(state, *frame_b),
                state
                    .spd_bias_state(*frame_b)
                    .unwrap_or_else(|| panic!("missing speed-bias block for {}", frame_b)),
            ],
            ResidualCost::Landmark {
                frame_a,
                frame_b,
                camera,
                landmark,
                ..
            } => vec![
                Self::pose_block(state, *frame_a),
                Self::pose_block(state, *frame_b),
                state
                    .extrinsic_state(*camera)
                    .expect("missing extrinsic block for registered residual"),
                state
                    .landmark_state(*landmark)
                    .expect("missing landmark block for registered residual"),
            ],
            ResidualCost::LandmarkTd {
                frame_a,
                frame_b,
                camera,
                landmark,
                ..
            } => vec![
                Self::pose_block(state, *frame_a),
                Self::pose_block(state, *frame_b),
                state
                    .extrinsic_state(*camera)
                    .expect("missing extrinsic block for registered residual"),
                state
                    .landmark_state(*landmark)
                    .expect("missing landmark block for registered residual"),
                state
                    .td_state(*camera)
                    .expect("missing time-offset block for registered residual"),
            ],
            ResidualCost::Prior { factor } => factor.params().iter().map(|p| p.block).collect(),
            ResidualCost::PosePrior { frame, .. } => vec![Self::pose_block(state, *frame)],
        }
    }

    /// Parameter descriptions for the marginalizer (flags unset).
    pub fn params_list(&self, state: &GraphState) -> Vec<ParamInfo> {
        let dof = state.pose_dof();
        let frame_of = |i: usize| -> Option<FrameId> {
            match self {
                ResidualCost::RelPose {
                    frame_a, frame_b, ..
                }
                | ResidualCost::RelPose4d {
                    frame_a, frame_b, ..
                } => [Some(*frame_a), Some(*frame_b)].get(i).copied().flatten(),
                ResidualCost::Imu {
                    frame_a, frame_b, ..
                } => [Some(*frame_a), Some(*frame_a), Some(*frame_b), Some(*frame_b)]
                    .get(i)
                    .copied()
                    .flatten(),
                ResidualCost::Landmark {
                    frame_a,
                    frame_b,
                    landmark,
                    ..
                }
                | ResidualCost::LandmarkTd {
                    frame_a,
                    frame_b,
                    landmark,
                    ..
                } => match i {
                    0 => Some(*frame_a),
                    1 => Some(*frame_b),
                    3 => state.landmark_base_frame(*landmark),
                    _ => None,
                },
                ResidualCost::Prior { factor } => factor.params()[i].frame,
                ResidualCost::PosePrior { frame, .. } => Some(*frame),
            }
        };

        self.blocks(state)
            .into_iter()
            .enumerate()
            .map(|(i, block)| {
                let kind = state.block_kind(block);
                let size = state.block_values(block).len();
                let manifold = Manifold::for_kind(kind, dof, size);
                ParamInfo {
                    block,
                    kind,
                    manifold,
                    frame: frame_of(i),
                    size,
                    eff_size: manifold.tangent_size(),
                    is_remove: false,
                    index: 0,
                }
            })
            .collect()
    }

    /// Frames this residual touches (bookkeeping and shared-block discovery).
    pub fn frames(&self) -> Vec<FrameId> {
        match self {
            ResidualCost::RelPose {
                frame_a, frame_b, ..
            }
            | ResidualCost::RelPose4d {
                frame_a, frame_b, ..
            }
            | ResidualCost::Imu {
                frame_a, frame_b, ..
            }
            | ResidualCost::Landmark {
                frame_a, frame_b, ..
            }
            | ResidualCost::LandmarkTd {
                frame_a, frame_b, ..
            } => vec![*frame_a, *frame_b],
            ResidualCost::Prior { factor } => {
                factor.params().iter().filter_map(|p| p.frame).collect()
            }
            ResidualCost::PosePrior { frame, .. } => vec![*frame],
        }
    }

    /// Raw (un-robustified) residual from resolved ambient blocks.
    pub fn residual(&self, params: &[&[f64]]) -> DVector<f64> {
        match self {
            ResidualCost::RelPose { factor, .. } => factor.residual(params),
            ResidualCost::RelPose4d { factor, .. } => factor.residual(params),
            ResidualCost::Imu { factor, .. } => factor.residual(params),
            ResidualCost::Landmark { factor, .. } => factor.residual(params),
            ResidualCost::LandmarkTd { factor, .. } => factor.residual(params),
            ResidualCost::Prior { factor } => factor.residual(params),
            ResidualCost::PosePrior { factor, .. } => factor.residual(params),
        }
    }

    /// Raw tangent-space Jacobians from resolved ambient blocks.
    pub fn jacobians(&self, params: &[&[f64]], manifolds: &[Manifold]) -> Vec<DMatrix<f64>> {
        match self {
            ResidualCost::RelPose4d { factor, .. } => factor
                .jacobians(params)
                .iter()
                .map(|j| DMatrix::from_column_slice(4, 4, j.as_slice()))
                .collect(),
            _ => numeric_jacobians(|p| self.residual(p), params, manifolds),
        }
    }
}

/// One residual block: the cost function, an optional robust loss, and the
/// parameter tuple the cost resolves against the graph state.
#[derive(Clone)]
pub struct ResidualInfo {
    pub cost: ResidualCost,
    /// Robust kernel; None evaluates the plain least-squares residual.
    pub loss: Option<LossFunction>,
}

impl ResidualInfo {
    pub fn new(cost: ResidualCost) -> Self {
        Self { cost, loss: None }
    }

    pub fn with_loss(cost: ResidualCost, loss: LossFunction) -> Self {
        Self {
            cost,
            loss: Some(loss),
        }
    }

    pub fn residual_size(&self) -> usize {
        self.cost.residual_size()
    }

    /// Arena blocks this residual depends on, in evaluation order.
    pub fn blocks(&self, state: &GraphState) -> Vec<ParamBlockId> {
        self.cost.blocks(state)
    }

    /// Parameter descriptions for the marginalizer (flags unset).
    pub fn params_list(&self, state: &GraphState) -> Vec<ParamInfo> {
        self.cost.params_list(state)
    }

    /// Frames this residual touches.
    pub fn frames(&self) -> Vec<FrameId> {
        self.cost.frames()
    }

    /// Whether this residual touches at least one of the given frames.
    pub fn relevant(&self, remove_frame_ids: &HashSet<FrameId>) -> bool {
        self.frames().iter().any(|f| remove_frame_ids.contains(f))
    }

    /// Robustified residual from resolved ambient blocks.
    pub fn residual_from(&self, params: &[&[f64]]) -> DVector<f64> {
        let mut residual = self.cost.residual(params);
        if let Some(loss) = &self.loss {
            let (_, residual_scaling, _) = triggs_correction(loss, residual.norm_squared());
            residual *= residual_scaling;
        }
        residual
    }

    /// Robustified tangent-space Jacobians from resolved ambient blocks.
    ///
    /// Jacobians are taken on the raw cost, then rescaled with the Triggs
    /// correction around the raw residual.
    pub fn jacobians_from(&self, params: &[&[f64]], manifolds: &[Manifold]) -> Vec<DMatrix<f64>> {
        let mut jacobians = self.cost.jacobians(params, manifolds);
        if self.loss.is_some() {
            let raw = self.cost.residual(params);
            self.correct_jacobians(&raw, &mut jacobians);
        }
        jacobians
    }

    /// Evaluate residual and Jacobians at the current state, loss applied.
    pub fn evaluate(&self, state: &GraphState) -> (DVector<f64>, Vec<DMatrix<f64>>) {
        let blocks = self.cost.blocks(state);
        let values: Vec<&[f64]> = blocks.iter().map(|&b| state.block_values(b)).collect();
        let mut residual = self.cost.residual(&values);
        let manifolds: Vec<Manifold> = self
            .cost
            .params_list(state)
            .iter()
            .map(|p| p.manifold)
            .collect();
        let mut jacobians = self.cost.jacobians(&values, &manifolds);
        if let Some(loss) = &self.loss {
            self.correct_jacobians(&residual, &mut jacobians);
            let (_, residual_scaling, _) = triggs_correction(loss, residual.norm_squared());
            residual *= residual_scaling;
        }
        (residual, jacobians)
    }

    /// Triggs Jacobian rescaling around the raw residual.
    fn correct_jacobians(&self, raw_residual: &DVector<f64>, jacobians: &mut [DMatrix<f64>]) {
        let loss = match &self.loss {
            Some(loss) => loss,
            None => return,
        };
        let (sqrt_rho1, _, alpha_sq_norm) = triggs_correction(loss, raw_residual.norm_squared());
        for jac in jacobians.iter_mut() {
            if alpha_sq_norm == 0.0 {
                *jac *= sqrt_rho1;
            } else {
                let rt_j = raw_residual.transpose() * &*jac;
                *jac = sqrt_rho1 * (&*jac - alpha_sq_norm * raw_residual * rt_j);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::state::{DroneId, Frame, PoseDof};
    use approx::assert_relative_eq;
    use nalgebra::Matrix4;

    fn two_frame_state() -> GraphState {
        let mut state = GraphState::new(PoseDof::Four, false);
        state.add_frame(Frame::new(
            FrameId::new(1),
            DroneId::new(0),
            DroneId::new(0),
            0.0,
            SE3::identity(),
        ));
        state.add_frame(Frame::new(
            FrameId::new(2),
            DroneId::new(0),
            DroneId::new(0),
            1.0,
            SE3::from_xyz_yaw(0.9, 0.1, 0.0, 0.05),
        ));
        state
    }

    fn rel_pose_cost(meas: &SE3) -> ResidualCost {
        ResidualCost::RelPose4d {
            factor: RelPoseFactor4d::new(meas, Matrix4::identity()),
            frame_a: FrameId::new(1),
            frame_b: FrameId::new(2),
        }
    }

    #[test]
    fn test_rel_pose_4d_evaluate_shapes() {
        let state = two_frame_state();
        let meas = SE3::from_xyz_yaw(1.0, 0.0, 0.0, 0.0);
        let info = ResidualInfo::new(rel_pose_cost(&meas));
        let (r, jacs) = info.evaluate(&state);
        assert_eq!(r.len(), 4);
        assert_eq!(jacs.len(), 2);
        assert_eq!(jacs[0].shape(), (4, 4));
    }

    #[test]
    fn test_relevant_checks_endpoints() {
        let info = ResidualInfo::new(rel_pose_cost(&SE3::identity()));
        let mut set = HashSet::new();
        set.insert(FrameId::new(2));
        assert!(info.relevant(&set));
        let mut other = HashSet::new();
        other.insert(FrameId::new(5));
        assert!(!info.relevant(&other));
    }

    #[test]
    fn test_params_list_kinds() {
        let state = two_frame_state();
        let info = ResidualInfo::new(rel_pose_cost(&SE3::identity()));
        let params = info.params_list(&state);
        assert_eq!(params.len(), 2);
        assert!(params.iter().all(|p| p.kind == ParamKind::Pose));
        assert!(params.iter().all(|p| p.eff_size == 4));
        assert_eq!(params[0].frame, Some(FrameId::new(1)));
    }

    #[test]
    fn test_evaluate_matches_direct_residual() {
        let state = two_frame_state();
        let meas = SE3::from_xyz_yaw(1.0, 0.0, 0.0, 0.0);
        let factor = RelPoseFactor4d::new(&meas, Matrix4::identity());
        let info = ResidualInfo::new(ResidualCost::RelPose4d {
            factor: factor.clone(),
            frame_a: FrameId::new(1),
            frame_b: FrameId::new(2),
        });
        let (r, _) = info.evaluate(&state);
        let block_a = state.pose_state(FrameId::new(1)).unwrap();
        let block_b = state.pose_state(FrameId::new(2)).unwrap();
        let direct = factor.residual(&[
            state.block_values(block_a),
            state.block_values(block_b),
        ]);
        assert_relative_eq!((r - direct).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_huber_loss_downweights_outlier() {
        let state = two_frame_state();
        // Measurement 10 m off the current estimate.
        let meas = SE3::from_xyz_yaw(11.0, 0.0, 0.0, 0.0);
        let plain = ResidualInfo::new(rel_pose_cost(&meas));
        let robust = ResidualInfo::with_loss(
            rel_pose_cost(&meas),
            LossFunction::Huber { delta: 1.0 },
        );

        let (r_plain, j_plain) = plain.evaluate(&state);
        let (r_robust, j_robust) = robust.evaluate(&state);
        assert!(r_robust.norm() < r_plain.norm());
        assert!(j_robust[0].norm() < j_plain[0].norm());
    }

    #[test]
    fn test_loss_is_identity_inside_kernel() {
        let state = two_frame_state();
        // Small residual: quadratic region of the kernel.
        let meas = SE3::from_xyz_yaw(1.0, 0.0, 0.0, 0.0);
        let plain = ResidualInfo::new(rel_pose_cost(&meas));
        let robust = ResidualInfo::with_loss(
            rel_pose_cost(&meas),
            LossFunction::Huber { delta: 5.0 },
        );
        let (r_plain, _) = plain.evaluate(&state);
        let (r_robust, _) = robust.evaluate(&state);
        assert_relative_eq!((r_plain - r_robust).norm(), 0.0, epsilon = 1e-12);
    }
}
