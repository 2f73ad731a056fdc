//! Marginalization equivalence: eliminating a frame at the batch optimum
//! and re-solving with the resulting prior reproduces the batch estimate.

use std::collections::HashSet;

use approx::assert_relative_eq;
use nalgebra::Matrix4;

use swarm_backend::factors::{
    Manifold, PosePriorFactor, RelPoseFactor4d, ResidualCost, ResidualInfo,
};
use swarm_backend::geometry::SE3;
use swarm_backend::marginalization::Marginalizer;
use swarm_backend::solver::{SolverAdapter, SolverConfig};
use swarm_backend::state::{DroneId, Frame, FrameId, GraphState, PoseDof};

fn add_frame(state: &mut GraphState, id: u64, pose: SE3) {
    state.add_frame(Frame::new(
        FrameId::new(id),
        DroneId::new(0),
        DroneId::new(0),
        id as f64,
        pose,
    ));
}

fn rel_residual(a: u64, b: u64, rel: SE3) -> ResidualInfo {
    ResidualInfo::new(ResidualCost::RelPose4d {
        factor: RelPoseFactor4d::new(&rel, Matrix4::identity()),
        frame_a: FrameId::new(a),
        frame_b: FrameId::new(b),
    })
}

/// Anchor on frame 1 plus slightly inconsistent edges, so the optimum is a
/// genuine compromise rather than an exact graph.
fn residuals() -> Vec<ResidualInfo> {
    vec![
        ResidualInfo::new(ResidualCost::PosePrior {
            factor: PosePriorFactor::new(vec![0.0; 4], 100.0, Manifold::PosYaw),
            frame: FrameId::new(1),
        }),
        rel_residual(1, 2, SE3::from_xyz_yaw(1.0, 0.0, 0.0, 0.0)),
        rel_residual(2, 3, SE3::from_xyz_yaw(1.0, 0.0, 0.0, 0.0)),
        // Direct edge disagreeing with the chain by 0.3 m.
        rel_residual(1, 3, SE3::from_xyz_yaw(2.3, 0.0, 0.0, 0.0)),
    ]
}

fn fresh_state() -> GraphState {
    let mut state = GraphState::new(PoseDof::Four, false);
    add_frame(&mut state, 1, SE3::identity());
    add_frame(&mut state, 2, SE3::from_xyz_yaw(0.9, 0.1, 0.0, 0.0));
    add_frame(&mut state, 3, SE3::from_xyz_yaw(2.1, -0.1, 0.0, 0.0));
    state
}

#[test]
fn marginalizing_first_frame_preserves_batch_optimum() {
    // 1. Batch solve.
    let mut state = fresh_state();
    let mut batch = SolverAdapter::new(SolverConfig::default());
    for info in residuals() {
        batch.add_residual(info);
    }
    let report = batch.solve(&mut state);
    assert!(report.converged);
    state.sync_from_state();

    let batch_p2 = state.frame(FrameId::new(2)).unwrap().odom_pose;
    let batch_p3 = state.frame(FrameId::new(3)).unwrap().odom_pose;

    // 2. Marginalize frame 1 at the optimum.
    let mut marg = Marginalizer::new();
    for info in residuals() {
        marg.add_residual(info);
    }
    let mut remove = HashSet::new();
    remove.insert(FrameId::new(1));
    let prior = marg.marginalize(&state, &remove).expect("prior");
    assert_eq!(prior.params().len(), 2);

    // 3. Perturb the survivors, then re-solve with prior + remaining edge.
    state.write_pose(FrameId::new(2), &SE3::from_xyz_yaw(1.2, 0.2, 0.0, 0.0));
    state.write_pose(FrameId::new(3), &SE3::from_xyz_yaw(1.8, -0.3, 0.0, 0.0));
    state.sync_from_state();

    let mut reduced = SolverAdapter::new(SolverConfig::default());
    reduced.add_residual(ResidualInfo::new(ResidualCost::Prior { factor: prior }));
    reduced.add_residual(rel_residual(2, 3, SE3::from_xyz_yaw(1.0, 0.0, 0.0, 0.0)));
    let report = reduced.solve(&mut state);
    assert!(report.converged);
    state.sync_from_state();

    let red_p2 = state.frame(FrameId::new(2)).unwrap().odom_pose;
    let red_p3 = state.frame(FrameId::new(3)).unwrap().odom_pose;

    assert_relative_eq!(red_p2.translation, batch_p2.translation, epsilon = 1e-5);
    assert_relative_eq!(red_p3.translation, batch_p3.translation, epsilon = 1e-5);
    assert_relative_eq!(red_p2.yaw(), batch_p2.yaw(), epsilon = 1e-6);
    assert_relative_eq!(red_p3.yaw(), batch_p3.yaw(), epsilon = 1e-6);
}

#[test]
fn chained_prior_matches_three_frame_solve() {
    // S6: loops (1-2) and (2-3); after eliminating frame 1, the prior on
    // frame 2 plus the (2-3) loop reproduce frame 3's batch pose.
    let mut state = fresh_state();
    let chain = vec![
        ResidualInfo::new(ResidualCost::PosePrior {
            factor: PosePriorFactor::new(vec![0.0; 4], 100.0, Manifold::PosYaw),
            frame: FrameId::new(1),
        }),
        rel_residual(1, 2, SE3::from_xyz_yaw(1.0, 0.0, 0.0, 0.0)),
        rel_residual(2, 3, SE3::from_xyz_yaw(1.0, 0.5, 0.0, 0.0)),
    ];

    let mut batch = SolverAdapter::new(SolverConfig::default());
    for info in chain.clone() {
        batch.add_residual(info);
    }
    batch.solve(&mut state);
    state.sync_from_state();
    let batch_p3 = state.frame(FrameId::new(3)).unwrap().odom_pose;

    let mut marg = Marginalizer::new();
    for info in chain {
        marg.add_residual(info);
    }
    let mut remove = HashSet::new();
    remove.insert(FrameId::new(1));
    let prior = marg.marginalize(&state, &remove).expect("prior");

    state.write_pose(FrameId::new(3), &SE3::from_xyz_yaw(2.5, 0.0, 0.0, 0.1));
    state.sync_from_state();

    let mut reduced = SolverAdapter::new(SolverConfig::default());
    reduced.add_residual(ResidualInfo::new(ResidualCost::Prior { factor: prior }));
    reduced.add_residual(rel_residual(2, 3, SE3::from_xyz_yaw(1.0, 0.5, 0.0, 0.0)));
    reduced.solve(&mut state);
    state.sync_from_state();

    let red_p3 = state.frame(FrameId::new(3)).unwrap().odom_pose;
    assert_relative_eq!(red_p3.translation, batch_p3.translation, epsilon = 1e-5);
    assert_relative_eq!(red_p3.yaw(), batch_p3.yaw(), epsilon = 1e-6);
}
