//! Distributed-vs-centralized consistency: two agents running ADMM
//! consensus over channel-shipped exchange messages converge to the
//! centralized solution (identically anchored, so no residual gauge).

use approx::assert_relative_eq;
use crossbeam_channel::unbounded;
use nalgebra::Matrix6;

use swarm_backend::dpgo::ArockConfig;
use swarm_backend::geometry::SE3;
use swarm_backend::loops::LoopEdge;
use swarm_backend::pgo::{PgoConfig, PgoEngine, PgoMode};
use swarm_backend::state::{DroneId, Frame, FrameId, PoseDof};

const MAIN: u32 = 1;
const OTHER: u32 = 2;

/// Ground-truth poses: drone 1 along y = 0, drone 2 along y = 2.
fn truth(drone: u32, i: u64) -> SE3 {
    let y = if drone == MAIN { 0.0 } else { 2.0 };
    SE3::from_xyz_yaw(i as f64, y, 0.0, 0.0)
}

fn frame(id: u64, drone: u32, pose: SE3) -> Frame {
    Frame::new(
        FrameId::new(id),
        DroneId::new(drone),
        DroneId::new(MAIN),
        id as f64,
        pose,
    )
}

/// Frames and loops of the joint problem. Drone 1 owns frames 11..13,
/// drone 2 owns 21..23; two inter-agent loops tie the trajectories.
/// Both agents' odometry is expressed in the common (main) frame, which is
/// the premise of the non-main gauge anchor.
fn populate(engine: &PgoEngine) {
    for i in 0..3 {
        engine.add_frame(frame(11 + i, MAIN, truth(MAIN, i)));
    }
    for i in 0..3 {
        engine.add_frame(frame(21 + i, OTHER, truth(OTHER, i)));
    }

    let inter = |a: u64, b: u64, rel: SE3| {
        LoopEdge::new(
            FrameId::new(a),
            FrameId::new(b),
            DroneId::new(MAIN),
            DroneId::new(OTHER),
            rel,
            Matrix6::identity(),
            a as f64,
        )
    };
    // True relative transforms between matched frames.
    engine.add_loop(
        inter(11, 21, SE3::from_xyz_yaw(0.0, 2.0, 0.0, 0.0)),
        false,
    );
    engine.add_loop(
        inter(13, 23, SE3::from_xyz_yaw(0.0, 2.0, 0.0, 0.0)),
        false,
    );
}

fn config(self_id: u32, mode: PgoMode) -> PgoConfig {
    PgoConfig {
        self_id: DroneId::new(self_id),
        main_id: DroneId::new(MAIN),
        mode,
        pose_dof: PoseDof::Four,
        min_solve_size: 1,
        arock: ArockConfig {
            rho: 1.0,
            max_steps: 3,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn distributed_matches_centralized() {
    // Centralized reference.
    let central = PgoEngine::new(config(MAIN, PgoMode::NonDistributed));
    populate(&central);
    assert!(central.solve(true));
    let central_trajs = central.optimized_trajs();

    // Two distributed agents wired over channels.
    let engine_a = std::sync::Arc::new(PgoEngine::new(config(MAIN, PgoMode::DistributedArock)));
    let engine_b = std::sync::Arc::new(PgoEngine::new(config(OTHER, PgoMode::DistributedArock)));
    populate(&engine_a);
    populate(&engine_b);

    let (tx_ab, rx_ab) = unbounded();
    let (tx_ba, rx_ba) = unbounded();
    engine_a.set_broadcast_callback(Box::new(move |data| {
        let _ = tx_ab.send(data);
    }));
    engine_b.set_broadcast_callback(Box::new(move |data| {
        let _ = tx_ba.send(data);
    }));

    // Alternate local solves, pumping exchange messages in between.
    for _ in 0..8 {
        engine_a.solve(true);
        while let Ok(data) = rx_ab.try_recv() {
            engine_b.input_dpgo_data(data);
        }
        engine_b.solve(true);
        while let Ok(data) = rx_ba.try_recv() {
            engine_a.input_dpgo_data(data);
        }
    }

    // Drone 1's trajectory from agent A matches the centralized result.
    let trajs_a = engine_a.optimized_trajs();
    let ref_main = &central_trajs[&DroneId::new(MAIN)];
    let dist_main = &trajs_a[&DroneId::new(MAIN)];
    assert_eq!(dist_main.len(), ref_main.len());
    for i in 0..ref_main.len() {
        let (_, ref_pose, _) = ref_main.get(i);
        let (_, dist_pose, _) = dist_main.get(i);
        assert_relative_eq!(
            dist_pose.translation,
            ref_pose.translation,
            epsilon = 5e-2
        );
    }

    // Drone 2's trajectory from agent B matches too (same anchoring).
    let trajs_b = engine_b.optimized_trajs();
    let ref_other = &central_trajs[&DroneId::new(OTHER)];
    let dist_other = &trajs_b[&DroneId::new(OTHER)];
    assert_eq!(dist_other.len(), ref_other.len());
    for i in 0..ref_other.len() {
        let (_, ref_pose, _) = ref_other.get(i);
        let (_, dist_pose, _) = dist_other.get(i);
        assert_relative_eq!(
            dist_pose.translation,
            ref_pose.translation,
            epsilon = 5e-2
        );
    }
}
