//! Chordal rotation initialization over the loop subgraph.
//!
//! The rotation subproblem of pose-graph optimization is non-convex; a bad
//! initial guess strands the local solver in a spurious basin. Before the
//! nonlinear solve, rotations are estimated alone by a linear relaxation:
//! every edge (a, b, R_meas) contributes `R_b − R_a · R_meas = 0` rows over
//! the flattened rotation entries (unit yaw vectors in 4-DoF mode), the
//! anchor frame is held fixed, and the least-squares solution is projected
//! back onto the manifold.

use std::collections::BTreeSet;

use nalgebra::{DMatrix, DVector, Matrix3, Rotation3, UnitQuaternion};

use crate::geometry::SE3;
use crate::loops::LoopEdge;
use crate::state::{FrameId, GraphState, PoseDof};

/// Solve for rotations over the edge subgraph and write the results back as
/// pose initializations. Returns the number of frames updated.
pub fn initialize_rotations(
    state: &mut GraphState,
    edges: &[LoopEdge],
    fixed_frame_id: FrameId,
) -> usize {
    let mut frames: BTreeSet<FrameId> = BTreeSet::new();
    for edge in edges {
        frames.insert(edge.keyframe_id_a);
        frames.insert(edge.keyframe_id_b);
    }
    if !frames.contains(&fixed_frame_id) || frames.len() < 2 {
        return 0;
    }

    let solved = match state.pose_dof() {
        PoseDof::Six => solve_chordal_so3(state, edges, &frames, fixed_frame_id),
        PoseDof::Four => solve_chordal_yaw(state, edges, &frames, fixed_frame_id),
    };

    let mut updated = 0;
    for (frame_id, rotation) in solved {
        if let Some(frame) = state.frame(frame_id) {
            let pose = SE3::new(rotation, frame.odom_pose.translation);
            state.write_pose(frame_id, &pose);
            updated += 1;
        }
    }
    state.sync_from_state();
    tracing::debug!("rotation initialization updated {} frames", updated);
    updated
}

/// Full SO(3) chordal relaxation: 9 unknowns per free frame.
fn solve_chordal_so3(
    state: &GraphState,
    edges: &[LoopEdge],
    frames: &BTreeSet<FrameId>,
    fixed: FrameId,
) -> Vec<(FrameId, UnitQuaternion<f64>)> {
    let free: Vec<FrameId> = frames.iter().copied().filter(|&f| f != fixed).collect();
    let col_of = |f: FrameId| free.iter().position(|&x| x == f).map(|i| i * 9);
    let n_vars = free.len() * 9;
    let n_rows = edges.len() * 9;

    let fixed_rot = state
        .frame(fixed)
        .map(|f| f.odom_pose.rotation_matrix())
        .unwrap_or_else(Matrix3::identity);

    let mut a = DMatrix::<f64>::zeros(n_rows, n_vars);
    let mut rhs = DVector::<f64>::zeros(n_rows);

    for (e, edge) in edges.iter().enumerate() {
        let r_meas = edge.relative_pose.rotation_matrix();
        let row0 = e * 9;
        // Rows indexed by (r, c) entry of: R_b - R_a * R_meas = 0.
        for r in 0..3 {
            for c in 0..3 {
                let row = row0 + r * 3 + c;
                match col_of(edge.keyframe_id_b) {
                    Some(col) => a[(row, col + r * 3 + c)] += 1.0,
                    None => rhs[row] -= fixed_rot[(r, c)],
                }
                match col_of(edge.keyframe_id_a) {
                    Some(col) => {
                        for k in 0..3 {
                            a[(row, col + r * 3 + k)] -= r_meas[(k, c)];
                        }
                    }
                    None => rhs[row] += (fixed_rot * r_meas)[(r, c)],
                }
            }
        }
    }

    let svd = a.svd(true, true);
    let x = match svd.solve(&rhs, 1e-12) {
        Ok(x) => x,
        Err(_) => return Vec::new(),
    };

    free.iter()
        .enumerate()
        .map(|(i, &frame_id)| {
            let base = i * 9;
            let m = Matrix3::from_fn(|r, c| x[base + r * 3 + c]);
            (frame_id, project_to_so3(&m))
        })
        .collect()
}

/// Yaw-only chordal relaxation on unit vectors (cos θ, sin θ).
fn solve_chordal_yaw(
    state: &GraphState,
    edges: &[LoopEdge],
    frames: &BTreeSet<FrameId>,
    fixed: FrameId,
) -> Vec<(FrameId, UnitQuaternion<f64>)> {
    let free: Vec<FrameId> = frames.iter().copied().filter(|&f| f != fixed).collect();
    let col_of = |f: FrameId| free.iter().position(|&x| x == f).map(|i| i * 2);
    let n_vars = free.len() * 2;
    let n_rows = edges.len() * 2;

    let fixed_yaw = state.frame(fixed).map(|f| f.odom_pose.yaw()).unwrap_or(0.0);
    let fixed_vec = [fixed_yaw.cos(), fixed_yaw.sin()];

    let mut a = DMatrix::<f64>::zeros(n_rows, n_vars);
    let mut rhs = DVector::<f64>::zeros(n_rows);

    for (e, edge) in edges.iter().enumerate() {
        let dyaw = edge.relative_pose.yaw();
        let (c, s) = (dyaw.cos(), dyaw.sin());
        let row = e * 2;
        // v_b = R(dyaw) v_a, with R(θ) = [[c, -s], [s, c]].
        match col_of(edge.keyframe_id_b) {
            Some(col) => {
                a[(row, col)] += 1.0;
                a[(row + 1, col + 1)] += 1.0;
            }
            None => {
                rhs[row] -= fixed_vec[0];
                rhs[row + 1] -= fixed_vec[1];
            }
        }
        match col_of(edge.keyframe_id_a) {
            Some(col) => {
                a[(row, col)] -= c;
                a[(row, col + 1)] += s;
                a[(row + 1, col)] -= s;
                a[(row + 1, col + 1)] -= c;
            }
            None => {
                rhs[row] += c * fixed_vec[0] - s * fixed_vec[1];
                rhs[row + 1] += s * fixed_vec[0] + c * fixed_vec[1];
            }
        }
    }

    let svd = a.svd(true, true);
    let x = match svd.solve(&rhs, 1e-12) {
        Ok(x) => x,
        Err(_) => return Vec::new(),
    };

    free.iter()
        .enumerate()
        .map(|(i, &frame_id)| {
            let yaw = x[i * 2 + 1].atan2(x[i * 2]);
            (frame_id, UnitQuaternion::from_euler_angles(0.0, 0.0, yaw))
        })
        .collect()
}

/// Nearest rotation in Frobenius norm, via SVD.
fn project_to_so3(m: &Matrix3<f64>) -> UnitQuaternion<f64> {
    let svd = m.svd(true, true);
    let u = svd.u.unwrap();
    let v_t = svd.v_t.unwrap();
    let det = (u * v_t).determinant();
    let d = Matrix3::from_diagonal(&nalgebra::Vector3::new(1.0, 1.0, det.signum()));
    let r = u * d * v_t;
    UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DroneId, Frame};
    use approx::assert_relative_eq;
    use nalgebra::Matrix6;
    use std::f64::consts::FRAC_PI_2;

    fn add_frame(state: &mut GraphState, id: u64, pose: SE3) {
        state.add_frame(Frame::new(
            FrameId::new(id),
            DroneId::new(0),
            DroneId::new(0),
            id as f64,
            pose,
        ));
    }

    fn edge(a: u64, b: u64, rel: SE3) -> LoopEdge {
        LoopEdge::new(
            FrameId::new(a),
            FrameId::new(b),
            DroneId::new(0),
            DroneId::new(0),
            rel,
            Matrix6::identity(),
            0.0,
        )
    }

    #[test]
    fn test_yaw_chain_initialized() {
        // Square path with 90 degree turns; yaws start at zero.
        let mut state = GraphState::new(PoseDof::Four, false);
        for id in 1..=4 {
            add_frame(&mut state, id, SE3::identity());
        }
        let edges = vec![
            edge(1, 2, SE3::from_xyz_yaw(1.0, 0.0, 0.0, FRAC_PI_2)),
            edge(2, 3, SE3::from_xyz_yaw(1.0, 0.0, 0.0, FRAC_PI_2)),
            edge(3, 4, SE3::from_xyz_yaw(1.0, 0.0, 0.0, FRAC_PI_2)),
        ];
        let updated = initialize_rotations(&mut state, &edges, FrameId::new(1));
        assert_eq!(updated, 3);

        for (id, expected) in [(2, FRAC_PI_2), (3, 2.0 * FRAC_PI_2), (4, -FRAC_PI_2)] {
            let yaw = state.frame(FrameId::new(id)).unwrap().odom_pose.yaw();
            assert_relative_eq!(yaw, expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_so3_chain_initialized() {
        let mut state = GraphState::new(PoseDof::Six, false);
        for id in 1..=3 {
            add_frame(&mut state, id, SE3::identity());
        }
        let rel = SE3::new(
            UnitQuaternion::from_euler_angles(0.2, -0.1, 0.8),
            nalgebra::Vector3::new(1.0, 0.0, 0.0),
        );
        let edges = vec![edge(1, 2, rel), edge(2, 3, rel)];
        let updated = initialize_rotations(&mut state, &edges, FrameId::new(1));
        assert_eq!(updated, 2);

        let r2 = state.frame(FrameId::new(2)).unwrap().odom_pose.rotation;
        let err = (r2.inverse() * rel.rotation).angle();
        assert_relative_eq!(err, 0.0, epsilon = 1e-6);

        let r3 = state.frame(FrameId::new(3)).unwrap().odom_pose.rotation;
        let expected = rel.rotation * rel.rotation;
        assert_relative_eq!((r3.inverse() * expected).angle(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_anchor_untouched_without_edges() {
        let mut state = GraphState::new(PoseDof::Four, false);
        add_frame(&mut state, 1, SE3::identity());
        let updated = initialize_rotations(&mut state, &[], FrameId::new(1));
        assert_eq!(updated, 0);
    }
}
