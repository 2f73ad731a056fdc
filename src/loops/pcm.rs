//! Pairwise Consistent Measurement (PCM) outlier rejection.
//!
//! Two loops are consistent when the transform discrepancy of the cycle
//! loop₁ ∘ odom(b₁→b₂)... closed through the ego-motion trajectories falls
//! inside a Mahalanobis gate under the combined loop covariances. The inlier
//! set is the maximum clique of the pairwise-consistency graph.

use std::collections::HashMap;

use nalgebra::Vector4;

use crate::state::{DroneId, DroneTrajectory};

use super::LoopEdge;

/// Select the maximum mutually-consistent subset of `loops`.
///
/// `trajs` supplies per-agent odometry for the in-trajectory chains;
/// `threshold` gates the squared Mahalanobis discrepancy (chi-square with
/// 4 degrees of freedom).
pub fn pairwise_consistent_loops(
    loops: &[LoopEdge],
    trajs: &HashMap<DroneId, DroneTrajectory>,
    threshold: f64,
) -> Vec<LoopEdge> {
    let n = loops.len();
    if n <= 1 {
        return loops.to_vec();
    }

    let mut adjacency = vec![vec![false; n]; n];
    for i in 0..n {
        adjacency[i][i] = true;
        for j in (i + 1)..n {
            let consistent = match mahalanobis_discrepancy(&loops[i], &loops[j], trajs) {
                Some(d2) => d2 < threshold,
                // Pairs with no common odometry chain cannot vote against
                // each other.
                None => true,
            };
            adjacency[i][j] = consistent;
            adjacency[j][i] = consistent;
        }
    }

    let clique = max_clique(&adjacency);
    let inliers: Vec<LoopEdge> = {
        let mut members: Vec<usize> = clique;
        members.sort_unstable();
        members.into_iter().map(|i| loops[i].clone()).collect()
    };
    tracing::debug!(
        "pcm kept {}/{} loops (gate {:.2})",
        inliers.len(),
        n,
        threshold
    );
    inliers
}

/// Squared Mahalanobis discrepancy of the cycle closed through odometry, or
/// None when the two loops connect no common drone pair.
fn mahalanobis_discrepancy(
    l1: &LoopEdge,
    l2: &LoopEdge,
    trajs: &HashMap<DroneId, DroneTrajectory>,
) -> Option<f64> {
    // Orient l2 so both loops run drone_a -> drone_b.
    let l2 = if l1.drone_id_a == l2.drone_id_a && l1.drone_id_b == l2.drone_id_b {
        l2.clone()
    } else if l1.drone_id_a == l2.drone_id_b && l1.drone_id_b == l2.drone_id_a {
        l2.inverted()
    } else {
        return None;
    };

    let odom_a = trajs
        .get(&l1.drone_id_a)?
        .relative_pose(l1.keyframe_id_a, l2.keyframe_id_a)?;
    let odom_b = trajs
        .get(&l1.drone_id_b)?
        .relative_pose(l2.keyframe_id_b, l1.keyframe_id_b)?;

    // Path a1 -> b1 through l2, compared against l1 directly.
    let path = odom_a.compose(&l2.relative_pose).compose(&odom_b);
    let err = l1.relative_pose.inverse().compose(&path);
    let e = Vector4::new(
        err.translation.x,
        err.translation.y,
        err.translation.z,
        err.yaw(),
    );

    let cov = l1.covariance_4d() + l2.covariance_4d();
    let info = cov.try_inverse()?;
    Some((e.transpose() * info * e)[(0, 0)])
}

/// Maximum clique via Bron-Kerbosch with pivoting. Loop counts are small
/// enough that the exact search is cheap.
fn max_clique(adjacency: &[Vec<bool>]) -> Vec<usize> {
    let n = adjacency.len();
    let mut best: Vec<usize> = Vec::new();
    let mut r: Vec<usize> = Vec::new();
    let p: Vec<usize> = (0..n).collect();
    let x: Vec<usize> = Vec::new();
    bron_kerbosch(adjacency, &mut r, p, x, &mut best);
    best
}

fn bron_kerbosch(
    adjacency: &[Vec<bool>],
    r: &mut Vec<usize>,
    p: Vec<usize>,
    x: Vec<usize>,
    best: &mut Vec<usize>,
) {
    if p.is_empty() && x.is_empty() {
        if r.len() > best.len() {
            *best = r.clone();
        }
        return;
    }
    // Pivot on the vertex with most neighbors in P.
    let pivot = p
        .iter()
        .chain(x.iter())
        .copied()
        .max_by_key(|&u| p.iter().filter(|&&v| adjacency[u][v]).count())
        .unwrap();

    let candidates: Vec<usize> = p
        .iter()
        .copied()
        .filter(|&v| !adjacency[pivot][v])
        .collect();
    let mut p = p;
    let mut x = x;
    for v in candidates {
        r.push(v);
        let p_next: Vec<usize> = p.iter().copied().filter(|&u| adjacency[v][u] && u != v).collect();
        let x_next: Vec<usize> = x.iter().copied().filter(|&u| adjacency[v][u] && u != v).collect();
        bron_kerbosch(adjacency, r, p_next, x_next, best);
        r.pop();
        p.retain(|&u| u != v);
        x.push(v);
    }
}
