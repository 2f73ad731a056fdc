//! g2o-format debug sink.
//!
//! Dumps the frames and loop edges used by the last solve as
//! `VERTEX_SE3:QUAT` / `EDGE_SE3:QUAT` lines, either with the raw odometry
//! poses or with the current estimates.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::geometry::SE3;
use crate::loops::LoopEdge;
use crate::state::Frame;

/// Write the used frames and loops to `path`.
///
/// With `use_raw_data` the vertices carry the raw ego poses instead of the
/// optimized estimates.
pub fn write_g2o(
    path: &Path,
    frames: &[&Frame],
    loops: &[LoopEdge],
    use_raw_data: bool,
) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create g2o output {}", path.display()))?;
    let mut out = BufWriter::new(file);

    let mut sorted: Vec<&&Frame> = frames.iter().collect();
    sorted.sort_by_key(|f| f.frame_id);

    for frame in sorted {
        let pose = if use_raw_data {
            &frame.initial_ego_pose
        } else {
            &frame.odom_pose
        };
        writeln!(out, "VERTEX_SE3:QUAT {} {}", frame.frame_id.0, pose_fields(pose))?;
    }

    for edge in loops {
        let info = edge.sqrt_info.transpose() * edge.sqrt_info;
        let mut line = format!(
            "EDGE_SE3:QUAT {} {} {}",
            edge.keyframe_id_a.0,
            edge.keyframe_id_b.0,
            pose_fields(&edge.relative_pose)
        );
        for i in 0..6 {
            for j in i..6 {
                line.push_str(&format!(" {}", info[(i, j)]));
            }
        }
        writeln!(out, "{}", line)?;
    }

    out.flush().context("failed to flush g2o output")?;
    Ok(())
}

fn pose_fields(pose: &SE3) -> String {
    format!(
        "{} {} {} {} {} {} {}",
        pose.translation.x,
        pose.translation.y,
        pose.translation.z,
        pose.rotation.i,
        pose.rotation.j,
        pose.rotation.k,
        pose.rotation.w
    )
}
