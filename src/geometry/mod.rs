//! Geometry utilities: SE3 transforms, SO(3) maps, yaw wrapping.

pub mod angles;
pub mod se3;
pub mod so3;

pub use angles::{angle_diff, normalize_angle};
pub use se3::SE3;
