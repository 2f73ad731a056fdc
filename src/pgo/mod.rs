//! Pose-graph optimization: engine, rotation initialization, debug sinks.

pub mod engine;
pub mod g2o;
pub mod rotation_init;

pub use engine::{ego_motion_sqrt_info, PgoConfig, PgoEngine, PgoMode};
