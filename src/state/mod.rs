//! Estimator state: frames, trajectories and raw parameter storage.

pub mod frame;
pub mod graph_state;
pub mod types;

pub use frame::{DroneTrajectory, Frame};
pub use graph_state::{GraphState, ParamBlockId, ParamKind, PoseDof};
pub use types::{CameraId, DroneId, FrameId, LandmarkId};
