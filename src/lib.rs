pub mod config;
pub mod error;
pub mod filters;
pub mod frames;
pub mod pose_log;
pub mod publisher;
pub mod session;
pub mod tracker;
pub mod types;

pub use config::TrackerConfig;
pub use error::{TrackerError, TrackerResult};
pub use session::{Session, SessionMode};
pub use tracker::{CycleStatus, FilterBank};
