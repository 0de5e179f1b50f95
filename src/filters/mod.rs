pub mod measurement;
pub mod tag_ekf;

pub use measurement::MeasurementModel;
pub use tag_ekf::{FilterState, TagEstimate, TagFilter, TagFilterStatus};
