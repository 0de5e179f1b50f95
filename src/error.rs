use thiserror::Error;

/// Failures of the reprojection-based measurement covariance
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeasurementError {
    #[error("Corner {corner} projects behind or onto the camera plane (depth {depth:.3e})")]
    DegenerateProjection { corner: usize, depth: f64 },

    #[error("Stacked Jacobian is ill-conditioned (eigenvalue ratio {ratio:.3e})")]
    IllConditioned { ratio: f64 },

    #[error("Invalid marker length: {0}")]
    InvalidMarkerLength(f64),
}

/// Kalman filter numeric failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("Innovation covariance is singular")]
    SingularInnovation,

    #[error("Filter for tag {0} has no estimate yet")]
    Uninitialized(i32),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

/// Crate-level error type
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error(transparent)]
    Measurement(#[from] MeasurementError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type TrackerResult<T> = Result<T, TrackerError>;
