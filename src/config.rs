use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, TrackerResult};
use crate::filters::measurement::{DEFAULT_MIN_EIGEN_RATIO, DEFAULT_PIXEL_NOISE_STD};
use crate::filters::MeasurementModel;
use crate::tracker::FilterSettings;
use crate::types::Intrinsics;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Output file; logging is disabled when absent
    pub path: Option<PathBuf>,
    /// Attempt a write every N cycles
    pub decimation: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: None,
            decimation: 1,
        }
    }
}

/// Tracker configuration, loadable from JSON. Missing fields take defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Control period [ms]
    pub period_ms: u64,
    /// Marker side length shared by all tags [m]
    pub marker_length: f64,
    /// Corner detection noise [px]
    pub pixel_noise_std: f64,
    /// Reject measurement covariances whose JᵀJ eigenvalue ratio is below this
    pub min_eigen_ratio: f64,
    /// Diagonal process noise when no vehicle state is available [m²]
    pub fallback_process_noise: f64,
    /// Diagonal seed covariance when the first detection is unusable [m²]
    pub initial_variance: f64,
    pub intrinsics: Intrinsics,
    pub log: LogConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            period_ms: 20,
            marker_length: 0.1,
            pixel_noise_std: DEFAULT_PIXEL_NOISE_STD,
            min_eigen_ratio: DEFAULT_MIN_EIGEN_RATIO,
            fallback_process_noise: 1e-3,
            initial_variance: 1e-2,
            intrinsics: Intrinsics::default(),
            log: LogConfig::default(),
        }
    }
}

impl TrackerConfig {
    pub fn load(path: &Path) -> TrackerResult<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.period_ms == 0 {
            return Err(ConfigError::InvalidParameters(
                "period_ms must be positive".to_string(),
            ));
        }
        if self.marker_length.is_nan() || self.marker_length <= 0.0 {
            return Err(ConfigError::InvalidParameters(format!(
                "marker_length must be positive, got {}",
                self.marker_length
            )));
        }
        if self.pixel_noise_std.is_nan() || self.pixel_noise_std <= 0.0 {
            return Err(ConfigError::InvalidParameters(format!(
                "pixel_noise_std must be positive, got {}",
                self.pixel_noise_std
            )));
        }
        if self.fallback_process_noise.is_nan()
            || self.initial_variance.is_nan()
            || self.fallback_process_noise < 0.0
            || self.initial_variance <= 0.0
        {
            return Err(ConfigError::InvalidParameters(
                "noise floors must be non-negative (initial_variance positive)".to_string(),
            ));
        }
        if self.log.decimation == 0 {
            return Err(ConfigError::InvalidParameters(
                "log.decimation must be at least 1".to_string(),
            ));
        }
        let k = &self.intrinsics;
        if k.fx.is_nan() || k.fy.is_nan() || k.fx <= 0.0 || k.fy <= 0.0 {
            return Err(ConfigError::InvalidParameters(
                "focal lengths must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Control period [s]
    pub fn dt(&self) -> f64 {
        self.period_ms as f64 / 1000.0
    }

    pub fn measurement_model(&self) -> MeasurementModel {
        MeasurementModel {
            marker_length: self.marker_length,
            pixel_noise_std: self.pixel_noise_std,
            min_eigen_ratio: self.min_eigen_ratio,
        }
    }

    pub fn filter_settings(&self) -> FilterSettings {
        FilterSettings {
            dt: self.dt(),
            fallback_process_noise: self.fallback_process_noise,
            initial_variance: self.initial_variance,
            measurement: self.measurement_model(),
        }
    }
}
