//! Per-tag 3-state Extended Kalman Filter
//!
//! State: tag position (x, y, z) in camera frame [m].
//! Control: camera twist (vx, vy, vz, wx, wy, wz) in camera frame.
//!
//! The tag is static in the world, so seen from the moving camera its
//! position evolves as ṗ = −v − ω × p. The control matrix is therefore a
//! function of the current estimate, which is what makes this an EKF.

use serde::{Deserialize, Serialize};

use crate::error::FilterError;
use crate::types::{ControlMatrix, Detection, MeasurementCov, StateCov, StateVec, TagId, Twist};

#[derive(Clone, Debug, PartialEq)]
pub struct TagEstimate {
    pub position: StateVec,
    pub covariance: StateCov,
}

/// Linearised control matrix B(dt, p) for p = (x, y, z).
///
/// ```text
/// [ -dt   0    0     0   -dt*z  dt*y ]
/// [  0   -dt   0   dt*z    0   -dt*x ]
/// [  0    0   -dt  -dt*y  dt*x    0  ]
/// ```
#[rustfmt::skip]
pub fn control_matrix(dt: f64, position: &StateVec) -> ControlMatrix {
    let (x, y, z) = (position.x, position.y, position.z);
    ControlMatrix::new(
        -dt, 0.0, 0.0, 0.0, -dt * z, dt * y,
        0.0, -dt, 0.0, dt * z, 0.0, -dt * x,
        0.0, 0.0, -dt, -dt * y, dt * x, 0.0,
    )
}

/// Prediction: p' = F·p + B(dt, p)·u, P' = F·P·Fᵀ + Q with F = I.
pub fn predict(
    estimate: &TagEstimate,
    control: &Twist,
    process_noise: &StateCov,
    dt: f64,
) -> TagEstimate {
    let f = StateCov::identity();
    let b = control_matrix(dt, &estimate.position);

    TagEstimate {
        position: f * estimate.position + b * control,
        covariance: f * estimate.covariance * f.transpose() + process_noise,
    }
}

/// Correction with a direct position measurement (H = I).
pub fn correct(
    estimate: &TagEstimate,
    measurement: &StateVec,
    measurement_noise: &MeasurementCov,
) -> Result<TagEstimate, FilterError> {
    let h = StateCov::identity();
    let p = &estimate.covariance;

    let innovation = measurement - h * estimate.position;
    let s = h * p * h.transpose() + measurement_noise;
    let s_inv = s.try_inverse().ok_or(FilterError::SingularInnovation)?;
    let k = p * h.transpose() * s_inv;

    // Joseph form P = (I-KH)·P·(I-KH)ᵀ + K·R·Kᵀ
    let i_kh = StateCov::identity() - k * h;
    let joseph = i_kh * p * i_kh.transpose() + k * measurement_noise * k.transpose();

    Ok(TagEstimate {
        position: estimate.position + k * innovation,
        covariance: (joseph + joseph.transpose()) * 0.5,
    })
}

#[derive(Clone, Debug, PartialEq)]
pub enum FilterState {
    /// No detection seen yet
    Uninitialized,
    Tracking(TagEstimate),
}

/// Serializable snapshot of one tag filter
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TagFilterStatus {
    pub id: TagId,
    pub position: Option<(f64, f64, f64)>,
    pub covariance_trace: Option<f64>,

    /// Update counters
    pub predictions: u64,
    pub corrections: u64,
    pub rejected_corrections: u64,
}

pub struct TagFilter {
    id: TagId,
    state: FilterState,

    /// Last control matrix used by predict [3x6]
    control_matrix: ControlMatrix,

    /// Refreshed from vehicle covariance every cycle [3x3]
    process_noise: StateCov,

    /// Refreshed only when a detection is matched [3x3]
    measurement_noise: MeasurementCov,

    predictions: u64,
    corrections: u64,
    rejected_corrections: u64,
}

impl TagFilter {
    pub fn new(id: TagId) -> Self {
        Self {
            id,
            state: FilterState::Uninitialized,
            control_matrix: ControlMatrix::zeros(),
            process_noise: StateCov::zeros(),
            measurement_noise: MeasurementCov::identity(),
            predictions: 0,
            corrections: 0,
            rejected_corrections: 0,
        }
    }

    pub fn id(&self) -> TagId {
        self.id
    }

    pub fn state(&self) -> &FilterState {
        &self.state
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, FilterState::Tracking(_))
    }

    pub fn estimate(&self) -> Option<&TagEstimate> {
        match &self.state {
            FilterState::Tracking(estimate) => Some(estimate),
            FilterState::Uninitialized => None,
        }
    }

    pub fn position(&self) -> Option<StateVec> {
        self.estimate().map(|e| e.position)
    }

    pub fn control_matrix(&self) -> &ControlMatrix {
        &self.control_matrix
    }

    pub fn process_noise(&self) -> &StateCov {
        &self.process_noise
    }

    pub fn measurement_noise(&self) -> &MeasurementCov {
        &self.measurement_noise
    }

    /// First observation: state is the raw translation, no filtering.
    pub fn seed(&mut self, detection: &Detection, covariance: StateCov) {
        self.measurement_noise = covariance;
        self.state = FilterState::Tracking(TagEstimate {
            position: detection.translation(),
            covariance,
        });
    }

    pub fn predict(
        &mut self,
        control: &Twist,
        process_noise: &StateCov,
        dt: f64,
    ) -> Result<(), FilterError> {
        let FilterState::Tracking(estimate) = &self.state else {
            return Err(FilterError::Uninitialized(self.id));
        };

        self.control_matrix = control_matrix(dt, &estimate.position);
        self.process_noise = *process_noise;
        self.state = FilterState::Tracking(predict(estimate, control, process_noise, dt));
        self.predictions += 1;
        Ok(())
    }

    /// On error the predicted estimate is kept.
    pub fn correct(
        &mut self,
        measurement: &StateVec,
        measurement_noise: &MeasurementCov,
    ) -> Result<(), FilterError> {
        let FilterState::Tracking(estimate) = &self.state else {
            return Err(FilterError::Uninitialized(self.id));
        };

        match correct(estimate, measurement, measurement_noise) {
            Ok(corrected) => {
                self.measurement_noise = *measurement_noise;
                self.state = FilterState::Tracking(corrected);
                self.corrections += 1;
                Ok(())
            }
            Err(e) => {
                self.rejected_corrections += 1;
                Err(e)
            }
        }
    }

    /// Count a correction skipped by the caller (e.g. unusable measurement noise).
    pub fn reject_correction(&mut self) {
        self.rejected_corrections += 1;
    }

    pub fn status(&self) -> TagFilterStatus {
        let estimate = self.estimate();
        TagFilterStatus {
            id: self.id,
            position: estimate.map(|e| (e.position.x, e.position.y, e.position.z)),
            covariance_trace: estimate.map(|e| e.covariance.trace()),
            predictions: self.predictions,
            corrections: self.corrections,
            rejected_corrections: self.rejected_corrections,
        }
    }
}
