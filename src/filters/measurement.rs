//! Reprojection-based measurement covariance for square markers
//!
//! A marker detection is really 4 pixel corners. The filter only estimates
//! the marker translation, so the 8-dimensional corner uncertainty is folded
//! into an equivalent 3×3 translation covariance by first-order propagation:
//!
//! ```text
//! R_eq = σ_p² · (JᵀJ)⁻¹
//! ```
//!
//! where J (8×3) stacks, for each corner, the translation block of the
//! Jacobian of `pixel(K · (C_R_M · c + C_t_M))`.

use nalgebra::{Matrix3, Rotation3, Vector3};

use crate::error::MeasurementError;
use crate::frames::skew;
use crate::types::{
    Detection, MeasurementCov, PixelJacobian, ProjectionJacobian, StackedJacobian, CORNER_COUNT,
};

/// Assumed isotropic corner detection noise [px]
pub const DEFAULT_PIXEL_NOISE_STD: f64 = 3.0;

/// Smallest accepted λ_min/λ_max of JᵀJ
pub const DEFAULT_MIN_EIGEN_RATIO: f64 = 1e-12;

const MIN_DEPTH: f64 = 1e-9;

#[derive(Clone, Debug, PartialEq)]
pub struct MeasurementModel {
    /// Marker side length [m]
    pub marker_length: f64,
    /// Corner noise standard deviation [px]
    pub pixel_noise_std: f64,
    pub min_eigen_ratio: f64,
}

impl MeasurementModel {
    pub fn new(marker_length: f64) -> Self {
        Self {
            marker_length,
            pixel_noise_std: DEFAULT_PIXEL_NOISE_STD,
            min_eigen_ratio: DEFAULT_MIN_EIGEN_RATIO,
        }
    }

    /// Corner offsets in the marker frame, z = 0 plane.
    pub fn corner_offsets(&self) -> [Vector3<f64>; CORNER_COUNT] {
        let h = self.marker_length / 2.0;
        [
            Vector3::new(-h, -h, 0.0),
            Vector3::new(h, -h, 0.0),
            Vector3::new(h, h, 0.0),
            Vector3::new(-h, h, 0.0),
        ]
    }

    /// Jacobian of (u, v) = (h₀/h₂, h₁/h₂) wrt the homogeneous point h.
    #[rustfmt::skip]
    pub fn pixel_jacobian(h: &Vector3<f64>) -> PixelJacobian {
        let inv_z = 1.0 / h.z;
        let inv_z2 = inv_z * inv_z;
        PixelJacobian::new(
            inv_z, 0.0, -h.x * inv_z2,
            0.0, inv_z, -h.y * inv_z2,
        )
    }

    /// Jacobian of K·(C_R_M·c + C_t_M) wrt a (translation, small rotation) perturbation.
    pub fn projection_jacobian(
        k: &Matrix3<f64>,
        c_r_m: &Matrix3<f64>,
        corner: &Vector3<f64>,
    ) -> ProjectionJacobian {
        let mut j = ProjectionJacobian::zeros();
        j.fixed_view_mut::<3, 3>(0, 0).copy_from(k);
        j.fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(-(k * c_r_m * skew(corner))));
        j
    }

    /// 8×3 stacked translation Jacobian over the 4 corners.
    pub fn stacked_jacobian(
        &self,
        k: &Matrix3<f64>,
        c_r_m: &Matrix3<f64>,
        c_t_m: &Vector3<f64>,
    ) -> Result<StackedJacobian, MeasurementError> {
        if !self.marker_length.is_finite() || self.marker_length <= 0.0 {
            return Err(MeasurementError::InvalidMarkerLength(self.marker_length));
        }

        let mut stacked = StackedJacobian::zeros();
        for (i, corner) in self.corner_offsets().iter().enumerate() {
            let h = k * (c_r_m * corner + c_t_m);
            if h.z.is_nan() || h.z <= MIN_DEPTH {
                return Err(MeasurementError::DegenerateProjection {
                    corner: i,
                    depth: h.z,
                });
            }

            let full = Self::pixel_jacobian(&h) * Self::projection_jacobian(k, c_r_m, corner);
            stacked
                .fixed_view_mut::<2, 3>(2 * i, 0)
                .copy_from(&full.fixed_view::<2, 3>(0, 0));
        }

        Ok(stacked)
    }

    /// Equivalent translation covariance σ_p² · (JᵀJ)⁻¹.
    pub fn translation_covariance(
        &self,
        k: &Matrix3<f64>,
        c_r_m: &Matrix3<f64>,
        c_t_m: &Vector3<f64>,
    ) -> Result<MeasurementCov, MeasurementError> {
        let j = self.stacked_jacobian(k, c_r_m, c_t_m)?;
        let information = j.transpose() * j;

        if information.iter().any(|v| !v.is_finite()) {
            return Err(MeasurementError::IllConditioned { ratio: f64::NAN });
        }

        let eigenvalues = information.symmetric_eigen().eigenvalues;
        let max = eigenvalues.max();
        let min = eigenvalues.min();
        let ratio = if max > 0.0 { min / max } else { 0.0 };
        if ratio.is_nan() || ratio < self.min_eigen_ratio {
            return Err(MeasurementError::IllConditioned { ratio });
        }

        let inverse = information
            .try_inverse()
            .ok_or(MeasurementError::IllConditioned { ratio })?;
        let sigma2 = self.pixel_noise_std * self.pixel_noise_std;
        let cov = inverse * sigma2;

        Ok((cov + cov.transpose()) * 0.5)
    }

    /// Covariance for a detection, converting its Rodrigues vector first.
    pub fn detection_covariance(
        &self,
        k: &Matrix3<f64>,
        detection: &Detection,
    ) -> Result<MeasurementCov, MeasurementError> {
        let c_r_m = Rotation3::from_scaled_axis(detection.rotation_vector()).into_inner();
        self.translation_covariance(k, &c_r_m, &detection.translation())
    }
}
