//! Linear algebra type system for the marker tracker
//!
//! Fixed-size aliases so every filter and transform gets compile-time
//! dimension checking.

use nalgebra::{SMatrix, SVector};

// ===== State Dimensions =====
pub const STATE_DIM: usize = 3; // tag position (x, y, z) in camera frame
pub const CONTROL_DIM: usize = 6; // twist (vx, vy, vz, wx, wy, wz)

// ===== Measurement Dimensions =====
pub const MEASURE_DIM: usize = 3; // translation only, rotation is not estimated
pub const CORNER_COUNT: usize = 4;
pub const STACKED_ROWS: usize = 2 * CORNER_COUNT; // (u, v) per corner

// ===== Filter Types =====
pub type StateVec = SVector<f64, STATE_DIM>;
pub type StateCov = SMatrix<f64, STATE_DIM, STATE_DIM>;
pub type Twist = SVector<f64, CONTROL_DIM>;
pub type TwistTransform = SMatrix<f64, CONTROL_DIM, CONTROL_DIM>; // 6×6
pub type ControlMatrix = SMatrix<f64, STATE_DIM, CONTROL_DIM>; // 3×6

// Raw detection buffer: translation followed by Rodrigues vector
pub type RawMeasurement = SVector<f64, 6>;
pub type MeasurementCov = SMatrix<f64, MEASURE_DIM, MEASURE_DIM>;

// ===== Jacobian Types =====
pub type PixelJacobian = SMatrix<f64, 2, 3>; // homogeneous divide
pub type ProjectionJacobian = SMatrix<f64, 3, 6>; // wrt (translation, rotation)
pub type StackedJacobian = SMatrix<f64, STACKED_ROWS, MEASURE_DIM>; // 8×3
