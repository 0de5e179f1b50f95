pub mod linalg;

pub use linalg::*;

use chrono::Utc;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Marker identity as decoded by the detector.
pub type TagId = i32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub sec: i64,
    pub nsec: u32,
}

impl Timestamp {
    pub fn new(sec: i64, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    /// Wall-clock time, UTC.
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            sec: now.timestamp(),
            nsec: now.timestamp_subsec_nanos(),
        }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + self.nsec as f64 * 1e-9
    }
}

/// Camera-to-body mounting as read from the extrinsics stream.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Extrinsics {
    /// Camera origin in body frame (tx, ty, tz) [m]
    pub translation: [f64; 3],
    /// (roll, pitch, yaw) [rad], composed as Rz(yaw)·Ry(pitch)·Rx(roll)
    pub rotation: [f64; 3],
}

impl Extrinsics {
    pub fn identity() -> Self {
        Self {
            translation: [0.0; 3],
            rotation: [0.0; 3],
        }
    }
}

/// Pinhole intrinsics.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub skew: f64,
}

impl Intrinsics {
    #[rustfmt::skip]
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, self.skew, self.cx,
            0.0, self.fy, self.cy,
            0.0, 0.0, 1.0,
        )
    }
}

impl Default for Intrinsics {
    fn default() -> Self {
        // 640×480 sensor, ~60° horizontal field of view
        Self {
            fx: 554.0,
            fy: 554.0,
            cx: 320.0,
            cy: 240.0,
            skew: 0.0,
        }
    }
}

/// Attitude quaternion (w, x, y, z). Expected to be unit norm.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attitude {
    pub qw: f64,
    pub qx: f64,
    pub qy: f64,
    pub qz: f64,
}

impl Default for Attitude {
    fn default() -> Self {
        Self {
            qw: 1.0,
            qx: 0.0,
            qy: 0.0,
            qz: 0.0,
        }
    }
}

/// Vehicle odometry sample for one control cycle.
///
/// Covariances use the symmetric upper-triangle packing
/// `[xx, xy, yy, xz, yz, zz]`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    /// Body origin in world frame [m]
    pub position: [f64; 3],
    pub attitude: Attitude,
    /// Linear velocity [m/s], rotated into body axes by the inverse attitude before use
    pub velocity: [f64; 3],
    /// Angular velocity [rad/s]
    pub angular_velocity: [f64; 3],
    #[serde(default)]
    pub velocity_cov: [f64; 6],
    #[serde(default)]
    pub angular_velocity_cov: [f64; 6],
}

impl VehicleState {
    /// Twist as (vx, vy, vz, wx, wy, wz).
    pub fn twist(&self) -> Twist {
        let v = &self.velocity;
        let w = &self.angular_velocity;
        Twist::from_column_slice(&[v[0], v[1], v[2], w[0], w[1], w[2]])
    }
}

/// Unpack a symmetric 3×3 matrix from its 6 upper-triangle entries.
#[rustfmt::skip]
pub fn unpack_symmetric(c: &[f64; 6]) -> Matrix3<f64> {
    Matrix3::new(
        c[0], c[1], c[3],
        c[1], c[2], c[4],
        c[3], c[4], c[5],
    )
}

/// Single-cycle marker observation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: TagId,
    /// Marker origin in camera frame [m]
    pub translation: [f64; 3],
    /// Marker orientation in camera frame, Rodrigues vector [rad]
    pub rotation: [f64; 3],
}

impl Detection {
    pub fn new(id: TagId, translation: [f64; 3], rotation: [f64; 3]) -> Self {
        Self {
            id,
            translation,
            rotation,
        }
    }

    pub fn translation(&self) -> Vector3<f64> {
        Vector3::from(self.translation)
    }

    pub fn rotation_vector(&self) -> Vector3<f64> {
        Vector3::from(self.rotation)
    }

    /// Translation followed by Rodrigues vector.
    pub fn raw_measurement(&self) -> RawMeasurement {
        let t = &self.translation;
        let r = &self.rotation;
        RawMeasurement::from_column_slice(&[t[0], t[1], t[2], r[0], r[1], r[2]])
    }
}

/// World-frame estimate handed to the publisher.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TagPose {
    pub id: TagId,
    pub position: [f64; 3],
    pub timestamp: Timestamp,
}

impl TagPose {
    /// Per-identity port key.
    pub fn key(&self) -> String {
        self.id.to_string()
    }
}
