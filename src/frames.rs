//! Frame transforms between camera (C), body (B) and world (W).
//!
//! Naming follows `X_R_Y` / `X_t_Y`: rotation and translation expressing
//! frame Y in frame X, so that `p_X = X_R_Y · p_Y + X_t_Y`.

use nalgebra::{Matrix3, Vector3};

use crate::types::{Attitude, Extrinsics, Intrinsics, Twist, TwistTransform, VehicleState};

/// Skew-symmetric matrix [v]× such that [v]× u = v × u.
#[inline]
#[rustfmt::skip]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Rotation matrix R = Rz(yaw)·Ry(pitch)·Rx(roll).
#[rustfmt::skip]
pub fn rotation_from_rpy(roll: f64, pitch: f64, yaw: f64) -> Matrix3<f64> {
    let (sr, cr) = roll.sin_cos();
    let (sp, cp) = pitch.sin_cos();
    let (sy, cy) = yaw.sin_cos();

    Matrix3::new(
        cp * cy, sr * sp * cy - cr * sy, cr * sp * cy + sr * sy,
        cp * sy, sr * sp * sy + cr * cy, cr * sp * sy - sr * cy,
        -sp, sr * cp, cr * cp,
    )
}

/// Rotation matrix from a unit quaternion. No renormalization is applied.
pub fn rotation_from_quaternion(q: &Attitude) -> Matrix3<f64> {
    let (qw, qx, qy, qz) = (q.qw, q.qx, q.qy, q.qz);

    Matrix3::new(
        1.0 - 2.0 * (qy * qy + qz * qz),
        2.0 * (qx * qy - qz * qw),
        2.0 * (qx * qz + qy * qw),
        2.0 * (qx * qy + qz * qw),
        1.0 - 2.0 * (qx * qx + qz * qz),
        2.0 * (qy * qz - qx * qw),
        2.0 * (qx * qz - qy * qw),
        2.0 * (qy * qz + qx * qw),
        1.0 - 2.0 * (qx * qx + qy * qy),
    )
}

/// 6×6 twist transform built from the (R, t) pair of the opposite direction.
///
/// ```text
/// [ Rᵀ  [t]× ]  [ v ]
/// [ 0    Rᵀ  ]  [ ω ]
/// ```
pub fn twist_transform(r: &Matrix3<f64>, t: &Vector3<f64>) -> TwistTransform {
    let r_t = r.transpose();
    let mut m = TwistTransform::zeros();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(&r_t);
    m.fixed_view_mut::<3, 3>(3, 3).copy_from(&r_t);
    m.fixed_view_mut::<3, 3>(0, 3).copy_from(&skew(t));
    m
}

/// Block-diagonal twist rotation with `r` on both blocks.
pub fn rotation_twist_transform(r: &Matrix3<f64>) -> TwistTransform {
    let mut m = TwistTransform::zeros();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(r);
    m.fixed_view_mut::<3, 3>(3, 3).copy_from(r);
    m
}

/// Camera intrinsics and the fixed camera mount.
///
/// Rebuilt as a whole whenever new extrinsics arrive.
#[derive(Clone, Debug, PartialEq)]
pub struct Calibration {
    /// Intrinsic matrix
    pub k: Matrix3<f64>,
    /// Camera orientation in body frame
    pub b_r_c: Matrix3<f64>,
    /// Camera origin in body frame
    pub b_t_c: Vector3<f64>,
    /// Body twist → camera twist
    pub c_t_b: TwistTransform,
}

impl Calibration {
    pub fn new(intrinsics: &Intrinsics, extrinsics: &Extrinsics) -> Self {
        let [roll, pitch, yaw] = extrinsics.rotation;
        let b_r_c = rotation_from_rpy(roll, pitch, yaw);
        let b_t_c = Vector3::from(extrinsics.translation);

        Self {
            k: intrinsics.matrix(),
            c_t_b: twist_transform(&b_r_c, &b_t_c),
            b_r_c,
            b_t_c,
        }
    }

    /// Fresh calibration with the same intrinsics and a new mount.
    pub fn with_extrinsics(&self, extrinsics: &Extrinsics) -> Self {
        let [roll, pitch, yaw] = extrinsics.rotation;
        let b_r_c = rotation_from_rpy(roll, pitch, yaw);
        let b_t_c = Vector3::from(extrinsics.translation);

        Self {
            k: self.k,
            c_t_b: twist_transform(&b_r_c, &b_t_c),
            b_r_c,
            b_t_c,
        }
    }

    pub fn camera_to_body(&self, p_c: &Vector3<f64>) -> Vector3<f64> {
        self.b_r_c * p_c + self.b_t_c
    }

    pub fn body_to_camera(&self, p_b: &Vector3<f64>) -> Vector3<f64> {
        self.b_r_c.transpose() * (p_b - self.b_t_c)
    }
}

/// Vehicle pose in world frame for the current cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct VehiclePose {
    pub w_r_b: Matrix3<f64>,
    pub w_t_b: Vector3<f64>,
}

impl VehiclePose {
    pub fn from_state(state: &VehicleState) -> Self {
        Self {
            w_r_b: rotation_from_quaternion(&state.attitude),
            w_t_b: Vector3::from(state.position),
        }
    }

    pub fn body_to_world(&self, p_b: &Vector3<f64>) -> Vector3<f64> {
        self.w_r_b * p_b + self.w_t_b
    }

    pub fn world_to_body(&self, p_w: &Vector3<f64>) -> Vector3<f64> {
        self.w_r_b.transpose() * (p_w - self.w_t_b)
    }

    /// B_T_W: rotates a world-axes twist into body axes.
    pub fn inverse_twist_transform(&self) -> TwistTransform {
        rotation_twist_transform(&self.w_r_b.transpose())
    }
}

/// Vehicle twist re-expressed in the camera frame: C_T_B · B_T_W · twist.
pub fn camera_twist(calib: &Calibration, pose: &VehiclePose, twist: &Twist) -> Twist {
    calib.c_t_b * pose.inverse_twist_transform() * twist
}

/// W_R_B · (B_R_C · p + B_t_C) + W_t_B
pub fn camera_to_world(
    calib: &Calibration,
    pose: &VehiclePose,
    p_c: &Vector3<f64>,
) -> Vector3<f64> {
    pose.body_to_world(&calib.camera_to_body(p_c))
}

pub fn world_to_camera(
    calib: &Calibration,
    pose: &VehiclePose,
    p_w: &Vector3<f64>,
) -> Vector3<f64> {
    calib.body_to_camera(&pose.world_to_body(p_w))
}
