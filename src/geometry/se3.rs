//! SE3: 6-DOF rigid transformation (rotation + translation).
//!
//! Poses are stored as a unit quaternion plus a translation vector. The log
//! and exp maps are decoupled (translation is not twisted through the
//! rotation), which is the parameterization the pose-graph solver iterates
//! on. The 4-DoF helpers flatten a pose to (x, y, z, yaw) for planar-ish
//! multi-robot estimation where roll and pitch are observable from the IMU.

use nalgebra::{Matrix3, UnitQuaternion, Vector3, Vector6};

use super::angles::normalize_angle;

/// 6-DOF rigid transformation: p' = R * p + t.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transformation.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Construct from rotation and translation.
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from quaternion components (w, x, y, z) and translation.
    pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, translation: Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_quaternion(nalgebra::Quaternion::new(qw, qx, qy, qz));
        Self {
            rotation,
            translation,
        }
    }

    /// Construct a yaw-only pose at (x, y, z).
    pub fn from_xyz_yaw(x: f64, y: f64, z: f64, yaw: f64) -> Self {
        Self {
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.0, yaw),
            translation: Vector3::new(x, y, z),
        }
    }

    /// Inverse transformation: T^{-1} = [R^T | -R^T t].
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Compose two transforms: self ∘ other.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Transform a single point: p' = R * p + t.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Relative transform from `a` to `b`: T_ab = T_a^{-1} * T_b.
    pub fn delta(a: &SE3, b: &SE3) -> Self {
        a.inverse().compose(b)
    }

    /// Yaw-flattened relative transform from `a` to `b`.
    ///
    /// The translation is expressed in the yaw-only frame of `a` and the
    /// rotation keeps only the wrapped yaw difference, so the result is a
    /// valid 4-DoF measurement even when `a` and `b` carry roll/pitch.
    pub fn delta_4dof(a: &SE3, b: &SE3) -> Self {
        let yaw_a = a.yaw();
        let dyaw = normalize_angle(b.yaw() - yaw_a);
        let dp = UnitQuaternion::from_euler_angles(0.0, 0.0, yaw_a).inverse()
            * (b.translation - a.translation);
        Self {
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.0, dyaw),
            translation: dp,
        }
    }

    /// Yaw angle of the rotation.
    pub fn yaw(&self) -> f64 {
        self.rotation.euler_angles().2
    }

    /// Attitude with roll and pitch stripped.
    pub fn att_yaw_only(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::from_euler_angles(0.0, 0.0, self.yaw())
    }

    /// Rotation as a 3x3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Log map: [translation (3), rotation_vec (3)].
    ///
    /// Decoupled tangent coordinates, matching the layout of the 6x6
    /// information matrices (position block first, rotation block second).
    pub fn log(&self) -> Vector6<f64> {
        let rot_vec = self.rotation.scaled_axis();
        Vector6::new(
            self.translation.x,
            self.translation.y,
            self.translation.z,
            rot_vec.x,
            rot_vec.y,
            rot_vec.z,
        )
    }

    /// Exponential map: construct from [translation (3), rotation_vec (3)].
    pub fn exp(tangent: &Vector6<f64>) -> Self {
        let translation = Vector3::new(tangent[0], tangent[1], tangent[2]);
        let rotation = UnitQuaternion::from_scaled_axis(Vector3::new(
            tangent[3], tangent[4], tangent[5],
        ));
        Self {
            rotation,
            translation,
        }
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}
