//! SO(3) exponential and log maps.
//!
//! Thin wrappers over the quaternion scaled-axis maps, named so factor and
//! manifold code reads as the math it implements.

use nalgebra::{UnitQuaternion, Vector3};

/// Exponential map of so(3): rotation-vector to unit quaternion.
#[inline]
pub fn exp_so3(phi: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*phi)
}

/// Log map of SO(3): unit quaternion to rotation-vector.
#[inline]
pub fn log_so3(q: &UnitQuaternion<f64>) -> Vector3<f64> {
    q.scaled_axis()
}
