//! Goniometer axes.
//!
//! The original implementation models axes through a deep `Axis ->
//! RotAxis/TransAxis` inheritance hierarchy (see
//! `examples/original_source/instrument/include/Axis.h`). Per `spec.md` §9
//! ("Deep inheritance (Axis -> RotAxis/TransAxis)") this collapses to a
//! closed sum type with a free function computing the homogeneous transform,
//! rather than virtual dispatch.

use super::{Matrix3, Vector3};
use nalgebra::{Matrix4, Rotation3, Unit};

/// A single goniometer axis: either a rotation about a fixed direction
/// (by some angle, in radians) or a translation along a fixed direction
/// (by some offset).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Axis {
    Rot { dir: Vector3, offset: f64 },
    Trans { dir: Vector3, offset: f64 },
}

impl Axis {
    pub fn rotation(dir: Vector3, offset: f64) -> Self {
        Axis::Rot {
            dir: dir.normalize(),
            offset,
        }
    }

    pub fn translation(dir: Vector3, offset: f64) -> Self {
        Axis::Trans {
            dir: dir.normalize(),
            offset,
        }
    }

    /// The value this axis takes: `offset` for a translation axis, or
    /// `offset` radians for a rotation axis. `value` is the externally
    /// supplied scan coordinate (e.g. omega at a given frame); the final
    /// applied value is `offset + value`.
    pub fn homogeneous(&self, value: f64) -> Matrix4<f64> {
        match *self {
            Axis::Rot { dir, offset } => {
                let axis = Unit::new_normalize(dir);
                let rot = Rotation3::from_axis_angle(&axis, offset + value);
                rot.to_homogeneous()
            }
            Axis::Trans { dir, offset } => {
                let t = dir * (offset + value);
                Matrix4::new_translation(&t)
            }
        }
    }

    pub fn rotation_matrix(&self, value: f64) -> Matrix3 {
        self.homogeneous(value).fixed_view::<3, 3>(0, 0).into_owned()
    }
}

/// The free `homogeneous(value) -> 4x4` function named directly in
/// `spec.md` §9, for call sites that hold an `Axis` by value rather than
/// calling the method.
pub fn homogeneous(axis: &Axis, value: f64) -> Matrix4<f64> {
    axis.homogeneous(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rotation_axis_preserves_length() {
        let axis = Axis::rotation(Vector3::z(), 0.0);
        let h = axis.homogeneous(std::f64::consts::FRAC_PI_2);
        let r = h.fixed_view::<3, 3>(0, 0).into_owned();
        let v = Vector3::new(1.0, 0.0, 0.0);
        let rotated = r * v;
        assert_relative_eq!(rotated.norm(), v.norm(), epsilon = 1e-9);
        assert_relative_eq!(rotated.y, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn translation_axis_offsets_by_value_plus_offset() {
        let axis = Axis::translation(Vector3::x(), 1.0);
        let h = axis.homogeneous(2.0);
        let t = h.fixed_view::<3, 1>(0, 3).into_owned();
        assert_relative_eq!(t.x, 3.0, epsilon = 1e-9);
    }
}
