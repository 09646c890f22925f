use crate::geometry::rotation::Axis;
use crate::geometry::{Matrix3, Vector3};
use nalgebra::Matrix4;

/// A stack of goniometer axes (e.g. omega, chi, phi for the sample circle;
/// a single rotation+offset for a two-circle detector arm). Composing them
/// in order gives the total transform for a given set of axis values.
///
/// Collapses the original's `IGonio`/`Gonio` class hierarchy into data plus
/// a free composition function, per `spec.md` §9.
#[derive(Debug, Clone)]
pub struct Gonio {
    axes: Vec<Axis>,
}

impl Gonio {
    pub fn new(axes: Vec<Axis>) -> Self {
        Self { axes }
    }

    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    /// Compose the homogeneous transform for the given per-axis values,
    /// applied innermost-first (the first axis in the list is closest to
    /// the sample/detector).
    pub fn transform(&self, values: &[f64]) -> Matrix4<f64> {
        assert_eq!(values.len(), self.axes.len(), "one value per axis");
        let mut m = Matrix4::identity();
        for (axis, &value) in self.axes.iter().zip(values) {
            m *= axis.homogeneous(value);
        }
        m
    }

    pub fn rotation(&self, values: &[f64]) -> Matrix3 {
        self.transform(values).fixed_view::<3, 3>(0, 0).into_owned()
    }

    pub fn translation(&self, values: &[f64]) -> Vector3 {
        self.transform(values).fixed_view::<3, 1>(0, 3).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_gonio_is_identity() {
        let g = Gonio::new(vec![]);
        assert_eq!(g.transform(&[]), Matrix4::identity());
    }

    #[test]
    fn single_rotation_axis_matches_direct_call() {
        let axis = Axis::rotation(Vector3::z(), 0.0);
        let g = Gonio::new(vec![axis]);
        assert_eq!(g.transform(&[0.3]), axis.homogeneous(0.3));
    }
}
