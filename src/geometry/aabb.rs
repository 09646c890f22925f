use super::Vector3;
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in detector-plus-frame space `(px, py, frame)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb3 {
    pub lower: Vector3,
    pub upper: Vector3,
}

impl Aabb3 {
    pub fn new(lower: Vector3, upper: Vector3) -> Self {
        Self { lower, upper }
    }

    pub fn from_points(points: impl IntoIterator<Item = Vector3>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut lower = first;
        let mut upper = first;
        for p in iter {
            lower = lower.zip_map(&p, f64::min);
            upper = upper.zip_map(&p, f64::max);
        }
        Some(Self { lower, upper })
    }

    pub fn center(&self) -> Vector3 {
        (self.lower + self.upper) * 0.5
    }

    pub fn extent(&self) -> Vector3 {
        self.upper - self.lower
    }

    /// 2-D (px, py) bounding box overlap test, ignoring the frame axis.
    /// Used by the peak finder to decide whether two per-frame blobs with
    /// the same connected-component label might be the same 3-D blob.
    pub fn overlaps_2d(&self, other: &Aabb3) -> bool {
        self.lower.x <= other.upper.x
            && self.upper.x >= other.lower.x
            && self.lower.y <= other.upper.y
            && self.upper.y >= other.lower.y
    }

    pub fn contains(&self, p: Vector3) -> bool {
        p.x >= self.lower.x
            && p.x <= self.upper.x
            && p.y >= self.lower.y
            && p.y <= self.upper.y
            && p.z >= self.lower.z
            && p.z <= self.upper.z
    }

    pub fn merge(&self, other: &Aabb3) -> Aabb3 {
        Aabb3 {
            lower: self.lower.zip_map(&other.lower, f64::min),
            upper: self.upper.zip_map(&other.upper, f64::max),
        }
    }

    /// Lower/upper frame (z component) as a convenience, since the peak
    /// finder and integration region track frame spans explicitly.
    pub fn lower_frame(&self) -> f64 {
        self.lower.z
    }

    pub fn upper_frame(&self) -> f64 {
        self.upper.z
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_2d_ignores_frame_axis() {
        let a = Aabb3::new(Vector3::new(0.0, 0.0, 0.0), Vector3::new(10.0, 10.0, 1.0));
        let b = Aabb3::new(Vector3::new(5.0, 5.0, 50.0), Vector3::new(15.0, 15.0, 51.0));
        assert!(a.overlaps_2d(&b));

        let c = Aabb3::new(Vector3::new(20.0, 20.0, 0.0), Vector3::new(30.0, 30.0, 1.0));
        assert!(!a.overlaps_2d(&c));
    }

    #[test]
    fn merge_grows_to_contain_both() {
        let a = Aabb3::new(Vector3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 1.0, 1.0));
        let b = Aabb3::new(Vector3::new(-1.0, 2.0, 0.5), Vector3::new(0.5, 3.0, 2.0));
        let m = a.merge(&b);
        assert_eq!(m.lower, Vector3::new(-1.0, 0.0, 0.0));
        assert_eq!(m.upper, Vector3::new(1.0, 3.0, 2.0));
    }
}
