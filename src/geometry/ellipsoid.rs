use super::{Aabb3, Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// A 3-D ellipsoid `{x : (x-c)^T M (x-c) <= 1}`, the shape carried by every
/// `Peak3D`. `metric` is `M = Σ⁻¹`, the inverse of the covariance matrix, so
/// that scaling the ellipsoid by a factor `k` (as integration regions do
/// for `peak_end`/`bkg_begin`/`bkg_end`) is `metric / k^2`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ellipsoid {
    center: Vector3,
    metric: Matrix3,
}

impl Ellipsoid {
    /// Construct directly from a centre and inverse-covariance metric.
    pub fn new(center: Vector3, metric: Matrix3) -> Self {
        Self { center, metric }
    }

    /// Construct from a centre and covariance matrix (`Σ`), inverting it.
    /// Returns `None` if `covariance` is not positive-definite (the caller
    /// should treat this as a degenerate blob and discard it, per
    /// `spec.md` §4.1 failure modes).
    pub fn from_covariance(center: Vector3, covariance: Matrix3) -> Option<Self> {
        let chol = nalgebra::linalg::Cholesky::new(covariance)?;
        let metric = chol.inverse();
        Some(Self { center, metric })
    }

    pub fn center(&self) -> Vector3 {
        self.center
    }

    pub fn metric(&self) -> Matrix3 {
        self.metric
    }

    pub fn set_center(&mut self, center: Vector3) {
        self.center = center;
    }

    pub fn set_metric(&mut self, metric: Matrix3) {
        self.metric = metric;
    }

    /// Covariance matrix `Σ = M⁻¹`. `None` if the metric is singular.
    pub fn covariance(&self) -> Option<Matrix3> {
        self.metric.try_inverse()
    }

    /// Squared Mahalanobis distance of `point` from the centre under this
    /// ellipsoid's metric.
    pub fn mahalanobis_sq(&self, point: Vector3) -> f64 {
        let d = point - self.center;
        (d.transpose() * self.metric * d)[(0, 0)]
    }

    pub fn contains(&self, point: Vector3) -> bool {
        self.mahalanobis_sq(point) <= 1.0
    }

    /// Scale the ellipsoid uniformly by `k` (as in peak_end/bkg_begin/
    /// bkg_end scaling of a `Peak3D`'s shape): the semi-axes grow by `k`,
    /// so the metric shrinks by `1/k^2`.
    pub fn scaled(&self, k: f64) -> Ellipsoid {
        Ellipsoid {
            center: self.center,
            metric: self.metric / (k * k),
        }
    }

    /// A conservative axis-aligned bounding box enclosing the ellipsoid,
    /// computed from the semi-axis lengths along each coordinate via the
    /// covariance's diagonal (`sqrt(Σ_ii)`).
    pub fn aabb(&self) -> Option<Aabb3> {
        let cov = self.covariance()?;
        let half = Vector3::new(cov[(0, 0)].sqrt(), cov[(1, 1)].sqrt(), cov[(2, 2)].sqrt());
        Some(Aabb3::new(self.center - half, self.center + half))
    }

    /// Whether two ellipsoids' bounding regions overlap (used by
    /// `IntegrationRegion` overlap-removal). Conservative: tests AABB
    /// overlap rather than exact ellipsoid-ellipsoid intersection.
    pub fn overlaps(&self, other: &Ellipsoid) -> bool {
        match (self.aabb(), other.aabb()) {
            (Some(a), Some(b)) => {
                a.overlaps_2d(&b) && a.lower_frame() <= b.upper_frame() && a.upper_frame() >= b.lower_frame()
            }
            _ => false,
        }
    }
}
