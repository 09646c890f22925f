//! The peak entity: shape, rejection flags, sum/profile intensities,
//! unit-cell binding and Miller index cache (component D of
//! `SPEC_FULL.md` §3).

use crate::geometry::Ellipsoid;
use serde::{Deserialize, Serialize};

/// Opaque handles into the arenas owned by `experiment::handlers`
/// (`SPEC_FULL.md` §9 redesign: arena-plus-index replacing the original's
/// shared-pointer cycles). A peak stores these instead of owning or
/// strongly referencing the `DataSet`/`UnitCell` it belongs to.
pub type DataSetId = u64;
pub type CellId = u64;
pub type PeakId = u64;

/// Reasons a peak can be excluded from downstream stages. Ordered by
/// severity, strictly increasing left to right; a later integrator in the
/// same pass may only overwrite an existing flag with one that is later
/// in this list ("first-failure-wins", but ties in severity keep the
/// first write).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RejectionFlag {
    NotRejected,
    TooFewNeighbours,
    TooFewPoints,
    NoProfile,
    SaturatedPixel,
    InvalidSigma,
    IntegrationFailure,
    InvalidRegion,
    PredictionUpdateFailure,
    MaskedByUser,
    OverlapRemoved,
}

impl Default for RejectionFlag {
    fn default() -> Self {
        RejectionFlag::NotRejected
    }
}

/// A sum- or profile-integrated intensity estimate: value, its standard
/// error, and the derived strength (`value / sigma`, `0.0` when
/// `sigma <= 0`).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Intensity {
    pub value: f64,
    pub sigma: f64,
}

impl Intensity {
    pub fn new(value: f64, sigma: f64) -> Self {
        Self { value, sigma }
    }

    pub fn strength(&self) -> f64 {
        if self.sigma > 0.0 {
            self.value / self.sigma
        } else {
            0.0
        }
    }

    pub fn is_valid(&self) -> bool {
        self.sigma.is_finite() && self.sigma > 0.0 && self.value.is_finite()
    }
}

/// A single found, predicted or library peak: its 3-D ellipsoidal shape
/// in (px, py, frame) coordinates, weak references to the dataset and
/// (optionally) unit cell it belongs to, integrated intensities, and
/// bookkeeping flags.
///
/// Invariant: once `flag != NotRejected`, `enabled()` is `false`; the flag
/// is written at most-severity-wins within a single integration pass (see
/// [`RejectionFlag`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peak3D {
    pub shape: Ellipsoid,
    pub dataset: DataSetId,
    pub cell: Option<CellId>,
    pub sum_intensity: Intensity,
    pub profile_intensity: Intensity,
    pub mean_background: f64,
    pub background_gradient: f64,
    /// Per-frame intensity across the peak's frame extent (the "rocking
    /// curve").
    pub rocking_curve: Vec<f64>,
    pub miller_index: Option<(i32, i32, i32)>,
    /// Continuous `(h, k, l)` before rounding, kept for residual
    /// diagnostics.
    pub hkl_residual: f64,
    pub flag: RejectionFlag,
    pub selected: bool,
}

impl Peak3D {
    pub fn new(shape: Ellipsoid, dataset: DataSetId) -> Self {
        Self {
            shape,
            dataset,
            cell: None,
            sum_intensity: Intensity::default(),
            profile_intensity: Intensity::default(),
            mean_background: 0.0,
            background_gradient: 0.0,
            rocking_curve: Vec::new(),
            miller_index: None,
            hkl_residual: f64::INFINITY,
            flag: RejectionFlag::NotRejected,
            selected: true,
        }
    }

    pub fn enabled(&self) -> bool {
        self.selected && self.flag == RejectionFlag::NotRejected
    }

    /// Sets the rejection flag if `new_flag` is strictly more severe than
    /// the current one (or the current one is `NotRejected`). Enforces
    /// the first-failure-wins/monotone-severity invariant so callers
    /// never need to check before calling.
    pub fn reject(&mut self, new_flag: RejectionFlag) {
        if new_flag > self.flag {
            self.flag = new_flag;
        }
    }

    pub fn center(&self) -> crate::geometry::Vector3 {
        self.shape.center()
    }

    pub fn frame(&self) -> f64 {
        self.shape.center().z
    }
}

/// What produced the peaks in a collection; immutable once the
/// collection has been populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeakCollectionKind {
    Found,
    Predicted,
    Indexing,
}

/// A named, typed, ordered list of peaks, plus the derived beam-divergence
/// (`sigma_d`) and mosaicity (`sigma_m`) estimates computed from their
/// shapes in the Kabsch coordinate system once a shape model has been
/// built from this collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeakCollection {
    pub name: String,
    pub kind: PeakCollectionKind,
    peaks: Vec<Peak3D>,
    pub indexed: bool,
    pub integrated: bool,
    pub has_bkg_gradient: bool,
    pub sigma_d: Option<f64>,
    pub sigma_m: Option<f64>,
}

impl PeakCollection {
    pub fn new(name: impl Into<String>, kind: PeakCollectionKind) -> Self {
        Self {
            name: name.into(),
            kind,
            peaks: Vec::new(),
            indexed: false,
            integrated: false,
            has_bkg_gradient: false,
            sigma_d: None,
            sigma_m: None,
        }
    }

    pub fn push(&mut self, peak: Peak3D) {
        self.peaks.push(peak);
    }

    pub fn peaks(&self) -> &[Peak3D] {
        &self.peaks
    }

    pub fn peaks_mut(&mut self) -> &mut [Peak3D] {
        &mut self.peaks
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &Peak3D> {
        self.peaks.iter().filter(|p| p.enabled())
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled().count()
    }

    /// The divergence/mosaicity pair computed from each enabled peak's
    /// covariance, averaged over the collection. Populated by the shape
    /// model builder; this is a plain setter, the estimation logic lives
    /// there.
    pub fn set_kabsch_sigmas(&mut self, sigma_d: f64, sigma_m: f64) {
        self.sigma_d = Some(sigma_d);
        self.sigma_m = Some(sigma_m);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Vector3;

    fn peak() -> Peak3D {
        let shape = Ellipsoid::new(Vector3::new(10.0, 10.0, 0.0), crate::geometry::Matrix3::identity());
        Peak3D::new(shape, 1)
    }

    #[test]
    fn fresh_peak_is_enabled() {
        let p = peak();
        assert!(p.enabled());
        assert_eq!(p.flag, RejectionFlag::NotRejected);
    }

    #[test]
    fn reject_disables_peak() {
        let mut p = peak();
        p.reject(RejectionFlag::SaturatedPixel);
        assert!(!p.enabled());
    }

    #[test]
    fn reject_is_monotone_by_severity() {
        let mut p = peak();
        p.reject(RejectionFlag::IntegrationFailure);
        p.reject(RejectionFlag::TooFewPoints);
        assert_eq!(p.flag, RejectionFlag::IntegrationFailure);
        p.reject(RejectionFlag::OverlapRemoved);
        assert_eq!(p.flag, RejectionFlag::OverlapRemoved);
    }

    #[test]
    fn intensity_strength_is_zero_for_nonpositive_sigma() {
        let i = Intensity::new(100.0, 0.0);
        assert_eq!(i.strength(), 0.0);
    }

    #[test]
    fn collection_enabled_count_excludes_rejected() {
        let mut collection = PeakCollection::new("found", PeakCollectionKind::Found);
        collection.push(peak());
        let mut rejected = peak();
        rejected.reject(RejectionFlag::InvalidRegion);
        collection.push(rejected);
        assert_eq!(collection.len(), 2);
        assert_eq!(collection.enabled_count(), 1);
    }
}
