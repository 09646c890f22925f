//! Shape model: mean peak profile as a function of detector/Kabsch
//! position, used both to assign shapes to predicted peaks and to drive
//! profile-fit integration (component I of `SPEC_FULL.md` §4.5).

use crate::dataset::DataSet;
use crate::geometry::{Matrix3, Vector3};
use crate::integration::region::{IntegrationRegion, RegionType};
use crate::peak::{Peak3D, PeakCollection};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterpolationMode {
    None,
    InverseDistance,
    Intensity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShapeCoordinates {
    Detector,
    Kabsch,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShapeModelParameters {
    pub n_subdiv: usize,
    pub nbins_x: usize,
    pub nbins_y: usize,
    pub nbins_z: usize,
    pub neighbour_range_pixels: f64,
    pub neighbour_range_frames: f64,
    pub min_neighbors: usize,
    pub interpolation: InterpolationMode,
    pub coordinates: ShapeCoordinates,
    pub peak_end: f64,
    pub bkg_begin: f64,
    pub bkg_end: f64,
}

impl Default for ShapeModelParameters {
    fn default() -> Self {
        Self {
            n_subdiv: 1,
            nbins_x: 20,
            nbins_y: 20,
            nbins_z: 20,
            neighbour_range_pixels: 500.0,
            neighbour_range_frames: 10.0,
            min_neighbors: 10,
            interpolation: InterpolationMode::InverseDistance,
            coordinates: ShapeCoordinates::Detector,
            peak_end: 3.0,
            bkg_begin: 3.0,
            bkg_end: 6.0,
        }
    }
}

/// A 3-D histogram profile on a regular grid plus a 1-D radial integrated
/// profile, both built over the neighbourhood of one reference peak.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub nbins_x: usize,
    pub nbins_y: usize,
    pub nbins_z: usize,
    histogram: Vec<f64>,
    pub radial: Vec<f64>,
    pub covariance: Matrix3,
}

impl Profile {
    fn new(params: &ShapeModelParameters, covariance: Matrix3) -> Self {
        Self {
            nbins_x: params.nbins_x,
            nbins_y: params.nbins_y,
            nbins_z: params.nbins_z,
            histogram: vec![0.0; params.nbins_x * params.nbins_y * params.nbins_z],
            radial: vec![0.0; params.nbins_x],
            covariance,
        }
    }

    fn bin_index(&self, ix: usize, iy: usize, iz: usize) -> usize {
        (iz * self.nbins_y + iy) * self.nbins_x + ix
    }

    pub fn accumulate(&mut self, local: Vector3, weight: f64) {
        let to_bin = |v: f64, n: usize| -> Option<usize> {
            let b = ((v + 1.0) * 0.5 * n as f64) as i64;
            if b >= 0 && (b as usize) < n {
                Some(b as usize)
            } else {
                None
            }
        };
        if let (Some(ix), Some(iy), Some(iz)) = (
            to_bin(local.x, self.nbins_x),
            to_bin(local.y, self.nbins_y),
            to_bin(local.z, self.nbins_z),
        ) {
            let idx = self.bin_index(ix, iy, iz);
            self.histogram[idx] += weight;
            let r_bin = ((local.norm() * self.nbins_x as f64) as usize).min(self.nbins_x - 1);
            self.radial[r_bin] += weight;
        }
    }

    pub fn density_at(&self, ix: usize, iy: usize, iz: usize) -> f64 {
        self.histogram[self.bin_index(ix, iy, iz)]
    }

    /// The histogram normalised to sum to one, the form the profile
    /// integrators (`Profile3D`/`Profile1D`) consume as `p_i`.
    pub fn normalized(&self) -> Vec<f64> {
        let total: f64 = self.histogram.iter().sum();
        if total <= 0.0 {
            return self.histogram.clone();
        }
        self.histogram.iter().map(|v| v / total).collect()
    }
}

/// One entry in the built model: the source peak's centre (used for
/// neighbour queries) plus its accumulated profile.
struct ShapeEntry {
    center: Vector3,
    strength: f64,
    profile: Profile,
}

/// Map from reference peaks to profile records, queried by position to
/// find the mean profile/covariance near a detector event.
pub struct ShapeModel {
    entries: Vec<ShapeEntry>,
    params: ShapeModelParameters,
    pub sigma_d: f64,
    pub sigma_m: f64,
}

impl ShapeModel {
    /// Builds a model from the enabled peaks of `collection`, filtering
    /// first by strength, then, for each surviving peak, scanning its own
    /// `IntegrationRegion(peak_end, bkg_begin, bkg_end)` over `dataset`
    /// and accumulating every background-subtracted peak-region pixel
    /// (recentred into local coordinates scaled by `peak_end`'s semi-axes,
    /// each pixel split into `n_subdiv × n_subdiv` sub-samples) into the
    /// peak's own profile entry.
    pub fn build(dataset: &DataSet, collection: &PeakCollection, params: ShapeModelParameters, strength_min: f64) -> Self {
        let mut entries = Vec::new();
        let mut sigma_d_acc = 0.0;
        let mut sigma_m_acc = 0.0;
        let mut n = 0.0;

        for peak in collection.enabled() {
            let strength = peak.sum_intensity.strength();
            if strength < strength_min {
                continue;
            }
            let covariance = match peak.shape.covariance() {
                Some(c) => c,
                None => continue,
            };
            if dataset.is_empty() {
                continue;
            }

            let mut region = IntegrationRegion::new(peak, params.peak_end, params.bkg_begin, params.bkg_end, RegionType::VariableEllipsoid);
            let lo = region.peak_bbox_lower_frame().max(0) as usize;
            let hi = (region.peak_bbox_upper_frame().max(0) as usize).min(dataset.len() - 1);
            for frame_index in lo..=hi.max(lo) {
                region.update_frame(dataset, frame_index);
            }

            let bkg_counts: Vec<f64> = region.data.background_events().map(|e| e.count as f64).collect();
            let mean_bkg = if bkg_counts.is_empty() {
                0.0
            } else {
                bkg_counts.iter().sum::<f64>() / bkg_counts.len() as f64
            };

            let mut profile = Profile::new(&params, covariance);
            let center = peak.center();
            let semi = Vector3::new(
                (covariance[(0, 0)].max(1e-9) * params.peak_end * params.peak_end).sqrt(),
                (covariance[(1, 1)].max(1e-9) * params.peak_end * params.peak_end).sqrt(),
                (covariance[(2, 2)].max(1e-9) * params.peak_end * params.peak_end).sqrt(),
            );
            let sub = params.n_subdiv.max(1);
            for event in region.data.peak_events() {
                let weight = (event.count as f64 - mean_bkg).max(0.0);
                if weight <= 0.0 {
                    continue;
                }
                let delta = Vector3::new(event.px, event.py, event.frame) - center;
                let local = Vector3::new(delta.x / semi.x, delta.y / semi.y, delta.z / semi.z);
                let share = weight / (sub * sub) as f64;
                for i in 0..sub {
                    for j in 0..sub {
                        let ox = ((i as f64 + 0.5) / sub as f64 - 0.5) / semi.x;
                        let oy = ((j as f64 + 0.5) / sub as f64 - 0.5) / semi.y;
                        profile.accumulate(Vector3::new(local.x + ox, local.y + oy, local.z), share);
                    }
                }
            }
            region.reset();

            sigma_d_acc += covariance[(0, 0)].max(0.0).sqrt();
            sigma_m_acc += covariance[(2, 2)].max(0.0).sqrt();
            n += 1.0;

            entries.push(ShapeEntry { center, strength, profile });
        }

        let (sigma_d, sigma_m) = if n > 0.0 {
            (sigma_d_acc / n, sigma_m_acc / n)
        } else {
            (0.0, 0.0)
        };

        Self { entries, params, sigma_d, sigma_m }
    }

    fn neighbours(&self, event: Vector3) -> Vec<&ShapeEntry> {
        self.entries
            .iter()
            .filter(|e| {
                let dxy = ((e.center.x - event.x).powi(2) + (e.center.y - event.y).powi(2)).sqrt();
                let dz = (e.center.z - event.z).abs();
                dxy <= self.params.neighbour_range_pixels && dz <= self.params.neighbour_range_frames
            })
            .collect()
    }

    /// Mean covariance at detector event `event`, combining neighbour
    /// covariances per `interpolation`. `None` if fewer than
    /// `min_neighbors` qualify (caller flags the peak `TooFewNeighbours`).
    pub fn mean_covariance(&self, event: Vector3) -> Option<Matrix3> {
        let neighbours = self.neighbours(event);
        if neighbours.len() < self.params.min_neighbors {
            return None;
        }
        let weights = self.weights(event, &neighbours);
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return None;
        }
        let mut acc = Matrix3::zeros();
        for (w, e) in weights.iter().zip(&neighbours) {
            acc += e.profile.covariance * (*w / total);
        }
        Some(acc)
    }

    /// Mean 3-D profile at `event`, same neighbour/weight scheme as
    /// [`mean_covariance`](Self::mean_covariance).
    pub fn mean_profile(&self, event: Vector3) -> Option<Vec<f64>> {
        let neighbours = self.neighbours(event);
        if neighbours.len() < self.params.min_neighbors {
            return None;
        }
        let weights = self.weights(event, &neighbours);
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return None;
        }
        let n = self.params.nbins_x * self.params.nbins_y * self.params.nbins_z;
        let mut acc = vec![0.0; n];
        for (w, e) in weights.iter().zip(&neighbours) {
            let normalized = e.profile.normalized();
            for (a, v) in acc.iter_mut().zip(normalized.iter()) {
                *a += v * (*w / total);
            }
        }
        Some(acc)
    }

    fn weights(&self, event: Vector3, neighbours: &[&ShapeEntry]) -> Vec<f64> {
        match self.params.interpolation {
            InterpolationMode::None => {
                let nearest = neighbours
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| (a.center - event).norm().partial_cmp(&(b.center - event).norm()).unwrap())
                    .map(|(i, _)| i);
                neighbours.iter().enumerate().map(|(i, _)| if Some(i) == nearest { 1.0 } else { 0.0 }).collect()
            }
            InterpolationMode::InverseDistance => neighbours
                .iter()
                .map(|e| 1.0 / (e.center - event).norm().max(1e-6))
                .collect(),
            InterpolationMode::Intensity => neighbours.iter().map(|e| e.strength.max(0.0)).collect(),
        }
    }

    /// Builds an owned [`Profile`] at `event` by combining the mean
    /// covariance with the interpolated 3-D histogram, deriving a radial
    /// profile from it by summing bins at similar distance from centre.
    /// Used by the profile-fit integrators, which need a concrete
    /// `Profile` to evaluate rather than the raw neighbour list.
    pub fn profile_at(&self, event: Vector3) -> Option<Profile> {
        let covariance = self.mean_covariance(event)?;
        let histogram = self.mean_profile(event)?;
        let (nx, ny, nz) = (self.params.nbins_x, self.params.nbins_y, self.params.nbins_z);
        let mut radial = vec![0.0; nx];
        for iz in 0..nz {
            for iy in 0..ny {
                for ix in 0..nx {
                    let idx = (iz * ny + iy) * nx + ix;
                    let cx = (ix as f64 / nx as f64) * 2.0 - 1.0;
                    let cy = (iy as f64 / ny as f64) * 2.0 - 1.0;
                    let cz = (iz as f64 / nz as f64) * 2.0 - 1.0;
                    let r = (cx * cx + cy * cy + cz * cz).sqrt();
                    let bin = ((r * nx as f64) as usize).min(nx - 1);
                    radial[bin] += histogram[idx];
                }
            }
        }
        Some(Profile { nbins_x: nx, nbins_y: ny, nbins_z: nz, histogram, radial, covariance })
    }

    /// Assigns each predicted peak's shape metric from the model's mean
    /// covariance at that peak's current centre, flagging peaks with too
    /// few neighbours rather than leaving a stale default shape.
    pub fn assign_shapes(&self, predicted: &mut [Peak3D]) {
        for peak in predicted.iter_mut() {
            match self.mean_covariance(peak.center()) {
                Some(cov) => {
                    if let Some(ellipsoid) = crate::geometry::Ellipsoid::from_covariance(peak.center(), cov) {
                        peak.shape = ellipsoid;
                        continue;
                    }
                    peak.reject(crate::peak::RejectionFlag::InvalidSigma);
                }
                None => peak.reject(crate::peak::RejectionFlag::TooFewNeighbours),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Frame;
    use crate::geometry::Ellipsoid;
    use crate::instrument::{DetectorGeometry, Diffractometer, InstrumentState};
    use crate::peak::{Peak3D, PeakCollection, PeakCollectionKind};

    fn dataset_with_bright_spots(n: usize) -> DataSet {
        let geom = DetectorGeometry::new(128, 128, 100.0, 0.2, 0.2);
        let diff = Diffractometer::new("test", geom);
        let mut ds = DataSet::new("ds", diff);
        let mut frame = Frame::zeros(128, 128);
        for i in 0..n {
            let c = 10 * i;
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    frame.set((c as i64 + dx) as usize, (c as i64 + dy) as usize, 500);
                }
            }
        }
        ds.push_frame(frame, InstrumentState::new(1.0));
        ds
    }

    fn collection_with_peaks(n: usize) -> PeakCollection {
        let mut collection = PeakCollection::new("found", PeakCollectionKind::Found);
        for i in 0..n {
            let center = Vector3::new(10.0 * i as f64, 10.0 * i as f64, 0.0);
            let shape = Ellipsoid::new(center, Matrix3::identity());
            let mut peak = Peak3D::new(shape, 0);
            peak.sum_intensity = crate::peak::Intensity::new(1000.0, 10.0);
            collection.push(peak);
        }
        collection
    }

    #[test]
    fn build_computes_average_sigmas() {
        let dataset = dataset_with_bright_spots(5);
        let collection = collection_with_peaks(5);
        let params = ShapeModelParameters { min_neighbors: 1, ..Default::default() };
        let model = ShapeModel::build(&dataset, &collection, params, 0.0);
        assert!(model.sigma_d > 0.0);
    }

    #[test]
    fn build_accumulates_real_pixel_events_into_profile() {
        let dataset = dataset_with_bright_spots(1);
        let collection = collection_with_peaks(1);
        let params = ShapeModelParameters { min_neighbors: 1, peak_end: 3.0, bkg_begin: 3.0, bkg_end: 6.0, ..Default::default() };
        let model = ShapeModel::build(&dataset, &collection, params, 0.0);
        let total: f64 = model.entries[0].profile.normalized().iter().sum();
        assert!((total - 1.0).abs() < 1e-9 || total == 0.0);
        assert!(model.entries[0].profile.radial.iter().sum::<f64>() > 0.0);
    }

    #[test]
    fn mean_covariance_none_below_min_neighbors() {
        let dataset = dataset_with_bright_spots(2);
        let collection = collection_with_peaks(2);
        let params = ShapeModelParameters { min_neighbors: 5, neighbour_range_pixels: 1000.0, neighbour_range_frames: 1000.0, ..Default::default() };
        let model = ShapeModel::build(&dataset, &collection, params, 0.0);
        assert!(model.mean_covariance(Vector3::zeros()).is_none());
    }

    #[test]
    fn assign_shapes_flags_isolated_predicted_peaks() {
        let dataset = dataset_with_bright_spots(3);
        let collection = collection_with_peaks(3);
        let params = ShapeModelParameters { min_neighbors: 10, ..Default::default() };
        let model = ShapeModel::build(&dataset, &collection, params, 0.0);
        let mut predicted = vec![Peak3D::new(Ellipsoid::new(Vector3::zeros(), Matrix3::identity()), 0)];
        model.assign_shapes(&mut predicted);
        assert_eq!(predicted[0].flag, crate::peak::RejectionFlag::TooFewNeighbours);
    }
}
