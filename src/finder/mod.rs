//! 3-D peak finding: image filter + connected components + blob-to-peak
//! conversion (component E of `SPEC_FULL.md` §4.1).

pub mod blob;
pub mod filter;

use crate::dataset::DataSet;
use crate::geometry::Ellipsoid;
use crate::peak::{DataSetId, Peak3D, RejectionFlag};
use crate::progress::{Cancel, ProgressSink};
use blob::{track_blobs, Blob3D};
use filter::FilterKind;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PeakFinderParameters {
    pub min_size: usize,
    pub max_size: usize,
    pub max_frames: i64,
    pub first_frame: Option<usize>,
    pub last_frame: Option<usize>,
    pub threshold: f64,
    pub r1: f64,
    pub r2: f64,
    pub r3: f64,
    pub enhanced: bool,
    pub peak_end: f64,
}

impl Default for PeakFinderParameters {
    fn default() -> Self {
        Self {
            min_size: 30,
            max_size: 10_000,
            max_frames: 10,
            first_frame: None,
            last_frame: None,
            threshold: 1.1,
            r1: 5.0,
            r2: 10.0,
            r3: 15.0,
            enhanced: false,
            peak_end: 1.0,
        }
    }
}

impl PeakFinderParameters {
    fn filter(&self) -> FilterKind {
        if self.enhanced {
            FilterKind::EnhancedAnnular { r1: self.r1, r2: self.r2, r3: self.r3 }
        } else {
            FilterKind::Annular { r1: self.r1, r2: self.r2, r3: self.r3 }
        }
    }
}

/// Runs the peak finder over `dataset.frames()[first..=last]`, honouring
/// `progress` cancellation between the filter pass and the blob-tracking
/// pass (the two most expensive stages).
pub fn find(dataset: &DataSet, dataset_id: DataSetId, params: &PeakFinderParameters, progress: &dyn ProgressSink) -> Vec<Peak3D> {
    let first = params.first_frame.unwrap_or(0);
    let last = params.last_frame.unwrap_or(dataset.len().saturating_sub(1)).min(dataset.len().saturating_sub(1));
    if dataset.is_empty() || first > last {
        return Vec::new();
    }

    progress.set_status("filtering frames");
    let kernel = params.filter().build();
    let responses: Vec<Vec<f64>> = (first..=last)
        .into_par_iter()
        .map(|i| kernel.convolve(dataset.frame(i).expect("frame in range")))
        .collect();

    if progress.poll() == Cancel::Abort {
        return Vec::new();
    }

    progress.set_status("tracking blobs");
    let raw_counts: Vec<&[u32]> = (first..=last).map(|i| dataset.frame(i).unwrap().as_slice()).collect();
    let nrows = dataset.frame(first).unwrap().nrows;
    let ncols = dataset.frame(first).unwrap().ncols;
    let blobs = track_blobs(&responses, &raw_counts, nrows, ncols, first as i64, params.threshold);

    progress.set_status("building peaks");
    blobs
        .into_iter()
        .filter(|b| passes_size_filters(b, params))
        .filter_map(|b| blob_to_peak(&b, dataset, dataset_id, params))
        .collect()
}

fn passes_size_filters(blob: &Blob3D, params: &PeakFinderParameters) -> bool {
    blob.pixel_count >= params.min_size
        && blob.pixel_count <= params.max_size
        && blob.frame_span() <= params.max_frames
        && blob.n >= params.threshold * blob.pixel_count as f64
}

fn blob_to_peak(blob: &Blob3D, dataset: &DataSet, dataset_id: DataSetId, params: &PeakFinderParameters) -> Option<Peak3D> {
    let center = blob.mean();
    let covariance = blob.covariance();
    let shape = Ellipsoid::from_covariance(center, covariance)?.scaled(params.peak_end);

    let mut peak = Peak3D::new(shape, dataset_id);
    let (px, py, _) = (center.x, center.y, center.z);
    let geom = &dataset.diffractometer.detector;
    if !geom.in_bounds(px, py) {
        peak.reject(RejectionFlag::InvalidRegion);
    }
    Some(peak)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Frame;
    use crate::instrument::{DetectorGeometry, Diffractometer, InstrumentState};
    use crate::progress::NullProgress;

    fn dataset_with_spot() -> DataSet {
        let geom = DetectorGeometry::new(60, 60, 100.0, 0.1, 0.1);
        let diff = Diffractometer::new("test", geom);
        let mut ds = DataSet::new("ds", diff);
        for _ in 0..3 {
            let mut frame = Frame::zeros(60, 60);
            for dy in -2i64..=2 {
                for dx in -2i64..=2 {
                    let x = (30 + dx) as usize;
                    let y = (30 + dy) as usize;
                    frame.set(x, y, 200);
                }
            }
            ds.push_frame(frame, InstrumentState::new(1.0));
        }
        ds
    }

    #[test]
    fn finds_a_bright_blob_with_relaxed_size_threshold() {
        let ds = dataset_with_spot();
        let params = PeakFinderParameters { min_size: 1, max_size: 1000, ..Default::default() };
        let peaks = find(&ds, 0, &params, &NullProgress);
        assert!(!peaks.is_empty(), "expected at least one blob");
    }

    #[test]
    fn empty_dataset_yields_no_peaks() {
        let geom = DetectorGeometry::new(16, 16, 100.0, 0.1, 0.1);
        let diff = Diffractometer::new("empty", geom);
        let ds = DataSet::new("ds", diff);
        let peaks = find(&ds, 0, &PeakFinderParameters::default(), &NullProgress);
        assert!(peaks.is_empty());
    }
}
