//! Integration driver: per-frame region updates, parallel per-peak
//! `compute` once a region is ready (components G+H of `SPEC_FULL.md`
//! §4.6).

pub mod integrator;
pub mod region;

pub use integrator::{ComputeResult, IntegratorKind, IntegratorType};
pub use region::{IntegrationRegion, RegionType};

use crate::dataset::DataSet;
use crate::peak::{PeakCollection, RejectionFlag};
use crate::progress::{Cancel, ProgressSink};
use crate::shape::ShapeModel;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IntegrationParameters {
    pub peak_end: f64,
    pub bkg_begin: f64,
    pub bkg_end: f64,
    pub max_width: i64,
    pub discard_saturated: bool,
    pub max_counts: u32,
    pub isigma_max_radius_steps: usize,
    pub region_type_fixed_sphere: bool,
}

impl Default for IntegrationParameters {
    fn default() -> Self {
        Self {
            peak_end: 3.0,
            bkg_begin: 3.0,
            bkg_end: 6.0,
            max_width: 10,
            discard_saturated: true,
            max_counts: 1_000_000,
            isigma_max_radius_steps: 20,
            region_type_fixed_sphere: false,
        }
    }
}

/// Drives one integration pass over `collection`'s enabled peaks against
/// `dataset`: builds a region per peak, feeds it frames sequentially (the
/// frame buffer is read once, in order, as `spec.md` §5 requires), and
/// computes each region in parallel as soon as it is `Ready`.
pub fn integrate(
    dataset: &DataSet,
    collection: &mut PeakCollection,
    kind: IntegratorKind,
    shape_model: Option<&ShapeModel>,
    params: &IntegrationParameters,
    progress: &dyn ProgressSink,
) {
    let region_type = if params.region_type_fixed_sphere {
        RegionType::FixedSphere
    } else {
        RegionType::VariableEllipsoid
    };

    let mut regions: Vec<(usize, IntegrationRegion)> = collection
        .peaks()
        .iter()
        .enumerate()
        .filter(|(_, p)| p.enabled())
        .map(|(i, p)| (i, IntegrationRegion::new(p, params.peak_end, params.bkg_begin, params.bkg_end, region_type)))
        .collect();

    for frame_index in 0..dataset.len() {
        if progress.poll() == Cancel::Abort {
            break;
        }
        progress.set_progress(frame_index as f64 / dataset.len().max(1) as f64);

        let mut ready_indices = Vec::new();
        for (slot, (_, region)) in regions.iter_mut().enumerate() {
            region.update_frame(dataset, frame_index);
            if region.state == region::RegionState::Ready {
                ready_indices.push(slot);
            }
        }

        let results: Vec<(usize, ComputeResult)> = ready_indices
            .par_iter()
            .map(|&slot| {
                let (peak_index, region) = &regions[slot];
                let profile = shape_model.and_then(|sm| sm.profile_at(region.peak_shape.center()));
                (*peak_index, kind.compute(region, profile.as_ref()))
            })
            .collect();

        for (peak_index, result) in results {
            persist_result(collection, peak_index, result);
        }
        for &slot in ready_indices.iter().rev() {
            regions[slot].1.reset();
        }
        regions.retain(|(_, r)| r.state != region::RegionState::Reset);
    }

    // Any region that never reached Ready (peak entirely outside the
    // dataset's frame range) is reported as an invalid region.
    for (peak_index, region) in &regions {
        if region.state != region::RegionState::Reset {
            let peak = &mut collection.peaks_mut()[*peak_index];
            peak.reject(RejectionFlag::InvalidRegion);
        }
    }

    collection.integrated = true;
}

fn persist_result(collection: &mut PeakCollection, peak_index: usize, result: ComputeResult) {
    let peak = &mut collection.peaks_mut()[peak_index];
    if result.flag != RejectionFlag::NotRejected {
        peak.reject(result.flag);
        return;
    }
    peak.sum_intensity = result.sum_intensity;
    peak.profile_intensity = result.profile_intensity;
    peak.mean_background = result.sum_background.max(result.profile_background);
    peak.background_gradient = result.bkg_gradient;
    peak.rocking_curve = result.rocking_curve;
}
