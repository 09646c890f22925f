//! Miller-index enumeration -> detector events via a parametric
//! instrument-state model (component J of `SPEC_FULL.md` §4.4).

use crate::dataset::DataSet;
use crate::geometry::{Ellipsoid, Matrix3, Vector3};
use crate::peak::{CellId, DataSetId, Peak3D, RejectionFlag};
use crate::unitcell::UnitCell;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PredictorParameters {
    pub d_min: f64,
    pub d_max: f64,
    /// Matches `IntegrationParameters.max_width` (`original_source`
    /// `IIntegrator.h`): the widest frame span a predicted peak's default
    /// shape may claim before prediction gives up on it.
    pub max_width: i64,
    /// Default semi-axis (pixels/frames) for a predicted peak's shape
    /// before a shape model has assigned a refined one.
    pub default_radius: f64,
}

impl Default for PredictorParameters {
    fn default() -> Self {
        Self {
            d_min: 1.5,
            d_max: 50.0,
            max_width: 10,
            default_radius: 5.0,
        }
    }
}

/// Enumerates integer Miller triples within the resolution window, and
/// for each finds which dataset frame(s) put `q_lab` on the Ewald sphere,
/// producing one `Peak3D` per detector event found.
pub fn predict(dataset: &DataSet, dataset_id: DataSetId, cell: &UnitCell, cell_id: CellId, params: &PredictorParameters) -> Vec<Peak3D> {
    let ub = cell.ub();
    let hmax = (params.d_max / params.d_min * 2.0).ceil() as i32;
    let mut peaks = Vec::new();

    for h in -hmax..=hmax {
        for k in -hmax..=hmax {
            for l in -hmax..=hmax {
                if h == 0 && k == 0 && l == 0 {
                    continue;
                }
                let hkl = Vector3::new(h as f64, k as f64, l as f64);
                let q_sample = ub * hkl;
                let norm = q_sample.norm();
                if norm <= 0.0 {
                    continue;
                }
                let d = 2.0 * std::f64::consts::PI / norm;
                if d < params.d_min || d > params.d_max {
                    continue;
                }

                for event in events_for_hkl(dataset, q_sample) {
                    let (px, py, frame) = event;
                    if !dataset.diffractometer.detector.in_bounds(px, py) {
                        continue;
                    }
                    let shape = Ellipsoid::new(
                        Vector3::new(px, py, frame),
                        Matrix3::identity() / (params.default_radius * params.default_radius),
                    );
                    let mut peak = Peak3D::new(shape, dataset_id);
                    peak.cell = Some(cell_id);
                    peak.miller_index = Some((h, k, l));
                    peak.flag = RejectionFlag::NotRejected;
                    peaks.push(peak);
                }
            }
        }
    }
    peaks
}

/// Solves for the frame(s) at which `q_sample` (in the sample/crystal
/// frame) lands on the Ewald sphere, by scanning the dataset's sampled
/// instrument states and bisecting between sign changes of
/// `|q_lab(frame)| - |q_lab_target|`-style residual. Returns detector
/// pixel + fractional frame for each root found.
pub(crate) fn events_for_hkl(dataset: &DataSet, q_sample: Vector3) -> Vec<(f64, f64, f64)> {
    let mut events = Vec::new();
    if dataset.is_empty() {
        return events;
    }

    let residual = |frame_idx: usize| -> Option<f64> {
        let state = dataset.state(frame_idx)?;
        let r = state.sample_orientation_matrix();
        let q_lab = r * q_sample;
        let kf = q_lab + state.ki();
        Some(kf.norm() - state.ki().norm())
    };

    let mut prev = residual(0);
    for frame_idx in 1..dataset.len() {
        let cur = residual(frame_idx);
        if let (Some(p), Some(c)) = (prev, cur) {
            if p.signum() != c.signum() {
                let frame = bisect_frame(dataset, q_sample, frame_idx - 1, frame_idx);
                if let Some((px, py, f)) = detector_position_at(dataset, q_sample, frame) {
                    events.push((px, py, f));
                }
            }
        }
        prev = cur;
    }
    events
}

fn residual_at(dataset: &DataSet, q_sample: Vector3, frame: f64) -> Option<f64> {
    let ni = dataset.interpolated_ni(frame)?;
    let lo = frame.floor().max(0.0) as usize;
    let state = dataset.state(lo)?;
    let wavelength = state.wavelength;
    let ki = ni * (2.0 * std::f64::consts::PI / wavelength);
    let r = state.sample_orientation_matrix();
    let q_lab = r * q_sample;
    let kf = q_lab + ki;
    Some(kf.norm() - ki.norm())
}

fn bisect_frame(dataset: &DataSet, q_sample: Vector3, lo_idx: usize, hi_idx: usize) -> f64 {
    let mut lo = lo_idx as f64;
    let mut hi = hi_idx as f64;
    for _ in 0..30 {
        let mid = 0.5 * (lo + hi);
        let r_lo = residual_at(dataset, q_sample, lo).unwrap_or(0.0);
        let r_mid = residual_at(dataset, q_sample, mid).unwrap_or(0.0);
        if r_lo.signum() == r_mid.signum() {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

fn detector_position_at(dataset: &DataSet, q_sample: Vector3, frame: f64) -> Option<(f64, f64, f64)> {
    let lo = frame.floor().max(0.0) as usize;
    let state = dataset.state(lo)?;
    let r = state.sample_orientation_matrix();
    let q_lab = r * q_sample;
    let ni = dataset.interpolated_ni(frame)?;
    let ki = ni * (2.0 * std::f64::consts::PI / state.wavelength);
    let kf = q_lab + ki;
    if kf.norm() <= 0.0 {
        return None;
    }
    let geom = &dataset.diffractometer.detector;
    let direction = kf.normalize();
    // Solve for the scalar t such that geom.origin-relative point along
    // `direction` lies on the detector plane z = geom.distance.
    if direction.z.abs() < 1e-12 {
        return None;
    }
    let t = geom.distance / direction.z;
    let lab_point = direction * t;
    let local = lab_point - geom.origin;
    let px = local.x / geom.pixel_width;
    let py = local.y / geom.pixel_height;
    Some((px, py, frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Frame;
    use crate::instrument::{DetectorGeometry, Diffractometer, InstrumentState};
    use crate::spacegroup::SpaceGroup;
    use crate::unitcell::{CellCharacter, UnitCell};

    fn dataset() -> DataSet {
        let geom = DetectorGeometry::new(512, 512, 100.0, 0.1, 0.1);
        let diff = Diffractometer::new("test", geom);
        let mut ds = DataSet::new("ds", diff);
        for i in 0..36 {
            let mut state = InstrumentState::new(1.0);
            let omega = (i as f64) * 5.0_f64.to_radians();
            state.sample_orientation = nalgebra::UnitQuaternion::from_axis_angle(&nalgebra::Vector3::z_axis(), omega);
            ds.push_frame(Frame::zeros(512, 512), state);
        }
        ds
    }

    #[test]
    fn predicted_peaks_have_miller_indices_set() {
        let ds = dataset();
        let cell = UnitCell::from_character(
            CellCharacter { a: 50.0, b: 55.0, c: 60.0, alpha: 90.0, beta: 90.0, gamma: 90.0 },
            SpaceGroup::p212121(),
        );
        let params = PredictorParameters { d_min: 5.0, d_max: 50.0, ..Default::default() };
        let peaks = predict(&ds, 0, &cell, 0, &params);
        for p in &peaks {
            assert!(p.miller_index.is_some());
            assert_eq!(p.cell, Some(0));
        }
    }
}
