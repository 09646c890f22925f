//! Frame store, metadata, per-image instrument states and masks
//! (component C of `SPEC_FULL.md` §3).

use crate::error::{OhklError, Result};
use crate::instrument::{Diffractometer, InstrumentState, InstrumentStateList};
use serde::{Deserialize, Serialize};

/// One raw detector image: `nrows x ncols` integer pixel counts, stored
/// row-major.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub nrows: usize,
    pub ncols: usize,
    counts: Vec<u32>,
}

impl Frame {
    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        Self { nrows, ncols, counts: vec![0; nrows * ncols] }
    }

    pub fn from_counts(nrows: usize, ncols: usize, counts: Vec<u32>) -> Result<Self> {
        if counts.len() != nrows * ncols {
            anyhow::bail!(OhklError::InvalidConfig(format!(
                "frame buffer has {} elements, expected {}",
                counts.len(),
                nrows * ncols
            )));
        }
        Ok(Self { nrows, ncols, counts })
    }

    #[inline]
    pub fn get(&self, px: usize, py: usize) -> u32 {
        self.counts[py * self.ncols + px]
    }

    #[inline]
    pub fn get_checked(&self, px: isize, py: isize) -> Option<u32> {
        if px < 0 || py < 0 || px as usize >= self.ncols || py as usize >= self.nrows {
            None
        } else {
            Some(self.get(px as usize, py as usize))
        }
    }

    #[inline]
    pub fn set(&mut self, px: usize, py: usize, value: u32) {
        self.counts[py * self.ncols + px] = value;
    }

    pub fn max_count(&self) -> u32 {
        self.counts.iter().copied().max().unwrap_or(0)
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.counts
    }
}

/// A 2-D region of a detector image excluded from peak search/integration,
/// e.g. a beamstop shadow or a known bad-pixel patch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Mask {
    Rectangle { x0: f64, y0: f64, x1: f64, y1: f64 },
    Ellipse { cx: f64, cy: f64, rx: f64, ry: f64 },
}

impl Mask {
    pub fn contains(&self, px: f64, py: f64) -> bool {
        match *self {
            Mask::Rectangle { x0, y0, x1, y1 } => px >= x0 && px <= x1 && py >= y0 && py <= y1,
            Mask::Ellipse { cx, cy, rx, ry } => {
                let dx = (px - cx) / rx;
                let dy = (py - cy) / ry;
                dx * dx + dy * dy <= 1.0
            }
        }
    }
}

/// Dataset-scope constants that apply to every frame: detector baseline
/// (dark count) and gain, and the nominal angular step between
/// consecutive frames (degrees).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DataSetMetadata {
    pub baseline: f64,
    pub gain: f64,
    pub angular_step: f64,
}

impl Default for DataSetMetadata {
    fn default() -> Self {
        Self { baseline: 0.0, gain: 1.0, angular_step: 0.1 }
    }
}

/// Read-only summary of a dataset's peak/indexing yield, computed on
/// demand from whatever peak collections reference it (never cached: a
/// `DataSet` has no back-reference to the peaks built from it).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DataQuality {
    pub n_peaks: usize,
    pub n_indexed: usize,
    pub mean_strength: f64,
}

impl DataQuality {
    pub fn indexed_fraction(&self) -> f64 {
        if self.n_peaks == 0 {
            0.0
        } else {
            self.n_indexed as f64 / self.n_peaks as f64
        }
    }
}

/// Ordered stack of detector images taken during one rotation scan, plus
/// everything needed to interpret them: per-frame instrument state, a
/// diffractometer description, and a set of 2-D masks applied uniformly
/// to every frame.
///
/// Invariant: `instrument_states.len() == frames.len()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSet {
    pub name: String,
    pub diffractometer: Diffractometer,
    frames: Vec<Frame>,
    instrument_states: InstrumentStateList,
    pub masks: Vec<Mask>,
    pub metadata: DataSetMetadata,
}

impl DataSet {
    pub fn new(name: impl Into<String>, diffractometer: Diffractometer) -> Self {
        Self {
            name: name.into(),
            diffractometer,
            frames: Vec::new(),
            instrument_states: Vec::new(),
            masks: Vec::new(),
            metadata: DataSetMetadata::default(),
        }
    }

    /// Append one frame together with the instrument state it was taken
    /// under, keeping the `states.len() == frames.len()` invariant.
    pub fn push_frame(&mut self, frame: Frame, state: InstrumentState) {
        self.frames.push(frame);
        self.instrument_states.push(state);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn state(&self, index: usize) -> Option<&InstrumentState> {
        self.instrument_states.get(index)
    }

    pub fn state_mut(&mut self, index: usize) -> Option<&mut InstrumentState> {
        self.instrument_states.get_mut(index)
    }

    pub fn states(&self) -> &[InstrumentState] {
        &self.instrument_states
    }

    pub fn states_mut(&mut self) -> &mut InstrumentStateList {
        &mut self.instrument_states
    }

    /// Verifies the `states.len() == frames.len()` invariant the rest of
    /// the pipeline relies on; called after bulk loading.
    pub fn validate(&self) -> Result<()> {
        if self.frames.len() != self.instrument_states.len() {
            anyhow::bail!(OhklError::InvalidConfig(format!(
                "dataset {}: {} frames but {} instrument states",
                self.name,
                self.frames.len(),
                self.instrument_states.len()
            )));
        }
        Ok(())
    }

    pub fn is_masked(&self, px: f64, py: f64) -> bool {
        self.masks.iter().any(|m| m.contains(px, py))
    }

    /// Interpolates the instrument state between the two frames
    /// straddling a fractional frame coordinate, used by the predictor
    /// and integrators when a peak's centre falls between sampled frames.
    pub fn interpolated_ni(&self, frame: f64) -> Option<crate::geometry::Vector3> {
        let lo = frame.floor().max(0.0) as usize;
        let hi = (lo + 1).min(self.instrument_states.len().saturating_sub(1));
        let a = self.instrument_states.get(lo)?;
        let b = self.instrument_states.get(hi)?;
        let t = (frame - lo as f64).clamp(0.0, 1.0);
        Some((a.ni * (1.0 - t) + b.ni * t).normalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::DetectorGeometry;

    fn sample_dataset(n: usize) -> DataSet {
        let geom = DetectorGeometry::new(16, 16, 100.0, 0.1, 0.1);
        let diff = Diffractometer::new("test", geom);
        let mut ds = DataSet::new("ds1", diff);
        for _ in 0..n {
            ds.push_frame(Frame::zeros(16, 16), InstrumentState::new(1.0));
        }
        ds
    }

    #[test]
    fn validate_passes_when_lengths_match() {
        let ds = sample_dataset(5);
        assert!(ds.validate().is_ok());
    }

    #[test]
    fn frame_from_counts_rejects_wrong_length() {
        assert!(Frame::from_counts(2, 2, vec![1, 2, 3]).is_err());
    }

    #[test]
    fn rectangle_mask_contains_interior_points() {
        let mask = Mask::Rectangle { x0: 1.0, y0: 1.0, x1: 3.0, y1: 3.0 };
        assert!(mask.contains(2.0, 2.0));
        assert!(!mask.contains(5.0, 5.0));
    }

    #[test]
    fn ellipse_mask_contains_center() {
        let mask = Mask::Ellipse { cx: 0.0, cy: 0.0, rx: 2.0, ry: 1.0 };
        assert!(mask.contains(0.0, 0.0));
        assert!(!mask.contains(3.0, 0.0));
    }

    #[test]
    fn interpolated_ni_blends_between_frames() {
        let mut ds = sample_dataset(0);
        let mut s0 = InstrumentState::new(1.0);
        s0.ni = crate::geometry::Vector3::new(1.0, 0.0, 0.0);
        let mut s1 = InstrumentState::new(1.0);
        s1.ni = crate::geometry::Vector3::new(0.0, 1.0, 0.0);
        ds.push_frame(Frame::zeros(16, 16), s0);
        ds.push_frame(Frame::zeros(16, 16), s1);
        let mid = ds.interpolated_ni(0.5).unwrap();
        assert!((mid.x - mid.y).abs() < 1e-6);
    }
}
