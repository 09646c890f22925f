//! Per-peak integration region: nested peak/background ellipsoids,
//! pixel classification and frame-by-frame event accumulation
//! (component G of `SPEC_FULL.md` §4.6).

use crate::dataset::{DataSet, Mask};
use crate::geometry::{Ellipsoid, Vector3};
use crate::peak::Peak3D;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionType {
    VariableEllipsoid,
    FixedEllipsoid,
    FixedSphere,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLabel {
    Background,
    Peak,
    Forbidden,
    Excluded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Unseen,
    Accumulating,
    Ready,
    Computed,
    Reset,
}

/// One classified event: a pixel on a frame within the region's peak or
/// background shell, its raw count, and (for PixelSum background
/// modelling) an optional local gradient magnitude.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub px: f64,
    pub py: f64,
    pub frame: f64,
    pub count: u32,
    pub label: PixelLabel,
    pub gradient: Option<f64>,
}

#[derive(Debug, Default, Clone)]
pub struct PeakData {
    pub events: Vec<Event>,
}

impl PeakData {
    pub fn peak_events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().filter(|e| e.label == PixelLabel::Peak)
    }

    pub fn background_events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().filter(|e| e.label == PixelLabel::Background)
    }
}

/// Owns a peak's nested integration shapes and accumulates classified
/// events frame by frame until the region's frame span has been fully
/// observed, at which point it is `Ready` for the integrator's `compute`.
pub struct IntegrationRegion {
    pub peak_shape: Ellipsoid,
    pub bkg_begin_shape: Ellipsoid,
    pub bkg_end_shape: Ellipsoid,
    pub region_type: RegionType,
    pub data: PeakData,
    pub state: RegionState,
    lower_frame: i64,
    upper_frame: i64,
}

impl IntegrationRegion {
    pub fn new(peak: &Peak3D, peak_end: f64, bkg_begin: f64, bkg_end: f64, region_type: RegionType) -> Self {
        let peak_shape = peak.shape.scaled(peak_end);
        let bkg_begin_shape = peak.shape.scaled(bkg_begin);
        let bkg_end_shape = peak.shape.scaled(bkg_end);
        let aabb = bkg_end_shape.aabb();
        let (lower_frame, upper_frame) = match aabb {
            Some(a) => (a.lower_frame().floor() as i64, a.upper_frame().ceil() as i64),
            None => (0, 0),
        };
        Self {
            peak_shape,
            bkg_begin_shape,
            bkg_end_shape,
            region_type,
            data: PeakData::default(),
            state: RegionState::Unseen,
            lower_frame,
            upper_frame,
        }
    }

    pub fn peak_bbox_upper_frame(&self) -> i64 {
        self.upper_frame
    }

    pub fn peak_bbox_lower_frame(&self) -> i64 {
        self.lower_frame
    }

    fn classify(&self, point: Vector3, masked: bool) -> PixelLabel {
        if masked {
            return PixelLabel::Excluded;
        }
        if self.peak_shape.contains(point) {
            PixelLabel::Peak
        } else if self.bkg_begin_shape.contains(point) {
            PixelLabel::Forbidden
        } else if self.bkg_end_shape.contains(point) {
            PixelLabel::Background
        } else {
            PixelLabel::Excluded
        }
    }

    /// Scans the pixels of `frame_index` within the region's detector
    /// footprint, classifying and recording each. Masked pixels (from
    /// `dataset.masks`) are always `Excluded`.
    pub fn update_frame(&mut self, dataset: &DataSet, frame_index: usize) {
        self.state = RegionState::Accumulating;
        let Some(frame) = dataset.frame(frame_index) else { return };
        let aabb = match self.bkg_end_shape.aabb() {
            Some(a) => a,
            None => return,
        };
        let x0 = aabb.lower.x.floor().max(0.0) as i64;
        let x1 = aabb.upper.x.ceil().min(frame.ncols as f64 - 1.0) as i64;
        let y0 = aabb.lower.y.floor().max(0.0) as i64;
        let y1 = aabb.upper.y.ceil().min(frame.nrows as f64 - 1.0) as i64;
        if x0 > x1 || y0 > y1 {
            return;
        }

        for py in y0..=y1 {
            for px in x0..=x1 {
                let point = Vector3::new(px as f64, py as f64, frame_index as f64);
                let masked = dataset.is_masked(px as f64, py as f64);
                let label = self.classify(point, masked);
                if label == PixelLabel::Excluded && !masked {
                    continue;
                }
                let count = frame.get(px as usize, py as usize);
                self.data.events.push(Event {
                    px: px as f64,
                    py: py as f64,
                    frame: frame_index as f64,
                    count,
                    label,
                    gradient: None,
                });
            }
        }

        if frame_index as i64 >= self.upper_frame || frame_index + 1 == dataset.len() {
            self.state = RegionState::Ready;
        }
    }

    pub fn max_count(&self) -> u32 {
        self.data.events.iter().map(|e| e.count).max().unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.data.events.clear();
        self.state = RegionState::Reset;
    }
}
