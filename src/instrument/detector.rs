use crate::geometry::Vector3;
use serde::{Deserialize, Serialize};

/// Flat-panel detector geometry: maps a pixel `(px, py)` to a position in
/// the detector's own (unrotated, unoffset) frame. The per-frame rotation
/// and translation on top of this baseline geometry lives in
/// [`crate::instrument::state::InstrumentState`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DetectorGeometry {
    pub nrows: usize,
    pub ncols: usize,
    /// Sample-to-detector distance along the beam direction, mm.
    pub distance: f64,
    /// Pixel pitch, mm.
    pub pixel_width: f64,
    pub pixel_height: f64,
    /// Detector-frame origin (centre of pixel (0,0)) in mm, in the
    /// detector's local coordinate system before rotation/offset.
    pub origin: Vector3,
}

impl DetectorGeometry {
    pub fn new(nrows: usize, ncols: usize, distance: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            nrows,
            ncols,
            distance,
            pixel_width,
            pixel_height,
            origin: Vector3::new(-(ncols as f64) * pixel_width / 2.0, -(nrows as f64) * pixel_height / 2.0, distance),
        }
    }

    /// Position of pixel `(px, py)` in the detector's local frame, before
    /// any per-frame rotation/offset is applied.
    pub fn local_position(&self, px: f64, py: f64) -> Vector3 {
        self.origin + Vector3::new(px * self.pixel_width, py * self.pixel_height, 0.0)
    }

    pub fn in_bounds(&self, px: f64, py: f64) -> bool {
        px >= 0.0 && px < self.ncols as f64 && py >= 0.0 && py < self.nrows as f64
    }
}
