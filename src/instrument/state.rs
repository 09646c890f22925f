use crate::geometry::{Matrix3, UnitQuaternion, Vector3};
use crate::instrument::detector::DetectorGeometry;
use serde::{Deserialize, Serialize};

/// Per-frame instrument state: everything that can change between one
/// detector image and the next. Exposes the kf/q mappings and Jacobian
/// that the rest of the pipeline (predictor, refiner, shape model) build
/// on.
///
/// Invariant: `sample_orientation` and `sample_orientation_offset` stay
/// unit quaternions, `detector_orientation` stays orthonormal, and
/// `wavelength > 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentState {
    pub sample_orientation: UnitQuaternion,
    pub sample_orientation_offset: UnitQuaternion,
    pub sample_position: Vector3,
    pub detector_orientation: Matrix3,
    pub detector_position_offset: Vector3,
    /// Incident beam direction, unit vector.
    pub ni: Vector3,
    pub wavelength: f64,
    pub refined: bool,
}

impl InstrumentState {
    pub fn new(wavelength: f64) -> Self {
        Self {
            sample_orientation: UnitQuaternion::identity(),
            sample_orientation_offset: UnitQuaternion::identity(),
            sample_position: Vector3::zeros(),
            detector_orientation: Matrix3::identity(),
            detector_position_offset: Vector3::zeros(),
            ni: Vector3::new(0.0, 0.0, 1.0),
            wavelength,
            refined: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.wavelength > 0.0
            && self.sample_orientation.as_ref().norm() > 0.0
            && self.detector_orientation.determinant().abs() > 1e-9
    }

    /// Combined sample orientation: fixed orientation composed with the
    /// refinable offset.
    pub fn sample_orientation_matrix(&self) -> Matrix3 {
        (self.sample_orientation * self.sample_orientation_offset).to_rotation_matrix().into_inner()
    }

    pub fn detector_orientation_matrix(&self) -> Matrix3 {
        self.detector_orientation
    }

    /// Incident wavevector `k_i`, magnitude `2*pi/lambda`, direction `ni`.
    pub fn ki(&self) -> Vector3 {
        self.ni.normalize() * (2.0 * std::f64::consts::PI / self.wavelength)
    }

    /// Lab-frame position of a detector pixel, given the baseline detector
    /// geometry, after applying this state's detector orientation/offset
    /// and the parallax shift from a non-zero sample position.
    pub fn detector_lab_position(&self, geom: &DetectorGeometry, px: f64, py: f64) -> Vector3 {
        let local = geom.local_position(px, py);
        self.detector_orientation_matrix() * local + self.detector_position_offset - self.sample_position
    }

    /// Outgoing wavevector `k_f` in lab coordinates for a detector pixel.
    pub fn kf_lab(&self, geom: &DetectorGeometry, px: f64, py: f64) -> Vector3 {
        let p = self.detector_lab_position(geom, px, py);
        p.normalize() * self.ki().norm()
    }

    /// `q = k_f - k_i` in lab coordinates.
    pub fn q_lab(&self, geom: &DetectorGeometry, px: f64, py: f64) -> Vector3 {
        self.kf_lab(geom, px, py) - self.ki()
    }

    /// `q` rotated into the sample frame (undoing the sample orientation),
    /// i.e. the vector that should equal `U*B*hkl` for an indexed peak.
    pub fn sample_q(&self, geom: &DetectorGeometry, px: f64, py: f64) -> Vector3 {
        let r = self.sample_orientation_matrix();
        r.transpose() * self.q_lab(geom, px, py)
    }

    /// Adjust `ni`/wavelength-independent beam direction so that the given
    /// detector pixel sits exactly on the direct beam (zero-scattering)
    /// axis. Used during instrument calibration bootstrap.
    pub fn adjust_ki(&mut self, geom: &DetectorGeometry, direct_beam_px: f64, direct_beam_py: f64) {
        let p = self.detector_lab_position(geom, direct_beam_px, direct_beam_py);
        self.ni = p.normalize();
    }

    /// Jacobian of `(px, py) -> k_lab` at the given pixel, by finite
    /// difference of `kf_lab`. Used by the refiner's real-space residual
    /// and by the shape model's Kabsch coordinate transform.
    pub fn jacobian_k(&self, geom: &DetectorGeometry, px: f64, py: f64) -> Matrix3 {
        let h = 1e-3;
        let k0 = self.kf_lab(geom, px, py);
        let kx = self.kf_lab(geom, px + h, py);
        let ky = self.kf_lab(geom, px, py + h);
        // Third column: d/dframe is not defined by the detector geometry
        // alone, so we report the zero vector there; callers needing the
        // full px/py/frame Jacobian (the shape model) combine this with
        // the rocking-curve derivative separately.
        let mut j = Matrix3::zeros();
        j.set_column(0, &((kx - k0) / h));
        j.set_column(1, &((ky - k0) / h));
        j
    }

    pub fn gamma(&self, geom: &DetectorGeometry, px: f64, py: f64) -> f64 {
        let p = self.detector_lab_position(geom, px, py);
        p.x.atan2(p.z)
    }

    pub fn nu(&self, geom: &DetectorGeometry, px: f64, py: f64) -> f64 {
        let p = self.detector_lab_position(geom, px, py);
        (p.y / p.xz_norm()).atan()
    }

    pub fn two_theta(&self, geom: &DetectorGeometry, px: f64, py: f64) -> f64 {
        let p = self.detector_lab_position(geom, px, py).normalize();
        let ni = self.ni.normalize();
        p.dot(&ni).clamp(-1.0, 1.0).acos()
    }
}

trait XzNorm {
    fn xz_norm(&self) -> f64;
}

impl XzNorm for Vector3 {
    fn xz_norm(&self) -> f64 {
        (self.x * self.x + self.z * self.z).sqrt()
    }
}

pub type InstrumentStateList = Vec<InstrumentState>;

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn geom() -> DetectorGeometry {
        DetectorGeometry::new(512, 512, 100.0, 0.1, 0.1)
    }

    #[test]
    fn q_is_zero_on_direct_beam_axis() {
        let g = geom();
        let state = InstrumentState::new(1.0);
        // the pixel looking straight down ni from the sample is the direct beam
        let center_px = g.ncols as f64 / 2.0;
        let center_py = g.nrows as f64 / 2.0;
        let q = state.q_lab(&g, center_px, center_py);
        assert_relative_eq!(q.norm(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn ki_magnitude_matches_wavelength() {
        let state = InstrumentState::new(2.0);
        assert_relative_eq!(state.ki().norm(), std::f64::consts::PI, epsilon = 1e-9);
    }
}
