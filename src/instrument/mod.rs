//! Instrument geometry and per-frame state (component B of `SPEC_FULL.md`).

pub mod detector;
pub mod gonio;
pub mod state;

pub use detector::DetectorGeometry;
pub use gonio::Gonio;
pub use state::{InstrumentState, InstrumentStateList};

use serde::{Deserialize, Serialize};

/// Static description of a diffractometer: its detector geometry and the
/// goniometer axes for sample and detector circles. Owned single-ownership
/// by the `DataSet` it belongs to (see `SPEC_FULL.md` §9, Open Question 1):
/// there is deliberately no `diffractometer_name`-only constructor path, the
/// original's declared-but-dead overload is not implemented.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diffractometer {
    pub name: String,
    pub detector: DetectorGeometry,
    #[serde(skip, default)]
    pub sample_gonio: Option<Gonio>,
    #[serde(skip, default)]
    pub detector_gonio: Option<Gonio>,
}

impl Diffractometer {
    pub fn new(name: impl Into<String>, detector: DetectorGeometry) -> Self {
        Self {
            name: name.into(),
            detector,
            sample_gonio: None,
            detector_gonio: None,
        }
    }
}
