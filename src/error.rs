//! Structured input-domain errors.
//!
//! Per-peak and per-batch failures are *not* represented here: those are
//! [`crate::peak::RejectionFlag`] values and booleans respectively, and never
//! unwind past the stage that produced them. `OhklError` is reserved for
//! failures that stop a stage before it can produce a partial result.

use std::path::PathBuf;

pub type Result<T> = anyhow::Result<T>;

#[derive(Debug, thiserror::Error)]
pub enum OhklError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown diffractometer: {0}")]
    UnknownDiffractometer(String),

    #[error("wavelength mismatch: dataset declares {declared} but data says {observed}")]
    WavelengthMismatch { declared: f64, observed: f64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown unit cell id: {0}")]
    UnknownCell(u64),

    #[error("unknown dataset id: {0}")]
    UnknownDataSet(u64),

    #[error("unknown peak collection: {0}")]
    UnknownCollection(String),

    #[error("feature `{0}` is not enabled in this build")]
    FeatureDisabled(&'static str),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("image reader error: {0}")]
    Reader(String),
}
