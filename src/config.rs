//! YAML experiment configuration (component P of `SPEC_FULL.md` §2, §6).
//!
//! Mirrors the original's top-level keys (`DataReader`, `Experiment.PeakFinder`,
//! `Experiment.Autoindexer`, `Experiment.ShapeModel`, `Experiment.Predictor`,
//! `Experiment.Integration`, `Experiment.Merge`). Every field carries
//! `#[serde(default)]` so a key missing from the file falls back to the
//! matching `Default` impl in the stage module it configures; the caller is
//! told which top-level sections were absent so it can warn through a
//! [`crate::logging::LoggingContext`] the way the original logs a
//! missing-section warning at load time. Unknown keys are silently ignored,
//! which is `serde_yaml`'s behaviour unless `deny_unknown_fields` is set (it
//! isn't, here).

use crate::autoindex::IndexerParameters;
use crate::error::{OhklError, Result};
use crate::finder::PeakFinderParameters;
use crate::integration::IntegrationParameters;
use crate::io::DataReaderParameters;
use crate::merge::MergeParameters;
use crate::predict::PredictorParameters;
use crate::shape::ShapeModelParameters;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentSection {
    #[serde(default, rename = "PeakFinder")]
    pub peak_finder: PeakFinderParameters,
    #[serde(default, rename = "Autoindexer")]
    pub autoindexer: IndexerParameters,
    #[serde(default, rename = "ShapeModel")]
    pub shape_model: ShapeModelParameters,
    #[serde(default, rename = "Predictor")]
    pub predictor: PredictorParameters,
    #[serde(default, rename = "Integration")]
    pub integration: IntegrationParameters,
    #[serde(default, rename = "Merge")]
    pub merge: MergeParameters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default, rename = "DataReader")]
    pub data_reader: DataReaderParameters,
    #[serde(default, rename = "Experiment")]
    pub experiment: ExperimentSection,
}

/// The top-level section names `ExperimentConfig` expects, used to diff
/// against whatever keys a loaded YAML document actually had so missing
/// sections can be warned about individually rather than only as a whole.
const TOP_LEVEL_KEYS: [&str; 2] = ["DataReader", "Experiment"];

impl ExperimentConfig {
    /// Parses `contents` as YAML, logging a warning for every expected
    /// top-level key absent from the document (each falls back to its
    /// `Default`) before returning the fully-populated config. Parse
    /// failures (malformed YAML, a field with the wrong type) are returned
    /// as `Err`, not downgraded to a warning: those are not "missing key"
    /// cases.
    pub fn parse(contents: &str, logger: &crate::logging::LoggingContext) -> Result<Self> {
        let raw: serde_yaml::Value =
            serde_yaml::from_str(contents).context("failed to parse experiment config as YAML")?;

        if let serde_yaml::Value::Mapping(map) = &raw {
            for key in TOP_LEVEL_KEYS {
                let present = map
                    .keys()
                    .any(|k| k.as_str() == Some(key));
                if !present {
                    logger.warn(&format!(
                        "experiment config missing `{key}` section, using schema defaults"
                    ));
                }
            }
        }

        serde_yaml::from_value(raw).context("failed to deserialize experiment config")
    }

    pub fn load(path: impl AsRef<Path>, logger: &crate::logging::LoggingContext) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| OhklError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, logger)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let yaml = serde_yaml::to_string(self).context("failed to serialize experiment config")?;
        std::fs::write(path, yaml).map_err(|source| {
            OhklError::Io { path: path.to_path_buf(), source }
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LoggingContext;

    #[test]
    fn missing_sections_fall_back_to_defaults_with_warnings() {
        let logger = LoggingContext::new();
        let config = ExperimentConfig::parse("{}", &logger).unwrap();
        assert_eq!(config.experiment.peak_finder.min_size, PeakFinderParameters::default().min_size);
        assert_eq!(logger.warning_count(), TOP_LEVEL_KEYS.len());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let logger = LoggingContext::new();
        let yaml = "DataReader: {}\nExperiment: {}\nFutureFeature: {enabled: true}\n";
        let config = ExperimentConfig::parse(yaml, &logger).unwrap();
        assert_eq!(config.experiment.merge.n_shells, MergeParameters::default().n_shells);
        assert_eq!(logger.warning_count(), 0);
    }

    #[test]
    fn declared_values_override_defaults() {
        let logger = LoggingContext::new();
        let yaml = "Experiment:\n  Merge:\n    n_shells: 20\n";
        let config = ExperimentConfig::parse(yaml, &logger).unwrap();
        assert_eq!(config.experiment.merge.n_shells, 20);
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let logger = LoggingContext::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.yaml");
        let mut config = ExperimentConfig::default();
        config.experiment.merge.n_shells = 7;
        config.save(&path).unwrap();
        let loaded = ExperimentConfig::load(&path, &logger).unwrap();
        assert_eq!(loaded.experiment.merge.n_shells, 7);
    }
}
