//! `.ohkl` archive persistence (component T of `SPEC_FULL.md` §6): a
//! single HDF5 file holding every dataset's frames and instrument
//! states, every accepted unit cell, and every named peak collection,
//! gated behind the `archive` Cargo feature since it requires a system
//! HDF5 installation.
//!
//! Large numeric payloads (frame pixel counts) go into native HDF5
//! datasets; everything else is round-tripped through `serde_json` and
//! stored as a single variable-length string dataset per entity, the
//! same split the rest of the crate already draws between `io::reader`
//! (bulk binary frames) and `config`/`io::writer` (structured text).

use crate::error::{OhklError, Result};
use crate::experiment::Experiment;
use std::path::Path;

pub struct Archive;

impl Archive {
    #[cfg(feature = "archive")]
    pub fn save(experiment: &Experiment, path: &Path) -> Result<()> {
        backend::save(experiment, path)
    }

    #[cfg(not(feature = "archive"))]
    pub fn save(_experiment: &Experiment, _path: &Path) -> Result<()> {
        Err(OhklError::FeatureDisabled("archive").into())
    }

    #[cfg(feature = "archive")]
    pub fn load(path: &Path) -> Result<Experiment> {
        backend::load(path)
    }

    #[cfg(not(feature = "archive"))]
    pub fn load(_path: &Path) -> Result<Experiment> {
        Err(OhklError::FeatureDisabled("archive").into())
    }
}

#[cfg(feature = "archive")]
mod backend {
    use super::*;
    use crate::dataset::{DataSet, DataSetMetadata, Frame};
    use crate::instrument::{Diffractometer, InstrumentState};
    use crate::peak::{DataSetId, PeakCollection};
    use crate::unitcell::UnitCell;
    use hdf5::types::VarLenUnicode;
    use hdf5::File as H5File;

    fn write_json<T: serde::Serialize>(group: &hdf5::Group, name: &str, value: &T) -> Result<()> {
        let text = serde_json::to_string(value).map_err(|e| OhklError::Archive(e.to_string()))?;
        let unicode: VarLenUnicode = text.parse().map_err(|_| OhklError::Archive("non-UTF8 json blob".into()))?;
        group
            .new_dataset_builder()
            .with_data(&[unicode])
            .create(name)
            .map_err(|e| OhklError::Archive(e.to_string()))?;
        Ok(())
    }

    fn read_json<T: serde::de::DeserializeOwned>(group: &hdf5::Group, name: &str) -> Result<T> {
        let dataset = group.dataset(name).map_err(|e| OhklError::Archive(e.to_string()))?;
        let values = dataset.read_1d::<VarLenUnicode>().map_err(|e| OhklError::Archive(e.to_string()))?;
        let text = values.get(0).ok_or_else(|| OhklError::Archive(format!("{name}: empty string dataset")))?;
        serde_json::from_str(text.as_str()).map_err(|e| OhklError::Archive(e.to_string()))
    }

    fn write_dataset_group(parent: &hdf5::Group, id: DataSetId, dataset: &DataSet) -> Result<()> {
        let group = parent.create_group(&id.to_string()).map_err(|e| OhklError::Archive(e.to_string()))?;
        write_json(&group, "name", &dataset.name)?;
        write_json(&group, "diffractometer", &dataset.diffractometer)?;
        write_json(&group, "metadata", &dataset.metadata)?;
        write_json(&group, "masks", &dataset.masks)?;
        write_json(&group, "instrument_states", &dataset.states().to_vec())?;

        let (nrows, ncols) = dataset.frame(0).map(|f| (f.nrows, f.ncols)).unwrap_or((0, 0));
        let mut counts: Vec<u32> = Vec::with_capacity(dataset.len() * nrows * ncols);
        for frame in dataset.frames() {
            counts.extend_from_slice(frame.as_slice());
        }
        group
            .new_dataset_builder()
            .with_data(&counts)
            .create("frames")
            .map_err(|e| OhklError::Archive(e.to_string()))?;
        for (attr_name, value) in [("n_frames", dataset.len()), ("nrows", nrows), ("ncols", ncols)] {
            group
                .new_attr::<usize>()
                .create(attr_name)
                .map_err(|e| OhklError::Archive(e.to_string()))?
                .write_scalar(&value)
                .map_err(|e| OhklError::Archive(e.to_string()))?;
        }
        Ok(())
    }

    fn read_dataset_group(group: &hdf5::Group) -> Result<DataSet> {
        let name: String = read_json(group, "name")?;
        let diffractometer: Diffractometer = read_json(group, "diffractometer")?;
        let metadata: DataSetMetadata = read_json(group, "metadata")?;
        let masks: Vec<crate::dataset::Mask> = read_json(group, "masks")?;
        let states: Vec<InstrumentState> = read_json(group, "instrument_states")?;

        let n_frames: usize = group.attr("n_frames").and_then(|a| a.read_scalar()).map_err(|e| OhklError::Archive(e.to_string()))?;
        let nrows: usize = group.attr("nrows").and_then(|a| a.read_scalar()).map_err(|e| OhklError::Archive(e.to_string()))?;
        let ncols: usize = group.attr("ncols").and_then(|a| a.read_scalar()).map_err(|e| OhklError::Archive(e.to_string()))?;
        let raw = group.dataset("frames").map_err(|e| OhklError::Archive(e.to_string()))?;
        let counts = raw.read_1d::<u32>().map_err(|e| OhklError::Archive(e.to_string()))?;

        let mut dataset = DataSet::new(name, diffractometer);
        dataset.metadata = metadata;
        dataset.masks = masks;
        for i in 0..n_frames {
            let start = i * nrows * ncols;
            let end = start + nrows * ncols;
            let frame = Frame::from_counts(nrows, ncols, counts.as_slice().unwrap()[start..end].to_vec())?;
            let state = states.get(i).cloned().unwrap_or_else(|| InstrumentState::new(1.0));
            dataset.push_frame(frame, state);
        }
        Ok(dataset)
    }

    pub fn save(experiment: &Experiment, path: &Path) -> Result<()> {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| OhklError::Archive(e.to_string()))?;
        {
            let file = H5File::create(tmp.path()).map_err(|e| OhklError::Archive(e.to_string()))?;
            write_json(&file, "name", &experiment.name)?;

            let data_group = file.create_group("Data").map_err(|e| OhklError::Archive(e.to_string()))?;
            for (id, dataset) in experiment.data().iter() {
                write_dataset_group(&data_group, *id, dataset)?;
            }

            let cells_group = file.create_group("UnitCells").map_err(|e| OhklError::Archive(e.to_string()))?;
            for (id, cell) in experiment.cells().iter() {
                write_json(&cells_group, &id.to_string(), cell)?;
            }

            let peaks_group = file.create_group("Peaks").map_err(|e| OhklError::Archive(e.to_string()))?;
            for (name, collection) in experiment.peaks().iter() {
                write_json(&peaks_group, name, collection)?;
            }
        }
        tmp.persist(path).map_err(|e| OhklError::Archive(e.error.to_string()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Experiment> {
        let file = H5File::open(path).map_err(|e| OhklError::Archive(e.to_string()))?;
        let name: String = read_json(&file, "name")?;
        let mut experiment = Experiment::new(name);

        let data_group = file.group("Data").map_err(|e| OhklError::Archive(e.to_string()))?;
        for member in data_group.member_names().map_err(|e| OhklError::Archive(e.to_string()))? {
            let group = data_group.group(&member).map_err(|e| OhklError::Archive(e.to_string()))?;
            let dataset = read_dataset_group(&group)?;
            experiment.data_mut().add(dataset);
        }

        let cells_group = file.group("UnitCells").map_err(|e| OhklError::Archive(e.to_string()))?;
        for member in cells_group.member_names().map_err(|e| OhklError::Archive(e.to_string()))? {
            let cell: UnitCell = read_json(&cells_group, &member)?;
            experiment.cells_mut().add(cell);
        }

        let peaks_group = file.group("Peaks").map_err(|e| OhklError::Archive(e.to_string()))?;
        for member in peaks_group.member_names().map_err(|e| OhklError::Archive(e.to_string()))? {
            let collection: PeakCollection = read_json(&peaks_group, &member)?;
            experiment.peaks_mut().add(collection);
        }

        Ok(experiment)
    }
}

#[cfg(all(test, feature = "archive"))]
mod tests {
    use super::*;
    use crate::dataset::Frame;
    use crate::instrument::{DetectorGeometry, InstrumentState};

    fn sample_experiment() -> Experiment {
        let mut experiment = Experiment::new("roundtrip");
        let geom = DetectorGeometry::new(8, 8, 100.0, 0.1, 0.1);
        let diff = Diffractometer::new("test", geom);
        let mut ds = DataSet::new("ds1", diff);
        ds.push_frame(Frame::zeros(8, 8), InstrumentState::new(1.0));
        experiment.add_dataset(ds);
        experiment
    }

    #[test]
    fn save_then_load_round_trips_dataset_count() {
        let experiment = sample_experiment();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.ohkl");
        Archive::save(&experiment, &path).unwrap();
        let loaded = Archive::load(&path).unwrap();
        assert_eq!(loaded.data().len(), experiment.data().len());
    }
}

#[cfg(all(test, not(feature = "archive")))]
mod disabled_tests {
    use super::*;

    #[test]
    fn save_without_feature_reports_disabled() {
        let experiment = Experiment::new("x");
        let err = Archive::save(&experiment, Path::new("/tmp/x.ohkl")).unwrap_err();
        assert!(err.to_string().contains("archive"));
    }
}
