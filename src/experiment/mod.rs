//! The experiment orchestrator (component M of `SPEC_FULL.md` §2, §9):
//! ties the handlers together with the per-stage free functions
//! (`finder::find`, `autoindex::autoindex`, `predict::predict`,
//! `shape::ShapeModel`, `refine::refine`, `integration::integrate`,
//! `merge::merge_peaks`) into the sequence an end-to-end reduction run
//! follows.

pub mod handlers;

use crate::autoindex::{self, IndexerParameters, RankedSolution};
use crate::dataset::DataSet;
use crate::error::Result;
use crate::finder::{self, PeakFinderParameters};
use crate::integration::{self, IntegrationParameters, IntegratorKind};
use crate::logging::LoggingContext;
use crate::merge::{self, MergeParameters, MergedPeakCollection};
use crate::peak::{CellId, DataSetId, PeakCollection, PeakCollectionKind};
use crate::predict::{self, PredictorParameters};
use crate::progress::ProgressSink;
use crate::refine::{self, BatchSpan, RefinerParameters};
use crate::shape::{ShapeModel, ShapeModelParameters};
use crate::spacegroup::SpaceGroup;
use crate::unitcell::UnitCell;
use handlers::{DataHandler, PeakHandler, ShapeHandler, UnitCellHandler};

/// Both integrated-intensity views of a merge, computed against the same
/// symmetry-equivalent grouping so their statistics are directly
/// comparable (`SPEC_FULL.md` §9: the merger tracks sum- and
/// profile-integrated collections side by side instead of picking one).
pub struct MergeReport {
    pub sum: Vec<MergedPeakCollection>,
    pub profile: Vec<MergedPeakCollection>,
}

impl MergeReport {
    /// The highest completeness reached by either view across all
    /// shells, given the expected unique reflection count per shell
    /// (computed by the caller from the space group multiplicity and
    /// shell volume).
    pub fn max_completeness(&self, expected_per_shell: &[usize]) -> f64 {
        self.sum
            .iter()
            .chain(self.profile.iter())
            .zip(expected_per_shell.iter().chain(expected_per_shell.iter()))
            .map(|(shell, &expected)| shell.completeness(expected))
            .fold(0.0, f64::max)
    }
}

/// Owns every dataset, unit cell, peak collection and shape model built
/// during a reduction run, plus the logging context threaded through
/// every stage.
pub struct Experiment {
    pub name: String,
    pub logger: LoggingContext,
    data: DataHandler,
    cells: UnitCellHandler,
    peaks: PeakHandler,
    shapes: ShapeHandler,
}

impl Experiment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            logger: LoggingContext::new(),
            data: DataHandler::new(),
            cells: UnitCellHandler::new(),
            peaks: PeakHandler::new(),
            shapes: ShapeHandler::new(),
        }
    }

    pub fn data(&self) -> &DataHandler {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut DataHandler {
        &mut self.data
    }

    pub fn cells(&self) -> &UnitCellHandler {
        &self.cells
    }

    pub fn cells_mut(&mut self) -> &mut UnitCellHandler {
        &mut self.cells
    }

    pub fn peaks(&self) -> &PeakHandler {
        &self.peaks
    }

    pub fn peaks_mut(&mut self) -> &mut PeakHandler {
        &mut self.peaks
    }

    pub fn shapes(&self) -> &ShapeHandler {
        &self.shapes
    }

    pub fn shapes_mut(&mut self) -> &mut ShapeHandler {
        &mut self.shapes
    }

    pub fn add_dataset(&mut self, dataset: DataSet) -> DataSetId {
        self.data.add(dataset)
    }

    /// Runs the peak finder over `dataset_id`'s frames and stores the
    /// result as a new `Found` collection named `collection_name`.
    pub fn find_peaks(
        &mut self,
        dataset_id: DataSetId,
        collection_name: impl Into<String>,
        params: &PeakFinderParameters,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        let dataset = self.data.get(dataset_id)?;
        let found = finder::find(dataset, dataset_id, params, progress);
        let mut collection = PeakCollection::new(collection_name, PeakCollectionKind::Found);
        for peak in found {
            collection.push(peak);
        }
        self.logger.info(&format!("{}: found {} peaks", self.name, collection.len()));
        self.peaks.add(collection);
        Ok(())
    }

    /// Runs autoindexing against `collection_name`'s peaks.
    pub fn autoindex(&self, collection_name: &str, dataset_id: DataSetId, params: &IndexerParameters) -> Result<Vec<RankedSolution>> {
        let collection = self.peaks.get(collection_name)?;
        let dataset = self.data.get(dataset_id)?;
        Ok(autoindex::autoindex(collection.peaks(), dataset, params))
    }

    /// Accepts a candidate unit cell into the experiment's cell arena,
    /// returning the id other stages reference it by.
    pub fn accept_cell(&mut self, cell: UnitCell) -> CellId {
        self.cells.add(cell)
    }

    /// Assigns Miller indices to every enabled peak in `collection_name`
    /// whose `q` falls within `tolerance` of an integer `hkl` under
    /// `cell_id`'s UB matrix, and binds the cell id onto each peak that
    /// is indexed.
    pub fn index_collection(&mut self, collection_name: &str, cell_id: CellId, tolerance: f64) -> Result<()> {
        let cell = self.cells.get(cell_id)?.clone();
        let data = &self.data;
        let collection = self.peaks.get_mut(collection_name)?;
        for peak in collection.peaks_mut() {
            if !peak.enabled() {
                continue;
            }
            let Ok(dataset) = data.get(peak.dataset) else { continue };
            let center = peak.center();
            let Some(state) = dataset.state(center.z.round().max(0.0) as usize) else { continue };
            let q = state.sample_q(&dataset.diffractometer.detector, center.x, center.y);
            let (h, k, l, residual) = cell.hkl(q);
            peak.hkl_residual = residual;
            if residual <= tolerance {
                peak.miller_index = Some((h.round() as i32, k.round() as i32, l.round() as i32));
                peak.cell = Some(cell_id);
            }
        }
        collection.indexed = true;
        Ok(())
    }

    /// Builds a shape model from `collection_name`'s enabled peaks
    /// (scanning each peak's own detector frames in `dataset_id`) and
    /// stores it under `name`, also recording the derived Kabsch sigmas
    /// on the source collection.
    pub fn build_shape_model(&mut self, name: impl Into<String>, dataset_id: DataSetId, collection_name: &str, params: ShapeModelParameters, strength_min: f64) -> Result<()> {
        let dataset = self.data.get(dataset_id)?;
        let collection = self.peaks.get_mut(collection_name)?;
        let model = ShapeModel::build(dataset, collection, params, strength_min);
        collection.set_kabsch_sigmas(model.sigma_d, model.sigma_m);
        self.shapes.add(name, model);
        Ok(())
    }

    /// Predicts peaks for `cell_id` over `dataset_id`'s frame range and
    /// stores them as a new `Predicted` collection named
    /// `collection_name`.
    pub fn predict_peaks(&mut self, collection_name: impl Into<String>, dataset_id: DataSetId, cell_id: CellId, params: &PredictorParameters) -> Result<()> {
        let dataset = self.data.get(dataset_id)?;
        let cell = self.cells.get(cell_id)?;
        let predicted = predict::predict(dataset, dataset_id, cell, cell_id, params);
        let mut collection = PeakCollection::new(collection_name, PeakCollectionKind::Predicted);
        for peak in predicted {
            collection.push(peak);
        }
        self.logger.info(&format!("{}: predicted {} peaks", self.name, collection.len()));
        self.peaks.add(collection);
        Ok(())
    }

    /// Assigns shapes from `shape_name`'s model onto `collection_name`'s
    /// peaks.
    pub fn assign_shapes(&mut self, shape_name: &str, collection_name: &str) -> Result<()> {
        let model = self.shapes.get(shape_name)?;
        let collection = self.peaks.get_mut(collection_name)?;
        model.assign_shapes(collection.peaks_mut());
        Ok(())
    }

    /// Refines `cell_id` and `dataset_id`'s instrument states against
    /// `collection_name`'s indexed peaks. Returns whether every batch
    /// converged plus the per-batch spans, which the caller can feed to
    /// [`Self::update_predictions`] for any other collection built
    /// against the same dataset/cell.
    pub fn refine(
        &mut self,
        dataset_id: DataSetId,
        collection_name: &str,
        cell_id: CellId,
        params: &RefinerParameters,
        progress: &dyn ProgressSink,
    ) -> Result<(bool, Vec<BatchSpan>)> {
        let collection = self.peaks.get(collection_name)?;
        let peak_snapshot = collection.peaks().to_vec();
        let dataset = self.data.get_mut(dataset_id)?;
        let cell = self.cells.get_mut(cell_id)?;
        let (ok, spans) = refine::refine(dataset, &peak_snapshot, cell, params, progress);
        if !ok {
            self.logger.warn(&format!("{}: refinement failed, rolled back", self.name));
        }
        Ok((ok, spans))
    }

    /// Re-centres `collection_name`'s predicted peaks from a prior
    /// [`Self::refine`] call's batch spans.
    pub fn update_predictions(&mut self, collection_name: &str, dataset_id: DataSetId, spans: &[BatchSpan]) -> Result<usize> {
        let dataset = self.data.get(dataset_id)?.clone();
        let collection = self.peaks.get_mut(collection_name)?;
        Ok(refine::update_predictions(collection.peaks_mut(), spans, &dataset))
    }

    /// Integrates `collection_name`'s enabled peaks against
    /// `dataset_id`'s frames, optionally guided by `shape_name`'s shape
    /// model (required for `IntegratorKind::Profile1D`/`Profile3D`).
    pub fn integrate(
        &mut self,
        dataset_id: DataSetId,
        collection_name: &str,
        kind: IntegratorKind,
        shape_name: Option<&str>,
        params: &IntegrationParameters,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        let dataset = self.data.get(dataset_id)?;
        let shape_model = shape_name.map(|n| self.shapes.get(n)).transpose()?;
        let collection = self.peaks.get_mut(collection_name)?;
        integration::integrate(dataset, collection, kind, shape_model, params, progress);
        Ok(())
    }

    /// Merges the named collections under `space_group`'s symmetry,
    /// computing both sum- and profile-integrated views split into
    /// `params.n_shells` resolution shells.
    pub fn merge(&self, collection_names: &[&str], space_group: &SpaceGroup, cell_id: CellId, params: &MergeParameters) -> Result<MergeReport> {
        let cell = self.cells.get(cell_id)?;
        let collections: Vec<&PeakCollection> = collection_names.iter().map(|n| self.peaks.get(n)).collect::<Result<_>>()?;

        let mut sum_params = *params;
        sum_params.use_profile_intensity = false;
        let mut profile_params = *params;
        profile_params.use_profile_intensity = true;

        let sum_merged = merge::merge_peaks(space_group, &collections, &sum_params);
        let profile_merged = merge::merge_peaks(space_group, &collections, &profile_params);

        let d_of_hkl = |hkl: (i32, i32, i32)| -> f64 {
            let hkl_vec = crate::geometry::Vector3::new(hkl.0 as f64, hkl.1 as f64, hkl.2 as f64);
            let norm = (cell.ub() * hkl_vec).norm();
            if norm > 0.0 {
                2.0 * std::f64::consts::PI / norm
            } else {
                0.0
            }
        };

        let sum = merge::split_shells(sum_merged, params.d_min, params.d_max, params.n_shells, d_of_hkl);
        let profile = merge::split_shells(profile_merged, params.d_min, params.d_max, params.n_shells, d_of_hkl);
        Ok(MergeReport { sum, profile })
    }

    /// Serialises this experiment to an `.ohkl` archive, gated by the
    /// `archive` Cargo feature. See [`crate::archive`].
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        crate::archive::Archive::save(self, path.as_ref())
    }

    /// Loads an experiment previously written by [`Self::save_to_file`].
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        crate::archive::Archive::load(path.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Frame;
    use crate::instrument::{DetectorGeometry, Diffractometer, InstrumentState};
    use crate::progress::NullProgress;
    use crate::spacegroup::SpaceGroup;
    use crate::unitcell::CellCharacter;

    fn dataset_with_spot() -> DataSet {
        let geom = DetectorGeometry::new(60, 60, 100.0, 0.1, 0.1);
        let diff = Diffractometer::new("test", geom);
        let mut ds = DataSet::new("ds", diff);
        for _ in 0..3 {
            let mut frame = Frame::zeros(60, 60);
            for dy in -2i64..=2 {
                for dx in -2i64..=2 {
                    let x = (30 + dx) as usize;
                    let y = (30 + dy) as usize;
                    frame.set(x, y, 200);
                }
            }
            ds.push_frame(frame, InstrumentState::new(1.0));
        }
        ds
    }

    #[test]
    fn find_peaks_populates_a_named_collection() {
        let mut experiment = Experiment::new("test");
        let dataset_id = experiment.add_dataset(dataset_with_spot());
        let params = PeakFinderParameters { min_size: 1, max_size: 1000, ..Default::default() };
        experiment.find_peaks(dataset_id, "found", &params, &NullProgress).unwrap();
        assert!(experiment.peaks().get("found").unwrap().len() > 0);
    }

    #[test]
    fn index_collection_sets_miller_indices_within_tolerance() {
        let mut experiment = Experiment::new("test");
        let dataset_id = experiment.add_dataset(dataset_with_spot());
        let cell = UnitCell::from_character(
            CellCharacter { a: 50.0, b: 55.0, c: 60.0, alpha: 90.0, beta: 90.0, gamma: 90.0 },
            SpaceGroup::p212121(),
        );
        let cell_id = experiment.accept_cell(cell);
        let params = PeakFinderParameters { min_size: 1, max_size: 1000, ..Default::default() };
        experiment.find_peaks(dataset_id, "found", &params, &NullProgress).unwrap();
        experiment.index_collection("found", cell_id, 1e6).unwrap();
        assert!(experiment.peaks().get("found").unwrap().peaks().iter().all(|p| p.miller_index.is_some()));
    }

    #[test]
    fn unknown_collection_name_errors() {
        let experiment = Experiment::new("test");
        assert!(experiment.peaks().get("missing").is_err());
    }
}
