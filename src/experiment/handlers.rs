//! Arena-plus-index handlers (`SPEC_FULL.md` §9 redesign): each handler
//! owns a collection of entities keyed by an opaque id or name, so peaks
//! and other cross-referencing structures can hold a cheap `Copy` handle
//! instead of a shared-pointer cycle back into the owning `Experiment`.

use crate::dataset::DataSet;
use crate::error::{OhklError, Result};
use crate::peak::{CellId, DataSetId, PeakCollection};
use crate::shape::ShapeModel;
use crate::unitcell::UnitCell;
use std::collections::HashMap;

/// Owns every `DataSet` added to an experiment, indexed by an
/// incrementing `DataSetId`.
#[derive(Debug, Clone, Default)]
pub struct DataHandler {
    datasets: HashMap<DataSetId, DataSet>,
    next_id: DataSetId,
}

impl DataHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, dataset: DataSet) -> DataSetId {
        let id = self.next_id;
        self.next_id += 1;
        self.datasets.insert(id, dataset);
        id
    }

    pub fn get(&self, id: DataSetId) -> Result<&DataSet> {
        self.datasets.get(&id).ok_or_else(|| OhklError::UnknownDataSet(id).into())
    }

    pub fn get_mut(&mut self, id: DataSetId) -> Result<&mut DataSet> {
        self.datasets.get_mut(&id).ok_or_else(|| OhklError::UnknownDataSet(id).into())
    }

    pub fn ids(&self) -> impl Iterator<Item = DataSetId> + '_ {
        self.datasets.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DataSetId, &DataSet)> {
        self.datasets.iter()
    }
}

/// Owns every `UnitCell` accepted into an experiment (typically from
/// autoindexing), indexed by an incrementing `CellId`. Reassigning a
/// peak's cell is a `CellId` write, never a deep copy.
#[derive(Debug, Clone, Default)]
pub struct UnitCellHandler {
    cells: HashMap<CellId, UnitCell>,
    next_id: CellId,
}

impl UnitCellHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, cell: UnitCell) -> CellId {
        let id = self.next_id;
        self.next_id += 1;
        self.cells.insert(id, cell);
        id
    }

    pub fn get(&self, id: CellId) -> Result<&UnitCell> {
        self.cells.get(&id).ok_or_else(|| OhklError::UnknownCell(id).into())
    }

    pub fn get_mut(&mut self, id: CellId) -> Result<&mut UnitCell> {
        self.cells.get_mut(&id).ok_or_else(|| OhklError::UnknownCell(id).into())
    }

    pub fn ids(&self) -> impl Iterator<Item = CellId> + '_ {
        self.cells.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CellId, &UnitCell)> {
        self.cells.iter()
    }
}

/// Owns every named `PeakCollection` in an experiment (found, predicted
/// or library sets).
#[derive(Debug, Clone, Default)]
pub struct PeakHandler {
    collections: HashMap<String, PeakCollection>,
}

impl PeakHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, collection: PeakCollection) {
        self.collections.insert(collection.name.clone(), collection);
    }

    pub fn get(&self, name: &str) -> Result<&PeakCollection> {
        self.collections.get(name).ok_or_else(|| OhklError::UnknownCollection(name.to_string()).into())
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut PeakCollection> {
        self.collections.get_mut(name).ok_or_else(|| OhklError::UnknownCollection(name.to_string()).into())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PeakCollection)> {
        self.collections.iter()
    }

    pub fn remove(&mut self, name: &str) -> Option<PeakCollection> {
        self.collections.remove(name)
    }
}

/// Owns every named `ShapeModel` built in an experiment, typically one
/// per peak collection it was learned from.
#[derive(Debug, Default)]
pub struct ShapeHandler {
    models: HashMap<String, ShapeModel>,
}

impl ShapeHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, model: ShapeModel) {
        self.models.insert(name.into(), model);
    }

    pub fn get(&self, name: &str) -> Result<&ShapeModel> {
        self.models.get(name).ok_or_else(|| OhklError::UnknownCollection(name.to_string()).into())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }
}

/// A thin facade over [`DataHandler`] for the per-dataset instrument
/// state list, named separately since the original kept instrument
/// states as a handler distinct from the dataset store; here the state
/// list stays owned by its `DataSet` (`SPEC_FULL.md` §9, Open Question
/// 1), so this handler only forwards.
pub struct InstrumentStateHandler;

impl InstrumentStateHandler {
    pub fn states<'a>(data: &'a DataHandler, dataset_id: DataSetId) -> Result<&'a [crate::instrument::InstrumentState]> {
        Ok(data.get(dataset_id)?.states())
    }

    pub fn states_mut(data: &mut DataHandler, dataset_id: DataSetId) -> Result<&mut crate::instrument::InstrumentStateList> {
        Ok(data.get_mut(dataset_id)?.states_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{DetectorGeometry, Diffractometer};
    use crate::spacegroup::SpaceGroup;
    use crate::unitcell::CellCharacter;

    fn dataset() -> DataSet {
        let geom = DetectorGeometry::new(16, 16, 100.0, 0.1, 0.1);
        DataSet::new("ds", Diffractometer::new("test", geom))
    }

    #[test]
    fn data_handler_assigns_increasing_ids() {
        let mut handler = DataHandler::new();
        let a = handler.add(dataset());
        let b = handler.add(dataset());
        assert_ne!(a, b);
        assert!(handler.get(a).is_ok());
        assert!(handler.get(b).is_ok());
    }

    #[test]
    fn data_handler_unknown_id_errors() {
        let handler = DataHandler::new();
        assert!(handler.get(99).is_err());
    }

    #[test]
    fn cell_handler_round_trips_cell() {
        let mut handler = UnitCellHandler::new();
        let cell = UnitCell::from_character(
            CellCharacter { a: 50.0, b: 55.0, c: 60.0, alpha: 90.0, beta: 90.0, gamma: 90.0 },
            SpaceGroup::p212121(),
        );
        let id = handler.add(cell);
        assert!(handler.get(id).is_ok());
        assert!(handler.get(id + 1).is_err());
    }

    #[test]
    fn peak_handler_looks_up_by_name() {
        let mut handler = PeakHandler::new();
        handler.add(PeakCollection::new("found", crate::peak::PeakCollectionKind::Found));
        assert!(handler.get("found").is_ok());
        assert!(handler.get("missing").is_err());
    }
}
