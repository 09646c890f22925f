//! End-to-end reduction pipeline: find -> index -> predict -> integrate ->
//! merge, against a small synthetic dataset. Checks the algorithmic
//! invariants `SPEC_FULL.md` §8 describes (monotonic shells, non-negative
//! counts, indexed peaks carry Miller indices) rather than literal counts,
//! which require the real (unshipped) trypsin dataset to reproduce.

use ohkl_core::dataset::{DataSet, Frame};
use ohkl_core::experiment::Experiment;
use ohkl_core::finder::PeakFinderParameters;
use ohkl_core::instrument::{DetectorGeometry, Diffractometer, InstrumentState};
use ohkl_core::integration::{IntegrationParameters, IntegratorKind};
use ohkl_core::merge::MergeParameters;
use ohkl_core::predict::PredictorParameters;
use ohkl_core::progress::NullProgress;
use ohkl_core::spacegroup::SpaceGroup;
use ohkl_core::unitcell::{CellCharacter, UnitCell};

fn synthetic_dataset() -> DataSet {
    let geom = DetectorGeometry::new(256, 256, 100.0, 0.2, 0.2);
    let diff = Diffractometer::new("synthetic", geom);
    let mut dataset = DataSet::new("synthetic", diff);

    for i in 0..30 {
        let mut frame = Frame::zeros(256, 256);
        for y in 0..256 {
            for x in 0..256 {
                frame.set(x, y, 40);
            }
        }
        for dy in -3i64..=3 {
            for dx in -3i64..=3 {
                frame.set((128 + dx) as usize, (128 + dy) as usize, 400);
            }
        }
        let mut state = InstrumentState::new(1.0);
        let omega = (i as f64) * (360.0 / 30.0).to_radians();
        state.sample_orientation = nalgebra::UnitQuaternion::from_axis_angle(&nalgebra::Vector3::z_axis(), omega);
        dataset.push_frame(frame, state);
    }
    dataset
}

fn reference_cell() -> UnitCell {
    UnitCell::from_character(
        CellCharacter { a: 50.0, b: 55.0, c: 60.0, alpha: 90.0, beta: 90.0, gamma: 90.0 },
        SpaceGroup::p212121(),
    )
}

#[test]
fn full_pipeline_runs_and_respects_invariants() {
    let mut experiment = Experiment::new("synthetic-run");
    let dataset_id = experiment.add_dataset(synthetic_dataset());

    let finder_params = PeakFinderParameters { min_size: 5, max_size: 5000, ..Default::default() };
    experiment.find_peaks(dataset_id, "found", &finder_params, &NullProgress).unwrap();
    assert!(experiment.peaks().get("found").unwrap().len() > 0, "expected the bright spot to be found");

    let cell_id = experiment.accept_cell(reference_cell());
    experiment.index_collection("found", cell_id, f64::INFINITY).unwrap();
    assert!(experiment.peaks().get("found").unwrap().indexed);
    for peak in experiment.peaks().get("found").unwrap().peaks() {
        assert!(peak.miller_index.is_some(), "index_collection must assign every enabled peak an hkl");
    }

    let predictor_params = PredictorParameters { d_min: 15.0, d_max: 50.0, ..Default::default() };
    experiment.predict_peaks("predicted", dataset_id, cell_id, &predictor_params).unwrap();
    let predicted_count = experiment.peaks().get("predicted").unwrap().len();
    assert!(predicted_count > 0, "expected at least one predicted reflection in range");
    for peak in experiment.peaks().get("predicted").unwrap().peaks() {
        assert!(peak.miller_index.is_some());
        assert_eq!(peak.cell, Some(cell_id));
    }

    let integration_params = IntegrationParameters::default();
    experiment
        .integrate(
            dataset_id,
            "predicted",
            IntegratorKind::PixelSum { discard_saturated: true, max_counts: 1_000_000 },
            None,
            &integration_params,
            &NullProgress,
        )
        .unwrap();

    for peak in experiment.peaks().get("predicted").unwrap().peaks() {
        if peak.enabled() {
            assert!(peak.sum_intensity.sigma >= 0.0);
        }
    }

    let space_group = SpaceGroup::p212121();
    let merge_params = MergeParameters { n_shells: 4, d_min: 15.0, d_max: 50.0, ..Default::default() };
    let report = experiment.merge(&["predicted"], &space_group, cell_id, &merge_params).unwrap();

    assert_eq!(report.sum.len(), 4);
    assert_eq!(report.profile.len(), 4);
    for shell in &report.sum {
        assert!(shell.d_min <= shell.d_max, "each shell's resolution bounds must be ordered");
        assert!(shell.r_merge().is_nan() || shell.r_merge() >= 0.0);
        assert!(shell.completeness(shell.peaks.len().max(1)) >= 0.0);
    }
    for pair in report.sum.windows(2) {
        assert!(pair[0].d_max >= pair[1].d_max, "shells must be ordered from low to high resolution");
    }
}

#[test]
fn accepting_a_cell_assigns_increasing_ids() {
    let mut experiment = Experiment::new("ids");
    let a = experiment.accept_cell(reference_cell());
    let b = experiment.accept_cell(reference_cell());
    assert_ne!(a, b);
    assert!(experiment.cells().get(a).is_ok());
    assert!(experiment.cells().get(b).is_ok());
}
