use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ohkl_core::autoindex::{self, IndexerParameters};
use ohkl_core::dataset::{DataSet, Frame};
use ohkl_core::instrument::{DetectorGeometry, Diffractometer, InstrumentState};
use ohkl_core::predict::{self, PredictorParameters};
use ohkl_core::spacegroup::SpaceGroup;
use ohkl_core::unitcell::{CellCharacter, UnitCell};
use std::hint::black_box;

fn synthetic_dataset(n_frames: usize) -> DataSet {
    let geom = DetectorGeometry::new(512, 512, 100.0, 0.1, 0.1);
    let diff = Diffractometer::new("bench", geom);
    let mut dataset = DataSet::new("bench", diff);
    for i in 0..n_frames {
        let mut state = InstrumentState::new(1.0);
        let omega = (i as f64) * (360.0 / n_frames as f64).to_radians();
        state.sample_orientation = nalgebra::UnitQuaternion::from_axis_angle(&nalgebra::Vector3::z_axis(), omega);
        dataset.push_frame(Frame::zeros(512, 512), state);
    }
    dataset
}

fn reference_cell() -> UnitCell {
    UnitCell::from_character(
        CellCharacter { a: 50.0, b: 55.0, c: 60.0, alpha: 90.0, beta: 90.0, gamma: 90.0 },
        SpaceGroup::p212121(),
    )
}

fn bench_autoindexer(c: &mut Criterion) {
    let mut group = c.benchmark_group("Autoindex Peak Counts");

    for &d_min in &[8.0, 5.0, 3.0] {
        group.bench_with_input(BenchmarkId::new("d_min", d_min), &d_min, |b, &d_min| {
            let dataset = synthetic_dataset(36);
            let cell = reference_cell();
            let predictor_params = PredictorParameters { d_min, d_max: 50.0, ..Default::default() };
            let peaks = predict::predict(&dataset, 0, &cell, 0, &predictor_params);
            let params = IndexerParameters { n_vertices: 2000, subdiv: 15, ..Default::default() };

            b.iter(|| {
                let solutions = autoindex::autoindex(black_box(&peaks), black_box(&dataset), black_box(&params));
                black_box(solutions);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_autoindexer);
criterion_main!(benches);
