use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ohkl_core::dataset::{DataSet, Frame};
use ohkl_core::geometry::{Matrix3, Vector3};
use ohkl_core::instrument::{DetectorGeometry, Diffractometer, InstrumentState};
use ohkl_core::integration::{self, IntegrationParameters, IntegratorKind};
use ohkl_core::peak::{Peak3D, PeakCollection, PeakCollectionKind};
use ohkl_core::progress::NullProgress;
use std::hint::black_box;

fn synthetic_dataset(n_frames: usize) -> DataSet {
    let geom = DetectorGeometry::new(256, 256, 100.0, 0.1, 0.1);
    let diff = Diffractometer::new("bench", geom);
    let mut dataset = DataSet::new("bench", diff);
    for _ in 0..n_frames {
        let mut frame = Frame::zeros(256, 256);
        for dy in -3i64..=3 {
            for dx in -3i64..=3 {
                frame.set((128 + dx) as usize, (128 + dy) as usize, 300);
            }
        }
        dataset.push_frame(frame, InstrumentState::new(1.0));
    }
    dataset
}

fn collection_with_peaks(n_peaks: usize, frame_span: usize) -> PeakCollection {
    let mut collection = PeakCollection::new("bench", PeakCollectionKind::Found);
    for i in 0..n_peaks {
        let frame = (i % frame_span) as f64 + 5.0;
        let shape = ohkl_core::geometry::Ellipsoid::new(Vector3::new(128.0, 128.0, frame), Matrix3::identity() / 9.0);
        collection.push(Peak3D::new(shape, 0));
    }
    collection
}

fn bench_integration(c: &mut Criterion) {
    let mut group = c.benchmark_group("Integration Peak Counts");

    for &n_peaks in &[10usize, 50, 200] {
        group.bench_with_input(BenchmarkId::from_parameter(n_peaks), &n_peaks, |b, &n_peaks| {
            let dataset = synthetic_dataset(20);
            let params = IntegrationParameters::default();

            b.iter_batched(
                || collection_with_peaks(n_peaks, 10),
                |mut collection| {
                    integration::integrate(
                        black_box(&dataset),
                        black_box(&mut collection),
                        IntegratorKind::PixelSum { discard_saturated: true, max_counts: 1_000_000 },
                        None,
                        black_box(&params),
                        &NullProgress,
                    );
                    black_box(&collection);
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_integration);
criterion_main!(benches);
