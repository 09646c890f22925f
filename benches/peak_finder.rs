use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ohkl_core::dataset::{DataSet, Frame};
use ohkl_core::finder::{self, PeakFinderParameters};
use ohkl_core::instrument::{DetectorGeometry, Diffractometer, InstrumentState};
use ohkl_core::progress::NullProgress;
use std::hint::black_box;

fn synthetic_dataset(detector_size: usize, n_frames: usize, n_spots: usize) -> DataSet {
    let geom = DetectorGeometry::new(detector_size, detector_size, 100.0, 0.1, 0.1);
    let diff = Diffractometer::new("bench", geom);
    let mut dataset = DataSet::new("bench", diff);

    for frame_idx in 0..n_frames {
        let mut frame = Frame::zeros(detector_size, detector_size);
        for spot in 0..n_spots {
            let cx = (detector_size / (n_spots + 1)) * (spot + 1);
            let cy = detector_size / 2;
            if frame_idx % 4 != spot % 4 {
                continue;
            }
            for dy in -2i64..=2 {
                for dx in -2i64..=2 {
                    let x = (cx as i64 + dx).clamp(0, detector_size as i64 - 1) as usize;
                    let y = (cy as i64 + dy).clamp(0, detector_size as i64 - 1) as usize;
                    frame.set(x, y, 500);
                }
            }
        }
        dataset.push_frame(frame, InstrumentState::new(1.0));
    }
    dataset
}

fn bench_peak_finder(c: &mut Criterion) {
    let mut group = c.benchmark_group("Peak Finder Detector Sizes");

    for &size in &[128usize, 256, 512] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let dataset = synthetic_dataset(size, 10, 20);
            let params = PeakFinderParameters { min_size: 3, max_size: 1000, ..Default::default() };

            b.iter(|| {
                let found = finder::find(black_box(&dataset), 0, black_box(&params), &NullProgress);
                black_box(found);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_peak_finder);
criterion_main!(benches);
