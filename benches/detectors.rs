use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kolosal_drift::prelude::*;
use ndarray::Array2;
use rand::prelude::*;
use rand_distr::StandardNormal;
use rand_xoshiro::Xoshiro256PlusPlus;

fn create_sample(n_rows: usize, n_features: usize, shift: f64, seed: u64) -> Sample {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let data = Array2::from_shape_fn((n_rows, n_features), |_| {
        let z: f64 = rng.sample(StandardNormal);
        z + shift
    });
    Sample::new(data).unwrap()
}

fn bench_offline(c: &mut Criterion) {
    let mut group = c.benchmark_group("offline_predict");
    group.sample_size(10); // Permutation tests are slow

    for n_rows in [100, 250, 500].iter() {
        let reference = create_sample(*n_rows, 5, 0.0, 1);
        let batch = create_sample(*n_rows, 5, 0.2, 2);

        for method in [Method::mmd(), Method::lsdd(), Method::ks()] {
            let name = method.name();
            let config = DetectorConfig::new(method).with_permutations(100);
            let detector = OfflineDetector::new(reference.clone(), config).unwrap();
            group.bench_with_input(BenchmarkId::new(name, n_rows), &batch, |b, batch| {
                b.iter(|| detector.predict(black_box(batch)).unwrap())
            });
        }
    }

    group.finish();
}

fn bench_online(c: &mut Criterion) {
    let mut group = c.benchmark_group("online_ingest");
    let reference = create_sample(500, 5, 0.0, 1);
    let stream = create_sample(1000, 5, 0.0, 2);

    for window_size in [10, 50].iter() {
        for method in [OnlineMethod::Mmd, OnlineMethod::Lsdd] {
            let config = OnlineConfig::new(method)
                .with_window_size(*window_size)
                .with_bootstraps(200);
            let mut detector = OnlineDetector::new(reference.clone(), config).unwrap();
            let mut i = 0;
            group.bench_function(BenchmarkId::new(format!("{:?}", method), window_size), |b| {
                b.iter(|| {
                    i = (i + 1) % stream.n_samples();
                    detector.ingest(black_box(stream.row(i))).unwrap()
                })
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_offline, bench_online);
criterion_main!(benches);
