use criterion::{criterion_group, criterion_main, Criterion};
use kws_rs::classifier::{Classifier, FitOptions};
use kws_rs::dataset::{Dataset, Example};
use kws_rs::network::{Topology, WindowShape};
use kws_rs::{FREQUENCY_BINS, LEARNING_RATE, NUM_FRAMES};

const CLASSES: usize = 5;

fn window_shape() -> WindowShape {
    WindowShape::new(NUM_FRAMES, FREQUENCY_BINS, 1)
}

fn classifier() -> Classifier {
    let topology = Topology::for_window(window_shape(), CLASSES, LEARNING_RATE).unwrap();
    Classifier::build(topology, Some(0)).unwrap()
}

fn benchmark_predict(c: &mut Criterion) {
    let classifier = classifier();

    // Silence after normalization
    let window = vec![0.0f32; window_shape().len()];

    c.bench_function("predict_single_window", |b| {
        b.iter(|| classifier.predict(&window).unwrap())
    });
}

fn benchmark_fit_epoch(c: &mut Criterion) {
    // 64 examples = 4 full batches
    let mut dataset = Dataset::new();
    for i in 0..64 {
        let features = (0..window_shape().len())
            .map(|j| ((i * 31 + j) % 17) as f32 * 0.1 - 0.8)
            .collect();
        dataset.append(Example::new(features, i % CLASSES));
    }
    let tensors = dataset.to_training_tensors(window_shape(), CLASSES).unwrap();
    let options = FitOptions {
        epochs: 1,
        ..FitOptions::default()
    };

    c.bench_function("fit_one_epoch_64_examples", |b| {
        b.iter_batched(
            classifier,
            |mut classifier| classifier.fit(&tensors, &options, |_| {}).unwrap(),
            criterion::BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, benchmark_predict, benchmark_fit_epoch);
criterion_main!(benches);
