//! Classifier lifecycle: build, fit, predict, save and load.

use ndarray::{Array2, ArrayView4, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TrainingConfig;
use crate::dataset::TrainingTensors;
use crate::error::{DatasetError, ModelError};
use crate::network::{self, ConvNet, NetworkMoments, Topology, WindowShape};
use crate::optimizer::Adam;
use crate::store::{ModelArtifact, ModelLocation, ModelStore};
use crate::{BATCH_SIZE, EPOCHS};

/// Softmax output for one window, index-aligned with the class list.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityVector(Vec<f32>);

impl ProbabilityVector {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<f32> {
        self.0.get(index).copied()
    }

    /// Most probable class, first one on ties.
    pub fn argmax(&self) -> Option<usize> {
        network::argmax(self.0.iter().copied())
    }
}

impl From<Vec<f32>> for ProbabilityVector {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitOptions {
    pub epochs: usize,
    pub batch_size: usize,
    /// Reorder examples before every epoch.
    pub shuffle: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            epochs: EPOCHS,
            batch_size: BATCH_SIZE,
            shuffle: true,
        }
    }
}

impl From<&TrainingConfig> for FitOptions {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            epochs: config.epochs,
            batch_size: config.batch_size,
            shuffle: config.shuffle,
        }
    }
}

impl FitOptions {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.epochs == 0 {
            return Err(ModelError::InvalidFitOptions("epochs must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(ModelError::InvalidFitOptions("batch size must be > 0".into()));
        }
        Ok(())
    }
}

/// Metrics reported at the end of every epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// Zero-based
    pub epoch: usize,
    /// Mean cross-entropy over the epoch's examples
    pub loss: f32,
    /// Fraction of examples predicted correctly, in [0, 1]
    pub accuracy: f32,
    pub batches: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitHistory {
    pub epochs: Vec<EpochMetrics>,
}

impl FitHistory {
    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    pub fn final_accuracy(&self) -> Option<f32> {
        self.last().map(|m| m.accuracy)
    }
}

/// The current network together with its optimizer state.
///
/// A classifier is replaced wholesale on rebuild or load; only `fit` updates
/// weights in place.
#[derive(Debug, Clone)]
pub struct Classifier {
    network: ConvNet,
    adam: Adam,
    moments: NetworkMoments,
    rng: StdRng,
}

impl Classifier {
    /// Fresh, untrained classifier. The seed drives weight init and
    /// shuffling; `None` draws from entropy.
    pub fn build(topology: Topology, seed: Option<u64>) -> Result<Self, ModelError> {
        let mut rng = seeded_rng(seed);
        let network = ConvNet::new(topology, &mut rng)?;
        debug!(
            parameters = network.topology().parameter_count(),
            classes = network.topology().class_count,
            "classifier built"
        );
        Ok(Self::from_network(network, rng))
    }

    fn from_network(network: ConvNet, rng: StdRng) -> Self {
        Self {
            adam: Adam::new(network.topology().learning_rate),
            moments: network.moments(),
            network,
            rng,
        }
    }

    pub fn topology(&self) -> &Topology {
        self.network.topology()
    }

    pub fn window_shape(&self) -> WindowShape {
        self.topology().input
    }

    pub fn class_count(&self) -> usize {
        self.topology().output_units()
    }

    pub fn network(&self) -> &ConvNet {
        &self.network
    }

    /// Train in place for the full schedule.
    ///
    /// `on_epoch_end` runs after every epoch, in epoch order. A failed fit may
    /// leave the weights partially updated.
    pub fn fit<F>(
        &mut self,
        tensors: &TrainingTensors,
        options: &FitOptions,
        mut on_epoch_end: F,
    ) -> Result<FitHistory, ModelError>
    where
        F: FnMut(&EpochMetrics),
    {
        options.validate()?;

        let n = tensors.len();
        if n == 0 {
            return Err(DatasetError::Empty.into());
        }
        self.topology().check_input(tensors.features.shape())?;
        if tensors.labels.dim() != (n, self.class_count()) {
            return Err(ModelError::ShapeMismatch {
                expected: vec![n, self.class_count()],
                actual: tensors.labels.shape().to_vec(),
            });
        }

        let planned = n.div_ceil(options.batch_size);
        let mut order: Vec<usize> = (0..n).collect();
        let mut history = FitHistory::default();

        info!(examples = n, epochs = options.epochs, batches = planned, "fit started");

        for epoch in 0..options.epochs {
            if options.shuffle {
                order.shuffle(&mut self.rng);
            }

            let mut loss_sum = 0.0;
            let mut correct = 0;
            let mut batches = 0;
            for batch in order.chunks(options.batch_size) {
                let features = tensors.features.select(Axis(0), batch);
                let labels = tensors.labels.select(Axis(0), batch);
                let (loss, hits) = self.network.train_batch(
                    features.view(),
                    labels.view(),
                    &mut self.adam,
                    &mut self.moments,
                )?;
                loss_sum += loss;
                correct += hits;
                batches += 1;
            }

            let loss = loss_sum / n as f32;
            if !loss.is_finite() {
                return Err(ModelError::NumericalInstability { epoch });
            }

            let metrics = EpochMetrics {
                epoch,
                loss,
                accuracy: correct as f32 / n as f32,
                batches,
            };
            debug!(epoch, loss, accuracy = metrics.accuracy, "epoch finished");
            on_epoch_end(&metrics);
            history.epochs.push(metrics);
        }

        Ok(history)
    }

    /// Class probabilities for one normalized window.
    pub fn predict(&self, window: &[f32]) -> Result<ProbabilityVector, ModelError> {
        let shape = self.window_shape();
        if window.len() != shape.len() {
            return Err(ModelError::ShapeMismatch {
                expected: vec![shape.len()],
                actual: vec![window.len()],
            });
        }

        let (frames, bins, channels) = shape.dims();
        let input = ArrayView4::from_shape((1, frames, bins, channels), window)?;
        let probs = self.network.forward(input)?;
        Ok(ProbabilityVector(probs.row(0).to_vec()))
    }

    /// Class probabilities for a `[N, frames, bins, channels]` batch.
    pub fn predict_batch(&self, features: ArrayView4<f32>) -> Result<Array2<f32>, ModelError> {
        self.network.forward(features)
    }

    pub fn save<M: ModelStore + ?Sized>(
        &self,
        store: &mut M,
        location: &ModelLocation,
    ) -> Result<(), ModelError> {
        store.save(location, &ModelArtifact::new(self.network.clone()))?;
        info!(%location, "model saved");
        Ok(())
    }

    /// Load a stored model, rejecting one built for a different window or
    /// class count than `expected`.
    pub fn load<M: ModelStore + ?Sized>(
        store: &M,
        location: &ModelLocation,
        expected: &Topology,
        seed: Option<u64>,
    ) -> Result<Self, ModelError> {
        let artifact = store.load(location)?;
        let found = artifact.network.topology();

        if found.input != expected.input {
            return Err(ModelError::incompatible(format!(
                "window {:?}, expected {:?}",
                found.input.dims(),
                expected.input.dims()
            )));
        }
        if found.class_count != expected.class_count {
            return Err(ModelError::incompatible(format!(
                "{} classes, expected {}",
                found.class_count, expected.class_count
            )));
        }

        info!(%location, "model loaded");
        Ok(Self::from_network(artifact.network, seeded_rng(seed)))
    }
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Dataset, Example};
    use crate::error::StoreError;
    use crate::store::MemoryModelStore;
    use approx::assert_relative_eq;

    const SHAPE: WindowShape = WindowShape::new(3, 8, 1);

    fn topology(classes: usize) -> Topology {
        Topology::for_window(SHAPE, classes, 0.01).unwrap()
    }

    /// Class `k` is loud in the `k`th quarter of the bins.
    fn separable(n: usize, classes: usize) -> TrainingTensors {
        let mut dataset = Dataset::new();
        for i in 0..n {
            let label = i % classes;
            let features = (0..SHAPE.len())
                .map(|j| if (j % SHAPE.bins) / 2 == label { 2.0 } else { -0.5 })
                .collect();
            dataset.append(Example::new(features, label));
        }
        dataset.to_training_tensors(SHAPE, classes).unwrap()
    }

    #[test]
    fn build_matches_declared_shapes() {
        let classifier = Classifier::build(topology(4), Some(1)).unwrap();
        assert_eq!(classifier.class_count(), 4);
        assert_eq!(classifier.window_shape(), SHAPE);

        let probs = classifier.predict(&vec![0.0; SHAPE.len()]).unwrap();
        assert_eq!(probs.len(), 4);
        assert_relative_eq!(probs.as_slice().iter().sum::<f32>(), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn same_seed_builds_same_weights() {
        let a = Classifier::build(topology(3), Some(42)).unwrap();
        let b = Classifier::build(topology(3), Some(42)).unwrap();
        assert_eq!(a.network(), b.network());
    }

    #[test]
    fn fit_runs_ceil_batches_and_every_epoch_in_order() {
        let mut classifier = Classifier::build(topology(3), Some(2)).unwrap();
        let tensors = separable(33, 3);
        let mut seen = Vec::new();

        let history = classifier
            .fit(&tensors, &FitOptions::default(), |m| seen.push(m.epoch))
            .unwrap();

        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert_eq!(history.epochs.len(), 10);
        assert!(history.epochs.iter().all(|m| m.batches == 3));
        assert_eq!(classifier.adam.iterations(), 10 * 3);
        assert!(history
            .epochs
            .iter()
            .all(|m| (0.0..=1.0).contains(&m.accuracy)));
    }

    #[test]
    fn exact_multiple_has_no_partial_batch() {
        let mut classifier = Classifier::build(topology(2), Some(8)).unwrap();
        let options = FitOptions {
            epochs: 2,
            batch_size: 4,
            shuffle: false,
        };
        let history = classifier.fit(&separable(8, 2), &options, |_| {}).unwrap();

        assert!(history.epochs.iter().all(|m| m.batches == 2));
        assert_eq!(classifier.adam.iterations(), 2 * 2);
    }

    #[test]
    fn fit_reduces_loss() {
        let mut classifier = Classifier::build(topology(2), Some(3)).unwrap();
        let tensors = separable(32, 2);
        let history = classifier.fit(&tensors, &FitOptions::default(), |_| {}).unwrap();

        let first = history.epochs[0].loss;
        let last = history.last().unwrap().loss;
        assert!(last < first, "loss went from {first} to {last}");
    }

    #[test]
    fn fit_rejects_bad_options_and_shapes() {
        let mut classifier = Classifier::build(topology(3), Some(4)).unwrap();
        let tensors = separable(4, 3);

        let zero_batch = FitOptions {
            batch_size: 0,
            ..FitOptions::default()
        };
        assert!(matches!(
            classifier.fit(&tensors, &zero_batch, |_| {}),
            Err(ModelError::InvalidFitOptions(_))
        ));

        let wrong_classes = separable(4, 2);
        assert!(matches!(
            classifier.fit(&wrong_classes, &FitOptions::default(), |_| {}),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn predict_rejects_wrong_window_length() {
        let classifier = Classifier::build(topology(3), Some(5)).unwrap();
        assert!(matches!(
            classifier.predict(&[0.0; 5]),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn save_then_load_predicts_the_same() {
        let mut store = MemoryModelStore::new();
        let location = ModelLocation::local("round-trip").unwrap();
        let mut classifier = Classifier::build(topology(3), Some(6)).unwrap();
        classifier
            .fit(&separable(12, 3), &FitOptions::default(), |_| {})
            .unwrap();
        classifier.save(&mut store, &location).unwrap();

        let loaded = Classifier::load(&store, &location, &topology(3), None).unwrap();
        let input: Vec<f32> = (0..SHAPE.len()).map(|i| (i % 7) as f32 * 0.3).collect();
        let before = classifier.predict(&input).unwrap();
        let after = loaded.predict(&input).unwrap();
        for (a, b) in before.as_slice().iter().zip(after.as_slice()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-5);
        }
    }

    #[test]
    fn load_rejects_incompatible_models() {
        let mut store = MemoryModelStore::new();
        let location = ModelLocation::local("other").unwrap();
        Classifier::build(topology(2), Some(7))
            .unwrap()
            .save(&mut store, &location)
            .unwrap();

        let err = Classifier::load(&store, &location, &topology(3), None).unwrap_err();
        assert!(matches!(err, ModelError::Incompatible(_)));
        assert!(err.is_load_failure());
    }

    #[test]
    fn load_from_empty_slot_is_a_load_failure() {
        let store = MemoryModelStore::new();
        let location = ModelLocation::local("missing").unwrap();
        let err = Classifier::load(&store, &location, &topology(3), None).unwrap_err();
        assert!(matches!(err, ModelError::Store(StoreError::NotFound(_))));
        assert!(err.is_load_failure());
    }

    #[test]
    fn probability_vector_argmax() {
        let probs = ProbabilityVector::from(vec![0.1, 0.6, 0.3]);
        assert_eq!(probs.argmax(), Some(1));
        assert_eq!(probs.get(2), Some(0.3));
        assert_eq!(probs.get(3), None);
    }
}
