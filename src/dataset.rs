use ndarray::{Array2, Array4};

use crate::error::DatasetError;
use crate::network::WindowShape;

/// One normalized feature window and its class label.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    features: Box<[f32]>,
    label: usize,
}

impl Example {
    pub fn new(features: Vec<f32>, label: usize) -> Self {
        Self {
            features: features.into_boxed_slice(),
            label,
        }
    }

    pub fn features(&self) -> &[f32] {
        &self.features
    }

    pub fn label(&self) -> usize {
        self.label
    }
}

/// Dense tensors for one training run.
#[derive(Debug, Clone)]
pub struct TrainingTensors {
    /// `[N, frames, bins, channels]`
    pub features: Array4<f32>,
    /// `[N, class_count]`, one-hot
    pub labels: Array2<f32>,
}

impl TrainingTensors {
    pub fn len(&self) -> usize {
        self.labels.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Append-only collection of examples, kept in insertion order.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    examples: Vec<Example>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label range is the caller's responsibility.
    pub fn append(&mut self, example: Example) {
        self.examples.push(example);
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Example> {
        self.examples.iter()
    }

    pub fn clear(&mut self) {
        self.examples.clear();
    }

    /// Example count per class. Out-of-range labels are not counted.
    pub fn label_counts(&self, class_count: usize) -> Vec<usize> {
        let mut counts = vec![0; class_count];
        for example in &self.examples {
            if let Some(count) = counts.get_mut(example.label) {
                *count += 1;
            }
        }
        counts
    }

    /// Stack every example into a feature tensor and a one-hot label tensor.
    ///
    /// Row `i` of both tensors is example `i`.
    pub fn to_training_tensors(
        &self,
        shape: WindowShape,
        class_count: usize,
    ) -> Result<TrainingTensors, DatasetError> {
        if self.examples.is_empty() {
            return Err(DatasetError::Empty);
        }

        let n = self.examples.len();
        let window = shape.len();
        let mut flat = Vec::with_capacity(n * window);
        let mut labels = Array2::<f32>::zeros((n, class_count));

        for (index, example) in self.examples.iter().enumerate() {
            if example.features.len() != window {
                return Err(DatasetError::WindowLength {
                    index,
                    expected: window,
                    actual: example.features.len(),
                });
            }
            if example.label >= class_count {
                return Err(DatasetError::Label {
                    index,
                    label: example.label,
                    class_count,
                });
            }
            flat.extend_from_slice(&example.features);
            labels[[index, example.label]] = 1.0;
        }

        let (frames, bins, channels) = shape.dims();
        let features = Array4::from_shape_vec((n, frames, bins, channels), flat)?;

        Ok(TrainingTensors { features, labels })
    }
}
