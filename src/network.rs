//! Depthwise-conv keyword network.
//!
//! Layout is channels-last throughout: inputs are `[batch, frames, bins,
//! channels]`. The stack is
//!
//! 1. depthwise conv, kernel `[frames, 3]`, depth multiplier 8, ReLU
//! 2. max-pool `[1, 2]` with strides `[2, 2]`
//! 3. flatten
//! 4. dense softmax with one unit per class
//!
//! All layers use valid padding.

use ndarray::{Array1, Array2, Array4, ArrayView2, ArrayView4, Axis, Ix1, Ix2, Ix4};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::optimizer::{Adam, Moments};
use crate::{DEPTH_MULTIPLIER, KERNEL_BINS, POOL_SIZE, POOL_STRIDES};

/// Clip applied to probabilities before taking the log in the loss.
const PROB_EPSILON: f32 = 1e-7;

/// Shape of one feature window: time steps × frequency bins × channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowShape {
    pub frames: usize,
    pub bins: usize,
    pub channels: usize,
}

impl WindowShape {
    pub const fn new(frames: usize, bins: usize, channels: usize) -> Self {
        Self {
            frames,
            bins,
            channels,
        }
    }

    /// Number of values in one window.
    pub const fn len(&self) -> usize {
        self.frames * self.bins * self.channels
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn dims(&self) -> (usize, usize, usize) {
        (self.frames, self.bins, self.channels)
    }
}

/// Declared layer geometry. Persisted alongside the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub input: WindowShape,
    pub class_count: usize,
    pub depth_multiplier: usize,
    pub kernel: [usize; 2],
    pub pool_size: [usize; 2],
    pub pool_strides: [usize; 2],
    pub learning_rate: f32,
}

impl Topology {
    /// Standard topology for a window: the kernel spans every time step and
    /// three frequency bins.
    pub fn for_window(
        input: WindowShape,
        class_count: usize,
        learning_rate: f32,
    ) -> Result<Self, ModelError> {
        let topology = Self {
            input,
            class_count,
            depth_multiplier: DEPTH_MULTIPLIER,
            kernel: [input.frames, KERNEL_BINS],
            pool_size: POOL_SIZE,
            pool_strides: POOL_STRIDES,
            learning_rate,
        };
        topology.validate()?;
        Ok(topology)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let WindowShape {
            frames,
            bins,
            channels,
        } = self.input;

        if frames == 0 || bins == 0 || channels == 0 {
            return Err(ModelError::invalid_topology(format!(
                "window {frames}x{bins}x{channels} has an empty axis"
            )));
        }
        if self.class_count < 2 {
            return Err(ModelError::invalid_topology("need at least 2 classes"));
        }
        if self.depth_multiplier == 0 {
            return Err(ModelError::invalid_topology("depth multiplier must be > 0"));
        }
        if self.kernel[0] == 0 || self.kernel[0] > frames || self.kernel[1] == 0 || self.kernel[1] > bins
        {
            return Err(ModelError::invalid_topology(format!(
                "kernel {:?} does not fit window {frames}x{bins}",
                self.kernel
            )));
        }
        if self.pool_strides.contains(&0) || self.pool_size.contains(&0) {
            return Err(ModelError::invalid_topology("pool size and strides must be > 0"));
        }
        let (h1, w1, _) = self.conv_output();
        if h1 < self.pool_size[0] || w1 < self.pool_size[1] {
            return Err(ModelError::invalid_topology(format!(
                "pool {:?} larger than conv output {h1}x{w1}",
                self.pool_size
            )));
        }
        if !(self.learning_rate > 0.0) {
            return Err(ModelError::invalid_topology("learning rate must be > 0"));
        }

        Ok(())
    }

    /// `(rows, cols, channels)` after the depthwise conv.
    pub fn conv_output(&self) -> (usize, usize, usize) {
        (
            self.input.frames + 1 - self.kernel[0],
            self.input.bins + 1 - self.kernel[1],
            self.input.channels * self.depth_multiplier,
        )
    }

    /// `(rows, cols, channels)` after max-pooling.
    pub fn pool_output(&self) -> (usize, usize, usize) {
        let (h1, w1, c) = self.conv_output();
        (
            (h1 - self.pool_size[0]) / self.pool_strides[0] + 1,
            (w1 - self.pool_size[1]) / self.pool_strides[1] + 1,
            c,
        )
    }

    pub fn flattened_len(&self) -> usize {
        let (h, w, c) = self.pool_output();
        h * w * c
    }

    pub fn output_units(&self) -> usize {
        self.class_count
    }

    pub fn parameter_count(&self) -> usize {
        let conv = self.kernel[0] * self.kernel[1] * self.input.channels * self.depth_multiplier
            + self.input.channels * self.depth_multiplier;
        let dense = self.flattened_len() * self.class_count + self.class_count;
        conv + dense
    }

    pub(crate) fn check_input(&self, batch: &[usize]) -> Result<(), ModelError> {
        let expected = [self.input.frames, self.input.bins, self.input.channels];
        if batch.len() != 4 || batch[1..] != expected {
            return Err(ModelError::ShapeMismatch {
                expected: vec![batch.first().copied().unwrap_or(0), expected[0], expected[1], expected[2]],
                actual: batch.to_vec(),
            });
        }
        Ok(())
    }
}

/// Network weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvNet {
    topology: Topology,
    /// `[kernel_rows, kernel_cols, channels, depth_multiplier]`
    depthwise_kernel: Array4<f32>,
    depthwise_bias: Array1<f32>,
    /// `[flattened_len, class_count]`
    dense_kernel: Array2<f32>,
    dense_bias: Array1<f32>,
}

/// Gradients with the same shapes as the weights of a [`ConvNet`].
#[derive(Debug, Clone)]
pub struct Gradients {
    pub depthwise_kernel: Array4<f32>,
    pub depthwise_bias: Array1<f32>,
    pub dense_kernel: Array2<f32>,
    pub dense_bias: Array1<f32>,
}

/// Adam moment estimates for every weight tensor.
#[derive(Debug, Clone)]
pub struct NetworkMoments {
    depthwise_kernel: Moments<Ix4>,
    depthwise_bias: Moments<Ix1>,
    dense_kernel: Moments<Ix2>,
    dense_bias: Moments<Ix1>,
}

struct ForwardCache {
    /// Post-ReLU conv output
    activations: Array4<f32>,
    /// Flat `row * cols + col` index of each pooled maximum
    argmax: Array4<usize>,
    flat: Array2<f32>,
}

impl ConvNet {
    /// Fresh network: Glorot-uniform kernels, zero biases.
    pub fn new<R: Rng + ?Sized>(topology: Topology, rng: &mut R) -> Result<Self, ModelError> {
        topology.validate()?;

        let [kh, kw] = topology.kernel;
        let c = topology.input.channels;
        let m = topology.depth_multiplier;
        let k = topology.class_count;
        let flat = topology.flattened_len();

        // Receptive field counts towards both fans for conv kernels
        let conv_limit = glorot_limit(kh * kw * c, kh * kw * m);
        let dense_limit = glorot_limit(flat, k);

        let depthwise_kernel =
            Array4::from_shape_fn((kh, kw, c, m), |_| rng.gen_range(-conv_limit..conv_limit));
        let dense_kernel =
            Array2::from_shape_fn((flat, k), |_| rng.gen_range(-dense_limit..dense_limit));

        Ok(Self {
            depthwise_bias: Array1::zeros(c * m),
            dense_bias: Array1::zeros(k),
            topology,
            depthwise_kernel,
            dense_kernel,
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Verify that the weight tensors agree with the declared topology.
    pub fn check_shapes(&self) -> Result<(), ModelError> {
        self.topology.validate()?;

        let [kh, kw] = self.topology.kernel;
        let c = self.topology.input.channels;
        let m = self.topology.depth_multiplier;
        let k = self.topology.class_count;
        let flat = self.topology.flattened_len();

        let checks: [(&[usize], Vec<usize>); 4] = [
            (self.depthwise_kernel.shape(), vec![kh, kw, c, m]),
            (self.depthwise_bias.shape(), vec![c * m]),
            (self.dense_kernel.shape(), vec![flat, k]),
            (self.dense_bias.shape(), vec![k]),
        ];
        for (actual, expected) in checks {
            if actual != expected.as_slice() {
                return Err(ModelError::ShapeMismatch {
                    expected,
                    actual: actual.to_vec(),
                });
            }
        }

        Ok(())
    }

    /// Largest absolute difference between corresponding weights, `None`
    /// when the two networks do not share a topology.
    pub fn max_weight_difference(&self, other: &ConvNet) -> Option<f32> {
        if self.topology != other.topology {
            return None;
        }
        fn max_abs<'a>(a: impl Iterator<Item = &'a f32>, b: impl Iterator<Item = &'a f32>) -> f32 {
            a.zip(b).fold(0.0, |acc, (x, y)| acc.max((x - y).abs()))
        }
        Some(
            max_abs(self.depthwise_kernel.iter(), other.depthwise_kernel.iter())
                .max(max_abs(self.depthwise_bias.iter(), other.depthwise_bias.iter()))
                .max(max_abs(self.dense_kernel.iter(), other.dense_kernel.iter()))
                .max(max_abs(self.dense_bias.iter(), other.dense_bias.iter())),
        )
    }

    pub fn moments(&self) -> NetworkMoments {
        NetworkMoments {
            depthwise_kernel: Moments::zeros_like(&self.depthwise_kernel),
            depthwise_bias: Moments::zeros_like(&self.depthwise_bias),
            dense_kernel: Moments::zeros_like(&self.dense_kernel),
            dense_bias: Moments::zeros_like(&self.dense_bias),
        }
    }

    /// Class probabilities, `[batch, class_count]`.
    pub fn forward(&self, input: ArrayView4<f32>) -> Result<Array2<f32>, ModelError> {
        let (probs, _) = self.forward_cached(input)?;
        Ok(probs)
    }

    /// One optimizer step on a mini-batch.
    ///
    /// Returns the summed (not averaged) loss and the number of correct
    /// predictions so callers can aggregate over uneven batches.
    pub fn train_batch(
        &mut self,
        input: ArrayView4<f32>,
        labels: ArrayView2<f32>,
        adam: &mut Adam,
        moments: &mut NetworkMoments,
    ) -> Result<(f32, usize), ModelError> {
        let (probs, cache) = self.forward_cached(input)?;
        if labels.dim() != probs.dim() {
            return Err(ModelError::ShapeMismatch {
                expected: probs.shape().to_vec(),
                actual: labels.shape().to_vec(),
            });
        }

        let loss = categorical_cross_entropy(probs.view(), labels);
        let correct = correct_predictions(probs.view(), labels);

        // Softmax + cross-entropy: dL/dlogits = (p - y) / n
        let n = probs.nrows() as f32;
        let grad_logits = (&probs - &labels) / n;

        let grads = self.backward(input, &cache, grad_logits.view())?;
        self.apply(&grads, adam, moments);

        Ok((loss, correct))
    }

    fn forward_cached(&self, input: ArrayView4<f32>) -> Result<(Array2<f32>, ForwardCache), ModelError> {
        self.topology.check_input(input.shape())?;

        let n = input.len_of(Axis(0));
        let [kh, kw] = self.topology.kernel;
        let [ph, pw] = self.topology.pool_size;
        let [sh, sw] = self.topology.pool_strides;
        let c = self.topology.input.channels;
        let m = self.topology.depth_multiplier;
        let (h1, w1, o) = self.topology.conv_output();
        let (h2, w2, _) = self.topology.pool_output();

        // 1. Depthwise conv + ReLU
        let mut activations = Array4::<f32>::zeros((n, h1, w1, o));
        for b in 0..n {
            for i in 0..h1 {
                for j in 0..w1 {
                    for ch in 0..c {
                        for mm in 0..m {
                            let oc = ch * m + mm;
                            let mut acc = self.depthwise_bias[oc];
                            for di in 0..kh {
                                for dj in 0..kw {
                                    acc += input[[b, i + di, j + dj, ch]]
                                        * self.depthwise_kernel[[di, dj, ch, mm]];
                                }
                            }
                            activations[[b, i, j, oc]] = acc.max(0.0);
                        }
                    }
                }
            }
        }

        // 2. Max-pool
        let mut pooled = Array4::<f32>::zeros((n, h2, w2, o));
        let mut argmax = Array4::<usize>::zeros((n, h2, w2, o));
        for b in 0..n {
            for i in 0..h2 {
                for j in 0..w2 {
                    for oc in 0..o {
                        let mut best = f32::NEG_INFINITY;
                        let mut best_idx = 0;
                        for p in 0..ph {
                            for q in 0..pw {
                                let r = i * sh + p;
                                let s = j * sw + q;
                                let v = activations[[b, r, s, oc]];
                                if v > best {
                                    best = v;
                                    best_idx = r * w1 + s;
                                }
                            }
                        }
                        pooled[[b, i, j, oc]] = best;
                        argmax[[b, i, j, oc]] = best_idx;
                    }
                }
            }
        }

        // 3. Flatten
        let flat = Array2::from_shape_vec(
            (n, self.topology.flattened_len()),
            pooled.iter().copied().collect(),
        )?;

        // 4. Dense + softmax
        let logits = flat.dot(&self.dense_kernel) + &self.dense_bias;
        let probs = softmax_rows(logits);

        Ok((
            probs,
            ForwardCache {
                activations,
                argmax,
                flat,
            },
        ))
    }

    fn backward(
        &self,
        input: ArrayView4<f32>,
        cache: &ForwardCache,
        grad_logits: ArrayView2<f32>,
    ) -> Result<Gradients, ModelError> {
        let n = input.len_of(Axis(0));
        let [kh, kw] = self.topology.kernel;
        let c = self.topology.input.channels;
        let m = self.topology.depth_multiplier;
        let (h1, w1, o) = self.topology.conv_output();
        let (h2, w2, _) = self.topology.pool_output();

        // Dense
        let dense_kernel = cache.flat.t().dot(&grad_logits);
        let dense_bias = grad_logits.sum_axis(Axis(0));
        let grad_flat = grad_logits.dot(&self.dense_kernel.t());

        // Un-flatten and route each pooled gradient to its maximum
        let grad_pooled = Array4::from_shape_vec((n, h2, w2, o), grad_flat.iter().copied().collect())?;
        let mut grad_act = Array4::<f32>::zeros((n, h1, w1, o));
        for ((b, i, j, oc), &idx) in cache.argmax.indexed_iter() {
            grad_act[[b, idx / w1, idx % w1, oc]] += grad_pooled[[b, i, j, oc]];
        }

        // ReLU + depthwise conv
        let mut depthwise_kernel = Array4::<f32>::zeros(self.depthwise_kernel.raw_dim());
        let mut depthwise_bias = Array1::<f32>::zeros(o);
        for b in 0..n {
            for i in 0..h1 {
                for j in 0..w1 {
                    for ch in 0..c {
                        for mm in 0..m {
                            let oc = ch * m + mm;
                            let g = grad_act[[b, i, j, oc]];
                            if g == 0.0 || cache.activations[[b, i, j, oc]] <= 0.0 {
                                continue;
                            }
                            depthwise_bias[oc] += g;
                            for di in 0..kh {
                                for dj in 0..kw {
                                    depthwise_kernel[[di, dj, ch, mm]] +=
                                        g * input[[b, i + di, j + dj, ch]];
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(Gradients {
            depthwise_kernel,
            depthwise_bias,
            dense_kernel,
            dense_bias,
        })
    }

    fn apply(&mut self, grads: &Gradients, adam: &mut Adam, moments: &mut NetworkMoments) {
        adam.begin_step();
        adam.update(
            &mut moments.depthwise_kernel,
            &mut self.depthwise_kernel,
            &grads.depthwise_kernel,
        );
        adam.update(
            &mut moments.depthwise_bias,
            &mut self.depthwise_bias,
            &grads.depthwise_bias,
        );
        adam.update(&mut moments.dense_kernel, &mut self.dense_kernel, &grads.dense_kernel);
        adam.update(&mut moments.dense_bias, &mut self.dense_bias, &grads.dense_bias);
    }
}

fn glorot_limit(fan_in: usize, fan_out: usize) -> f32 {
    (6.0 / (fan_in + fan_out) as f32).sqrt()
}

fn softmax_rows(mut logits: Array2<f32>) -> Array2<f32> {
    for mut row in logits.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
    logits
}

/// Summed categorical cross-entropy over the batch.
pub fn categorical_cross_entropy(probs: ArrayView2<f32>, labels: ArrayView2<f32>) -> f32 {
    probs
        .iter()
        .zip(labels.iter())
        .map(|(&p, &y)| -y * p.clamp(PROB_EPSILON, 1.0 - PROB_EPSILON).ln())
        .sum()
}

/// Rows whose highest probability sits on the one-hot label.
pub fn correct_predictions(probs: ArrayView2<f32>, labels: ArrayView2<f32>) -> usize {
    probs
        .rows()
        .into_iter()
        .zip(labels.rows())
        .filter(|(p, y)| argmax(p.iter().copied()) == argmax(y.iter().copied()))
        .count()
}

/// Index of the first maximum.
pub fn argmax(values: impl IntoIterator<Item = f32>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, v) in values.into_iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}
