use ndarray::{Array, Dimension, Zip};

/// Adam with bias-corrected step size.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    iterations: u32,
}

/// First and second moment estimates for one parameter tensor.
#[derive(Debug, Clone)]
pub struct Moments<D: Dimension> {
    m: Array<f32, D>,
    v: Array<f32, D>,
}

impl<D: Dimension> Moments<D> {
    pub fn zeros_like(param: &Array<f32, D>) -> Self {
        Self {
            m: Array::zeros(param.raw_dim()),
            v: Array::zeros(param.raw_dim()),
        }
    }
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            iterations: 0,
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Advance the shared step counter. Call once per mini-batch, before
    /// updating any tensor.
    pub fn begin_step(&mut self) {
        self.iterations += 1;
    }

    pub fn update<D: Dimension>(
        &self,
        moments: &mut Moments<D>,
        param: &mut Array<f32, D>,
        grad: &Array<f32, D>,
    ) {
        let t = self.iterations.max(1) as i32;
        let (b1, b2, eps) = (self.beta1, self.beta2, self.epsilon);
        let step = self.learning_rate * (1.0 - b2.powi(t)).sqrt() / (1.0 - b1.powi(t));

        Zip::from(param)
            .and(&mut moments.m)
            .and(&mut moments.v)
            .and(grad)
            .for_each(|p, m, v, &g| {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                *p -= step * *m / (v.sqrt() + eps);
            });
    }
}
