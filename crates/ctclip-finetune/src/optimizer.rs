//! AdamW optimizer and warmup + cosine learning-rate schedule

use anyhow::{Context, Result};
use aprender::autograd::Tensor;
use ctclip_model::Gradients;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use std::path::Path;

/// Optimizer configuration
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    /// Peak learning rate
    pub learning_rate: f32,
    /// Decoupled weight decay
    pub weight_decay: f32,
    /// Beta1 for AdamW
    pub beta1: f32,
    /// Beta2 for AdamW
    pub beta2: f32,
    /// Epsilon for AdamW
    pub eps: f32,
    /// Number of linear warmup steps
    pub warmup_length: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            weight_decay: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            warmup_length: 500,
        }
    }
}

/// Learning rate at `step` for linear warmup followed by cosine decay
///
/// - `step < warmup_length`: `base_lr * (step + 1) / warmup_length`
/// - otherwise: `0.5 * (1 + cos(pi * e / es)) * base_lr` with
///   `e = step - warmup_length`, `es = total_steps - warmup_length`;
///   0 once `e >= es`.
///
/// # Example
/// ```
/// use ctclip_finetune::optimizer::cosine_lr;
///
/// assert_eq!(cosine_lr(1.0, 10, 100, 0), 0.1);
/// assert_eq!(cosine_lr(1.0, 10, 100, 10), 1.0);
/// assert_eq!(cosine_lr(1.0, 10, 100, 100), 0.0);
/// ```
pub fn cosine_lr(base_lr: f32, warmup_length: usize, total_steps: usize, step: usize) -> f32 {
    if step < warmup_length {
        return base_lr * (step + 1) as f32 / warmup_length as f32;
    }
    let e = step - warmup_length;
    let es = total_steps.saturating_sub(warmup_length);
    if e >= es {
        return 0.0;
    }
    0.5 * (1.0 + (PI * e as f32 / es as f32).cos()) * base_lr
}

/// [`cosine_lr`] bound to a base rate and run length
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosineSchedule {
    base_lr: f32,
    warmup_length: usize,
    total_steps: usize,
}

impl CosineSchedule {
    /// Create a schedule over `total_steps` optimizer steps
    pub fn new(base_lr: f32, warmup_length: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_length,
            total_steps,
        }
    }

    /// Learning rate at `step`
    pub fn lr_at(&self, step: usize) -> f32 {
        cosine_lr(self.base_lr, self.warmup_length, self.total_steps, step)
    }

    /// Write the rate for `step` into the optimizer and return it
    pub fn apply(&self, optimizer: &mut AdamW, step: usize) -> f32 {
        let lr = self.lr_at(step);
        optimizer.set_lr(lr);
        lr
    }

    /// Total number of steps in the run
    pub fn total_steps(&self) -> usize {
        self.total_steps
    }
}

/// Serializable AdamW state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamWState {
    /// Number of steps taken
    pub step: u64,
    /// Current learning rate
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
    /// First moment per parameter
    pub exp_avg: Vec<Vec<f32>>,
    /// Second moment per parameter
    pub exp_avg_sq: Vec<Vec<f32>>,
}

/// AdamW with decoupled weight decay
///
/// Update per element, with bias-corrected moments:
/// `p -= lr * wd * p; p -= lr * m_hat / (sqrt(v_hat) + eps)`
#[derive(Debug, Clone)]
pub struct AdamW {
    state: AdamWState,
}

impl AdamW {
    /// Create an optimizer for parameters with the given element counts
    pub fn new(param_sizes: &[usize], config: &OptimizerConfig) -> Self {
        Self {
            state: AdamWState {
                step: 0,
                lr: config.learning_rate,
                beta1: config.beta1,
                beta2: config.beta2,
                eps: config.eps,
                weight_decay: config.weight_decay,
                exp_avg: param_sizes.iter().map(|&n| vec![0.0; n]).collect(),
                exp_avg_sq: param_sizes.iter().map(|&n| vec![0.0; n]).collect(),
            },
        }
    }

    /// Current learning rate
    pub fn lr(&self) -> f32 {
        self.state.lr
    }

    /// Set the learning rate for the next step
    pub fn set_lr(&mut self, lr: f32) {
        self.state.lr = lr;
    }

    /// Number of steps taken
    pub fn step_count(&self) -> u64 {
        self.state.step
    }

    /// Optimizer state
    pub fn state(&self) -> &AdamWState {
        &self.state
    }

    /// Apply one update
    ///
    /// # Arguments
    /// * `params` - Parameters in the same order as `grads`
    /// * `grads` - Gradients for each parameter
    pub fn step(&mut self, params: Vec<&mut Tensor>, grads: &Gradients) -> Result<()> {
        if params.len() != grads.len() || params.len() != self.state.exp_avg.len() {
            anyhow::bail!(
                "Optimizer tracks {} parameters, got {} parameters and {} gradients",
                self.state.exp_avg.len(),
                params.len(),
                grads.len()
            );
        }

        self.state.step += 1;
        let AdamWState {
            step,
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
            ref mut exp_avg,
            ref mut exp_avg_sq,
        } = self.state;
        let t = step as i32;
        let bias_correction1 = 1.0 - beta1.powi(t);
        let bias_correction2 = 1.0 - beta2.powi(t);
        let decay = 1.0 - lr * weight_decay;

        for (i, (param, grad)) in params.into_iter().zip(grads.tensors()).enumerate() {
            let m = &mut exp_avg[i];
            let v = &mut exp_avg_sq[i];
            if param.data().len() != grad.len() || grad.len() != m.len() {
                anyhow::bail!(
                    "Parameter {} has {} elements, gradient {}, state {}",
                    i,
                    param.data().len(),
                    grad.len(),
                    m.len()
                );
            }

            let updated: Vec<f32> = param
                .data()
                .iter()
                .zip(grad)
                .zip(m.iter_mut().zip(v.iter_mut()))
                .map(|((&p, &g), (m, v))| {
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / bias_correction1;
                    let v_hat = *v / bias_correction2;
                    p * decay - lr * m_hat / (v_hat.sqrt() + eps)
                })
                .collect();

            let shape = param.shape().to_vec();
            *param = Tensor::new(&updated, &shape);
        }

        Ok(())
    }

    /// Write the optimizer state as JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string(&self.state).context("Failed to serialize optimizer state")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write optimizer state: {}", path.display()))
    }

    /// Read optimizer state written by [`AdamW::save`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read optimizer state: {}", path.display()))?;
        let state: AdamWState =
            serde_json::from_str(&json).context("Failed to parse optimizer state")?;
        if state.exp_avg.len() != state.exp_avg_sq.len() {
            anyhow::bail!("Corrupt optimizer state: moment buffers disagree");
        }
        Ok(Self { state })
    }
}
