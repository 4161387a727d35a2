//! Class-weighted multi-label BCE-with-logits loss

use anyhow::Result;
use aprender::autograd::Tensor;

/// Positive-class weights for the 18 CT abnormality labels
///
/// Roughly the negative/positive ratio of each label in the training set.
pub const DEFAULT_CLASS_WEIGHTS: [f32; 18] = [
    9.211362733,
    2.384068466,
    8.295479204,
    32.8629776,
    2.992233613,
    6.064870808,
    3.176470588,
    4.187083754,
    3.022222222,
    1.216071737,
    1.677849552,
    3.152851834,
    7.123261694,
    18.16629381,
    13.8480647,
    6.335045662,
    10.81701149,
    13.40695067,
];

/// `log(1 + exp(z))` without overflow
fn softplus(z: f32) -> f32 {
    z.max(0.0) + (-z.abs()).exp().ln_1p()
}

fn sigmoid(z: f32) -> f32 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Binary cross-entropy on logits with a per-class positive weight
///
/// For logit `x`, target `y` and weight `w`:
/// `l = (1 - y) * x + (1 + (w - 1) * y) * softplus(-x)`,
/// averaged over every element of the batch.
#[derive(Debug, Clone)]
pub struct WeightedBceWithLogits {
    pos_weight: Vec<f32>,
}

impl WeightedBceWithLogits {
    /// Create a loss with the given positive weights
    ///
    /// # Errors
    /// Fails on an empty weight vector or a non-positive or non-finite weight.
    pub fn new(pos_weight: Vec<f32>) -> Result<Self> {
        if pos_weight.is_empty() {
            anyhow::bail!("Class weights must not be empty");
        }
        if let Some((i, w)) = pos_weight
            .iter()
            .enumerate()
            .find(|(_, w)| !w.is_finite() || **w <= 0.0)
        {
            anyhow::bail!("Class weight {} must be positive and finite, got {}", i, w);
        }
        Ok(Self { pos_weight })
    }

    /// Number of classes covered by the weights
    pub fn num_classes(&self) -> usize {
        self.pos_weight.len()
    }

    /// Positive weights
    pub fn pos_weight(&self) -> &[f32] {
        &self.pos_weight
    }

    fn check(&self, logits: &Tensor, targets: &Tensor) -> Result<usize> {
        let classes = self.pos_weight.len();
        let shape = logits.shape();
        if shape.len() != 2 || shape[1] != classes {
            anyhow::bail!("Expected logits of shape [batch, {}], got {:?}", classes, shape);
        }
        if targets.shape() != shape {
            anyhow::bail!(
                "Targets shape {:?} does not match logits shape {:?}",
                targets.shape(),
                shape
            );
        }
        Ok(shape[0] * classes)
    }

    /// Mean loss
    pub fn forward(&self, logits: &Tensor, targets: &Tensor) -> Result<f32> {
        self.forward_backward(logits, targets).map(|(loss, _)| loss)
    }

    /// Mean loss and its gradient with respect to the logits
    ///
    /// The gradient is laid out like `logits` (`[batch, classes]`, row-major).
    pub fn forward_backward(&self, logits: &Tensor, targets: &Tensor) -> Result<(f32, Vec<f32>)> {
        let n = self.check(logits, targets)?;
        if n == 0 {
            anyhow::bail!("Cannot compute loss on an empty batch");
        }
        let classes = self.pos_weight.len();
        let inv_n = 1.0 / n as f32;

        let mut total = 0.0f64;
        let mut grad = Vec::with_capacity(n);
        for (idx, (&x, &y)) in logits.data().iter().zip(targets.data()).enumerate() {
            let w = self.pos_weight[idx % classes];
            let log_weight = 1.0 + (w - 1.0) * y;
            total += ((1.0 - y) * x + log_weight * softplus(-x)) as f64;
            grad.push(((1.0 - y) - log_weight * sigmoid(-x)) * inv_n);
        }

        Ok(((total / n as f64) as f32, grad))
    }
}

impl Default for WeightedBceWithLogits {
    fn default() -> Self {
        Self {
            pos_weight: DEFAULT_CLASS_WEIGHTS.to_vec(),
        }
    }
}
