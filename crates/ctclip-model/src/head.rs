//! Multi-label classification head: ReLU -> Dropout -> Linear

use crate::config::HeadConfig;
use crate::error::ModelError;
use crate::grad::Gradients;
use crate::init::{init_linear_bias, init_linear_weight, make_rng};
use crate::ops::{linear_forward, linear_weight_grad};
use anyhow::Result;
use aprender::autograd::Tensor;
use aprender::nn::Module;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Activations saved by a training forward pass
#[derive(Debug, Clone)]
pub struct HeadCache {
    /// Post ReLU+dropout latents, `[batch, latent_dim]`
    pub activations: Vec<f32>,
    /// `d(activation)/d(latent)` per element: 0 where ReLU or dropout cut it
    pub mask: Vec<f32>,
    /// Batch size
    pub batch: usize,
}

/// Classification head mapping image latents to per-class logits
///
/// Architecture:
/// - ReLU on the latent vector
/// - Inverted dropout (training mode only)
/// - Linear: latent_dim -> num_classes, with bias
#[derive(Clone)]
pub struct ClassificationHead {
    /// Weight `[num_classes, latent_dim]`
    weight: Tensor,
    /// Bias `[num_classes]`
    bias: Tensor,
    config: HeadConfig,
    training: bool,
    rng: StdRng,
}

impl ClassificationHead {
    /// Create a new head with freshly initialized weights
    pub fn new(config: HeadConfig) -> Self {
        let mut rng = make_rng(config.seed);
        let weight = init_linear_weight(config.latent_dim, config.num_classes, &mut rng);
        let bias = init_linear_bias(config.latent_dim, config.num_classes, &mut rng);

        Self {
            weight,
            bias,
            config,
            training: true,
            rng,
        }
    }

    /// Head configuration
    pub fn config(&self) -> &HeadConfig {
        &self.config
    }

    /// Weight tensor `[num_classes, latent_dim]`
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Bias tensor `[num_classes]`
    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    /// Whether dropout is active
    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Toggle dropout
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Restart the dropout stream from `seed`
    pub fn reseed_dropout(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    fn check_latents(&self, latents: &Tensor) -> Result<usize> {
        let shape = latents.shape();
        if shape.len() != 2 || shape[1] != self.config.latent_dim {
            return Err(ModelError::shape(
                "latents",
                &[shape.first().copied().unwrap_or(0), self.config.latent_dim],
                shape,
            )
            .into());
        }
        Ok(shape[0])
    }

    fn project(&self, activations: &[f32], batch: usize) -> Tensor {
        let logits = linear_forward(
            activations,
            batch,
            self.config.latent_dim,
            self.weight.data(),
            Some(self.bias.data()),
            self.config.num_classes,
        );
        Tensor::new(&logits, &[batch, self.config.num_classes])
    }

    /// Forward pass, saving what backward needs
    ///
    /// # Arguments
    /// * `latents` - Image latents `[batch, latent_dim]`
    ///
    /// # Returns
    /// Logits `[batch, num_classes]` and the activation cache
    pub fn forward_with_cache(&mut self, latents: &Tensor) -> Result<(Tensor, HeadCache)> {
        let batch = self.check_latents(latents)?;
        let p = self.config.dropout;
        let apply_dropout = self.training && p > 0.0;
        let keep_scale = if p < 1.0 { 1.0 / (1.0 - p) } else { 0.0 };

        let n = latents.data().len();
        let mut activations = Vec::with_capacity(n);
        let mut mask = Vec::with_capacity(n);
        for &z in latents.data() {
            let mut m = if z > 0.0 { 1.0 } else { 0.0 };
            if apply_dropout {
                m *= if self.rng.gen::<f32>() < p { 0.0 } else { keep_scale };
            }
            activations.push(z * m);
            mask.push(m);
        }

        let logits = self.project(&activations, batch);
        Ok((
            logits,
            HeadCache {
                activations,
                mask,
                batch,
            },
        ))
    }

    /// Backward pass given `dL/dlogits`
    ///
    /// # Arguments
    /// * `cache` - Cache from [`ClassificationHead::forward_with_cache`]
    /// * `grad_logits` - `[batch, num_classes]` upstream gradient
    ///
    /// # Returns
    /// `[grad_weight, grad_bias]` and `dL/dlatents` (`[batch, latent_dim]`)
    pub fn backward(&self, cache: &HeadCache, grad_logits: &[f32]) -> Result<(Gradients, Vec<f32>)> {
        let (latent_dim, num_classes) = (self.config.latent_dim, self.config.num_classes);
        if grad_logits.len() != cache.batch * num_classes {
            return Err(ModelError::shape(
                "grad_logits",
                &[cache.batch, num_classes],
                &[grad_logits.len()],
            )
            .into());
        }

        let mut grad_weight = vec![0.0f32; num_classes * latent_dim];
        linear_weight_grad(
            &cache.activations,
            grad_logits,
            cache.batch,
            latent_dim,
            num_classes,
            &mut grad_weight,
        );

        let mut grad_bias = vec![0.0f32; num_classes];
        for g_row in grad_logits.chunks_exact(num_classes) {
            grad_bias.iter_mut().zip(g_row).for_each(|(gb, &g)| *gb += g);
        }

        // dL/dlatents = (dL/dlogits W) * mask
        let weight = self.weight.data();
        let mut grad_latents = vec![0.0f32; cache.batch * latent_dim];
        for b in 0..cache.batch {
            let g_row = &grad_logits[b * num_classes..(b + 1) * num_classes];
            let out = &mut grad_latents[b * latent_dim..(b + 1) * latent_dim];
            for (c, &g) in g_row.iter().enumerate() {
                if g == 0.0 {
                    continue;
                }
                let w_row = &weight[c * latent_dim..(c + 1) * latent_dim];
                out.iter_mut().zip(w_row).for_each(|(o, &w)| *o += g * w);
            }
            let m_row = &cache.mask[b * latent_dim..(b + 1) * latent_dim];
            out.iter_mut().zip(m_row).for_each(|(o, &m)| *o *= m);
        }

        Ok((Gradients::new(vec![grad_weight, grad_bias]), grad_latents))
    }
}

impl Module for ClassificationHead {
    /// Inference logits for `[batch, latent_dim]` latents
    ///
    /// # Panics
    /// Panics if the input is not `[batch, latent_dim]`.
    fn forward(&self, input: &Tensor) -> Tensor {
        // Inference path: dropout is the identity
        let batch = self
            .check_latents(input)
            .expect("Classification head forward failed");
        let activations: Vec<f32> = input.data().iter().map(|&z| z.max(0.0)).collect();
        self.project(&activations, batch)
    }

    fn parameters(&self) -> Vec<&Tensor> {
        vec![&self.weight, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.weight, &mut self.bias]
    }
}
