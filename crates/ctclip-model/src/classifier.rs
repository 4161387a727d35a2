//! Image-latent classification wrapper
//!
//! Runs the encoder pair for image latents only, then the classification
//! head. Gradients flow through the head into the encoder's image path, so
//! the trainable parameters are the encoder's image-path parameters followed
//! by the head's weight and bias.

use crate::checkpoint::{
    load_weights, save_checkpoint, CheckpointMetadata, Checkpointable, NamedParameters,
};
use crate::config::{ClassifierConfig, HeadConfig};
use crate::encoder::LatentEncoder;
use crate::grad::Gradients;
use crate::head::{ClassificationHead, HeadCache};
use anyhow::{Context, Result};
use aprender::autograd::Tensor;
use aprender::nn::Module;
use ctclip_tokenizer::TokenizedPrompt;
use std::path::Path;

/// Activations kept by [`ImageLatentsClassifier::forward_with_cache`]
pub struct ClassifierCache<C> {
    encoder: C,
    head: HeadCache,
}

/// Encoder pair + classification head
#[derive(Clone)]
pub struct ImageLatentsClassifier<E: LatentEncoder> {
    encoder: E,
    head: ClassificationHead,
}

impl<E: LatentEncoder> ImageLatentsClassifier<E> {
    /// Wrap a (pretrained) encoder with a freshly initialized head
    ///
    /// # Errors
    /// Fails if the head's input width differs from the encoder's latent width.
    pub fn new(encoder: E, head_config: HeadConfig) -> Result<Self> {
        if head_config.latent_dim != encoder.latent_dim() {
            anyhow::bail!(
                "Head latent_dim ({}) must match encoder latent_dim ({})",
                head_config.latent_dim,
                encoder.latent_dim()
            );
        }
        if !(0.0..1.0).contains(&head_config.dropout) {
            anyhow::bail!("Dropout must be in [0, 1), got {}", head_config.dropout);
        }

        Ok(Self {
            encoder,
            head: ClassificationHead::new(head_config),
        })
    }

    /// The encoder pair
    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    /// The classification head
    pub fn head(&self) -> &ClassificationHead {
        &self.head
    }

    /// Enable dropout
    pub fn train(&mut self) {
        self.head.set_training(true);
    }

    /// Disable dropout
    pub fn eval(&mut self) {
        self.head.set_training(false);
    }

    /// Whether dropout is active
    pub fn is_training(&self) -> bool {
        self.head.is_training()
    }

    /// Restart the dropout stream from `seed`
    pub fn reseed_dropout(&mut self, seed: u64) {
        self.head.reseed_dropout(seed);
    }

    /// Logits `[batch, num_classes]` for a batch of volumes
    ///
    /// The text half of the encoder output is discarded.
    pub fn forward(&mut self, prompts: &[TokenizedPrompt], images: &Tensor) -> Result<Tensor> {
        self.forward_with_cache(prompts, images)
            .map(|(logits, _)| logits)
    }

    /// Forward pass keeping the activations for [`Self::backward`]
    pub fn forward_with_cache(
        &mut self,
        prompts: &[TokenizedPrompt],
        images: &Tensor,
    ) -> Result<(Tensor, ClassifierCache<E::Cache>)> {
        let (latents, encoder) = self.encoder.image_latents_with_cache(prompts, images)?;
        let (logits, head) = self.head.forward_with_cache(&latents)?;
        Ok((logits, ClassifierCache { encoder, head }))
    }

    /// Gradients of the trainable parameters given `dL/dlogits`
    pub fn backward(
        &self,
        cache: &ClassifierCache<E::Cache>,
        grad_logits: &[f32],
    ) -> Result<Gradients> {
        let (head_grads, grad_latents) = self.head.backward(&cache.head, grad_logits)?;
        let encoder_grads = self.encoder.backward_image(&cache.encoder, &grad_latents)?;
        Ok(encoder_grads.chain(head_grads))
    }

    /// Parameters updated by the optimizer, ordered like [`Gradients`]
    ///
    /// Encoder image-path parameters first, then `head.weight` and `head.bias`.
    pub fn trainable_parameters(&self) -> Vec<&Tensor> {
        let mut params = self.encoder.trainable_parameters();
        params.extend(self.head.parameters());
        params
    }

    /// Mutable trainable parameters, same order as [`Self::trainable_parameters`]
    pub fn trainable_parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = self.encoder.trainable_parameters_mut();
        params.extend(self.head.parameters_mut());
        params
    }

    /// Element counts of the trainable parameters
    pub fn gradient_sizes(&self) -> Vec<usize> {
        self.trainable_parameters()
            .iter()
            .map(|t| t.data().len())
            .collect()
    }

    /// Overwrite the trainable parameters with `other`'s
    pub fn copy_trainable_from(&mut self, other: &Self) {
        for (dst, src) in self
            .trainable_parameters_mut()
            .into_iter()
            .zip(other.trainable_parameters())
        {
            *dst = src.clone();
        }
    }

    /// Save all parameters (encoder + head) and a metadata sidecar
    pub fn save<P: AsRef<Path>>(&self, path: P, metadata: Option<CheckpointMetadata>) -> Result<()> {
        let path = path.as_ref();
        save_checkpoint(self, path, metadata)
            .with_context(|| format!("Failed to save classifier to {}", path.display()))
    }

    /// Load all parameters saved by [`Self::save`] into this wrapper
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        load_weights(self, path)
            .with_context(|| format!("Failed to load classifier from {}", path.display()))
    }
}

impl<E: LatentEncoder> NamedParameters for ImageLatentsClassifier<E> {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params: Vec<(String, &Tensor)> = self
            .encoder
            .named_parameters()
            .into_iter()
            .map(|(name, t)| (format!("encoder.{name}"), t))
            .collect();
        params.push(("head.weight".to_string(), self.head.weight()));
        params.push(("head.bias".to_string(), self.head.bias()));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params: Vec<(String, &mut Tensor)> = self
            .encoder
            .named_parameters_mut()
            .into_iter()
            .map(|(name, t)| (format!("encoder.{name}"), t))
            .collect();
        let mut head = self.head.parameters_mut().into_iter();
        if let (Some(weight), Some(bias)) = (head.next(), head.next()) {
            params.push(("head.weight".to_string(), weight));
            params.push(("head.bias".to_string(), bias));
        }
        params
    }
}

impl<E: LatentEncoder> Checkpointable for ImageLatentsClassifier<E> {
    type Config = ClassifierConfig<E::Config>;

    fn checkpoint_config(&self) -> Self::Config {
        ClassifierConfig {
            encoder: self.encoder.checkpoint_config(),
            head: self.head.config().clone(),
        }
    }

    fn from_checkpoint_config(config: Self::Config) -> Result<Self> {
        let encoder = E::from_checkpoint_config(config.encoder)?;
        Self::new(encoder, config.head)
    }
}
