//! Contrastive image/text encoder pair
//!
//! [`LatentEncoder`] is the seam the classification wrapper depends on: any
//! encoder that maps a batch of flattened CT volumes and tokenized prompts into
//! a shared latent space. [`ProjectionClip`] is the concrete pair shipped with
//! this crate: a token-embedding text tower and a linear visual projection,
//! both feeding L2-normalized latents and a temperature-scaled similarity.
//!
//! Fine-tuning only consumes image latents, so the gradient seam covers the
//! image path: [`LatentEncoder::image_latents_with_cache`] and
//! [`LatentEncoder::backward_image`]. For [`ProjectionClip`] that path is the
//! visual projection; the text tower and temperature never reach the image
//! latents and are left out of [`LatentEncoder::trainable_parameters`].

use crate::checkpoint::{Checkpointable, NamedParameters};
use crate::config::ClipConfig;
use crate::error::ModelError;
use crate::grad::Gradients;
use crate::init::{init_embedding, init_linear_weight, make_rng};
use crate::ops::{l2_normalize_backward, l2_normalize_rows, linear_forward, linear_weight_grad};
use anyhow::{Context, Result};
use aprender::autograd::Tensor;
use aprender::nn::Module;
use ctclip_tokenizer::TokenizedPrompt;

/// What the caller wants back from [`LatentEncoder::encode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatentRequest {
    /// Text/image similarity matrix
    Similarity,
    /// Raw text and image latents
    Latents,
}

/// Result of an encoder call, shaped by the [`LatentRequest`]
pub enum EncoderOutput {
    /// `[num_prompts, batch]` temperature-scaled similarities
    Similarity(Tensor),
    /// Text latents `[num_prompts, latent_dim]` and image latents `[batch, latent_dim]`
    Latents { text: Tensor, image: Tensor },
}

impl EncoderOutput {
    /// Image latents, if this output carries them
    pub fn into_image_latents(self) -> Option<Tensor> {
        match self {
            EncoderOutput::Latents { image, .. } => Some(image),
            EncoderOutput::Similarity(_) => None,
        }
    }
}

/// A pretrained encoder pair producing image and text latents
pub trait LatentEncoder: Checkpointable + Clone + Send + Sync {
    /// State kept between [`Self::image_latents_with_cache`] and [`Self::backward_image`]
    type Cache: Send + Sync;

    /// Encode prompts and images
    ///
    /// # Arguments
    /// * `prompts` - One prompt per batch row, or a single prompt shared by all rows
    /// * `images` - Flattened volumes `[batch, image_dim]`
    /// * `request` - Which output to produce
    fn encode(
        &self,
        prompts: &[TokenizedPrompt],
        images: &Tensor,
        request: LatentRequest,
    ) -> Result<EncoderOutput>;

    /// Width of the shared latent space
    fn latent_dim(&self) -> usize;

    /// Number of elements in one flattened input volume
    fn image_dim(&self) -> usize;

    /// Prompt length the text tower expects
    fn context_length(&self) -> usize;

    /// Image latents `[batch, latent_dim]`, keeping what backward needs
    fn image_latents_with_cache(
        &self,
        prompts: &[TokenizedPrompt],
        images: &Tensor,
    ) -> Result<(Tensor, Self::Cache)>;

    /// Gradients of [`Self::trainable_parameters`] given `dL/d(image latents)`
    fn backward_image(&self, cache: &Self::Cache, grad_latents: &[f32]) -> Result<Gradients>;

    /// Parameters on the image-latent path
    fn trainable_parameters(&self) -> Vec<&Tensor>;

    /// Mutable view of [`Self::trainable_parameters`], same order
    fn trainable_parameters_mut(&mut self) -> Vec<&mut Tensor>;
}

/// Input volumes saved by [`ProjectionClip`] for its image-path backward
#[derive(Debug, Clone)]
pub struct ImageCache {
    images: Vec<f32>,
    batch: usize,
}

/// Projection-style CLIP encoder pair
#[derive(Clone)]
pub struct ProjectionClip {
    /// Token embedding `[vocab_size, dim_text]`
    token_embedding: Tensor,
    /// Text projection `[dim_latent, dim_text]`
    to_text_latent: Tensor,
    /// Visual projection `[dim_latent, image_dim]`
    to_visual_latent: Tensor,
    /// Log temperature `[1]`
    temperature: Tensor,
    config: ClipConfig,
}

impl ProjectionClip {
    /// Create a new encoder pair with freshly initialized weights
    pub fn new(config: ClipConfig) -> Self {
        let mut rng = make_rng(config.seed);
        let token_embedding = init_embedding(config.vocab_size, config.dim_text, &mut rng);
        let to_text_latent = init_linear_weight(config.dim_text, config.dim_latent, &mut rng);
        let to_visual_latent = init_linear_weight(config.image_dim, config.dim_latent, &mut rng);
        let temperature = Tensor::new(&[1.0], &[1]);

        Self {
            token_embedding,
            to_text_latent,
            to_visual_latent,
            temperature,
            config,
        }
    }

    /// Encoder configuration
    pub fn config(&self) -> &ClipConfig {
        &self.config
    }

    fn check_images(&self, images: &Tensor) -> Result<usize> {
        let shape = images.shape();
        if shape.len() != 2 || shape[1] != self.config.image_dim {
            return Err(ModelError::shape(
                "images",
                &[shape.first().copied().unwrap_or(0), self.config.image_dim],
                shape,
            )
            .into());
        }
        Ok(shape[0])
    }

    fn check_prompt(&self, prompt: &TokenizedPrompt) -> Result<()> {
        if prompt.len() != self.config.context_length
            || prompt.attention_mask.len() != self.config.context_length
        {
            return Err(ModelError::shape(
                "input_ids",
                &[self.config.context_length],
                &[prompt.len()],
            )
            .into());
        }
        if let Some(&id) = prompt
            .input_ids
            .iter()
            .find(|&&id| id as usize >= self.config.vocab_size)
        {
            return Err(ModelError::TokenOutOfRange {
                id,
                vocab_size: self.config.vocab_size,
            }
            .into());
        }
        Ok(())
    }

    /// Normalized image latents `[batch, dim_latent]`
    fn image_latents(&self, images: &Tensor, batch: usize) -> Tensor {
        let dim_latent = self.config.dim_latent;
        let mut latents = linear_forward(
            images.data(),
            batch,
            self.config.image_dim,
            self.to_visual_latent.data(),
            None,
            dim_latent,
        );
        l2_normalize_rows(&mut latents, dim_latent);
        Tensor::new(&latents, &[batch, dim_latent])
    }

    /// Normalized text latents `[prompts.len(), dim_latent]`
    ///
    /// Token embeddings are mean-pooled over unmasked positions. A prompt with
    /// an all-zero mask pools to the zero vector and stays zero.
    fn text_latents(&self, prompts: &[TokenizedPrompt]) -> Tensor {
        let (dim_text, dim_latent) = (self.config.dim_text, self.config.dim_latent);
        let table = self.token_embedding.data();

        let mut pooled = vec![0.0f32; prompts.len() * dim_text];
        for (prompt, row) in prompts.iter().zip(pooled.chunks_exact_mut(dim_text)) {
            let count = prompt.num_tokens();
            if count == 0 {
                continue;
            }
            for (&id, &m) in prompt.input_ids.iter().zip(&prompt.attention_mask) {
                if m == 0 {
                    continue;
                }
                let emb = &table[id as usize * dim_text..(id as usize + 1) * dim_text];
                row.iter_mut().zip(emb).for_each(|(r, &e)| *r += e);
            }
            row.iter_mut().for_each(|r| *r /= count as f32);
        }

        let mut latents = linear_forward(
            &pooled,
            prompts.len(),
            dim_text,
            self.to_text_latent.data(),
            None,
            dim_latent,
        );
        l2_normalize_rows(&mut latents, dim_latent);
        Tensor::new(&latents, &[prompts.len(), dim_latent])
    }
}

impl LatentEncoder for ProjectionClip {
    type Cache = ImageCache;

    fn encode(
        &self,
        prompts: &[TokenizedPrompt],
        images: &Tensor,
        request: LatentRequest,
    ) -> Result<EncoderOutput> {
        let batch = self.check_images(images)?;
        if prompts.is_empty() || (prompts.len() != 1 && prompts.len() != batch) {
            anyhow::bail!(
                "Expected 1 or {} prompts for a batch of {}, got {}",
                batch,
                batch,
                prompts.len()
            );
        }
        for prompt in prompts {
            self.check_prompt(prompt)?;
        }

        let text = self.text_latents(prompts);
        let image = self.image_latents(images, batch);

        match request {
            LatentRequest::Latents => Ok(EncoderOutput::Latents { text, image }),
            LatentRequest::Similarity => {
                let dim_latent = self.config.dim_latent;
                let scale = self.temperature.data()[0].exp();
                let mut sim = linear_forward(
                    text.data(),
                    prompts.len(),
                    dim_latent,
                    image.data(),
                    None,
                    batch,
                );
                sim.iter_mut().for_each(|s| *s *= scale);
                Ok(EncoderOutput::Similarity(Tensor::new(
                    &sim,
                    &[prompts.len(), batch],
                )))
            }
        }
    }

    fn latent_dim(&self) -> usize {
        self.config.dim_latent
    }

    fn image_dim(&self) -> usize {
        self.config.image_dim
    }

    fn context_length(&self) -> usize {
        self.config.context_length
    }

    fn image_latents_with_cache(
        &self,
        prompts: &[TokenizedPrompt],
        images: &Tensor,
    ) -> Result<(Tensor, ImageCache)> {
        let latents = self
            .encode(prompts, images, LatentRequest::Latents)?
            .into_image_latents()
            .context("Encoder did not return image latents")?;
        let cache = ImageCache {
            images: images.data().to_vec(),
            batch: latents.shape()[0],
        };
        Ok((latents, cache))
    }

    fn backward_image(&self, cache: &ImageCache, grad_latents: &[f32]) -> Result<Gradients> {
        let (image_dim, dim_latent) = (self.config.image_dim, self.config.dim_latent);
        if grad_latents.len() != cache.batch * dim_latent {
            return Err(ModelError::shape(
                "grad_latents",
                &[cache.batch, dim_latent],
                &[grad_latents.len()],
            )
            .into());
        }

        // Recompute the pre-normalization projection instead of caching it
        let projected = linear_forward(
            &cache.images,
            cache.batch,
            image_dim,
            self.to_visual_latent.data(),
            None,
            dim_latent,
        );
        let grad_projected: Vec<f32> = projected
            .chunks_exact(dim_latent)
            .zip(grad_latents.chunks_exact(dim_latent))
            .flat_map(|(z, g)| l2_normalize_backward(z, g))
            .collect();

        let mut grad_visual = vec![0.0f32; dim_latent * image_dim];
        linear_weight_grad(
            &cache.images,
            &grad_projected,
            cache.batch,
            image_dim,
            dim_latent,
            &mut grad_visual,
        );
        Ok(Gradients::new(vec![grad_visual]))
    }

    fn trainable_parameters(&self) -> Vec<&Tensor> {
        vec![&self.to_visual_latent]
    }

    fn trainable_parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.to_visual_latent]
    }
}

impl NamedParameters for ProjectionClip {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        vec![
            ("token_embedding".to_string(), &self.token_embedding),
            ("to_text_latent".to_string(), &self.to_text_latent),
            ("to_visual_latent".to_string(), &self.to_visual_latent),
            ("temperature".to_string(), &self.temperature),
        ]
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        vec![
            ("token_embedding".to_string(), &mut self.token_embedding),
            ("to_text_latent".to_string(), &mut self.to_text_latent),
            ("to_visual_latent".to_string(), &mut self.to_visual_latent),
            ("temperature".to_string(), &mut self.temperature),
        ]
    }
}

impl Checkpointable for ProjectionClip {
    type Config = ClipConfig;

    fn checkpoint_config(&self) -> ClipConfig {
        self.config.clone()
    }

    fn from_checkpoint_config(config: ClipConfig) -> Result<Self> {
        Ok(Self::new(config))
    }
}

impl Module for ProjectionClip {
    /// Image latents `[batch, dim_latent]`
    ///
    /// # Panics
    /// Panics if the input is not `[batch, image_dim]`.
    fn forward(&self, input: &Tensor) -> Tensor {
        let batch = self
            .check_images(input)
            .expect("Projection CLIP forward failed");
        self.image_latents(input, batch)
    }

    fn parameters(&self) -> Vec<&Tensor> {
        vec![
            &self.token_embedding,
            &self.to_text_latent,
            &self.to_visual_latent,
            &self.temperature,
        ]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        vec![
            &mut self.token_embedding,
            &mut self.to_text_latent,
            &mut self.to_visual_latent,
            &mut self.temperature,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> ClipConfig {
        ClipConfig {
            image_dim: 16,
            vocab_size: 32,
            dim_text: 8,
            dim_latent: 4,
            context_length: 6,
            seed: Some(42),
        }
    }

    fn prompt(ids: &[u32]) -> TokenizedPrompt {
        TokenizedPrompt::from_ids(ids.to_vec(), 6, 0)
    }

    #[test]
    fn test_latents_are_unit_norm() {
        let clip = ProjectionClip::new(tiny_config());
        let images = Tensor::ones(&[3, 16]);
        let image = clip
            .encode(&[prompt(&[1, 2])], &images, LatentRequest::Latents)
            .unwrap()
            .into_image_latents()
            .unwrap();
        assert_eq!(image.shape(), &[3, 4]);
        for row in image.data().chunks_exact(4) {
            let norm: f32 = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_empty_prompt_gives_zero_text_latent() {
        let clip = ProjectionClip::new(tiny_config());
        let images = Tensor::ones(&[2, 16]);
        match clip
            .encode(&[prompt(&[])], &images, LatentRequest::Latents)
            .unwrap()
        {
            EncoderOutput::Latents { text, .. } => {
                assert!(text.data().iter().all(|&v| v == 0.0));
            }
            EncoderOutput::Similarity(_) => panic!("expected latents"),
        }
    }

    #[test]
    fn test_similarity_shape() {
        let clip = ProjectionClip::new(tiny_config());
        let images = Tensor::ones(&[2, 16]);
        let prompts = [prompt(&[1]), prompt(&[3, 4])];
        match clip
            .encode(&prompts, &images, LatentRequest::Similarity)
            .unwrap()
        {
            EncoderOutput::Similarity(sim) => assert_eq!(sim.shape(), &[2, 2]),
            EncoderOutput::Latents { .. } => panic!("expected similarity"),
        }
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let clip = ProjectionClip::new(tiny_config());
        let images = Tensor::ones(&[2, 16]);

        let wrong_width = Tensor::ones(&[2, 10]);
        assert!(clip
            .encode(&[prompt(&[1])], &wrong_width, LatentRequest::Latents)
            .is_err());

        let short = TokenizedPrompt::from_ids(vec![1], 3, 0);
        assert!(clip.encode(&[short], &images, LatentRequest::Latents).is_err());

        let out_of_vocab = prompt(&[99]);
        assert!(clip
            .encode(&[out_of_vocab], &images, LatentRequest::Latents)
            .is_err());

        assert!(clip.encode(&[], &images, LatentRequest::Latents).is_err());
    }

    #[test]
    fn test_image_backward_matches_finite_difference() {
        let mut clip = ProjectionClip::new(tiny_config());
        let images = Tensor::new(&(0..32).map(|i| (i as f32 * 0.37).sin()).collect::<Vec<_>>(), &[2, 16]);
        let upstream: Vec<f32> = (0..8).map(|i| (i as f32 * 0.9).cos()).collect();
        let (_, cache) = clip.image_latents_with_cache(&[prompt(&[])], &images).unwrap();
        let grads = clip.backward_image(&cache, &upstream).unwrap();
        assert_eq!(grads.sizes(), vec![4 * 16]);

        let loss = |clip: &ProjectionClip| {
            let (latents, _) = clip.image_latents_with_cache(&[prompt(&[])], &images).unwrap();
            latents.data().iter().zip(&upstream).map(|(l, g)| l * g).sum::<f32>()
        };
        let h = 1e-2;
        for idx in [0, 5, 17, 40, 63] {
            let base = clip.to_visual_latent.data().to_vec();
            let mut plus = base.clone();
            plus[idx] += h;
            clip.to_visual_latent = Tensor::new(&plus, &[4, 16]);
            let lp = loss(&clip);
            let mut minus = base.clone();
            minus[idx] -= h;
            clip.to_visual_latent = Tensor::new(&minus, &[4, 16]);
            let lm = loss(&clip);
            clip.to_visual_latent = Tensor::new(&base, &[4, 16]);

            let numeric = (lp - lm) / (2.0 * h);
            assert!(
                (numeric - grads.tensors()[0][idx]).abs() < 1e-2,
                "weight {}: numeric {} vs analytic {}",
                idx,
                numeric,
                grads.tensors()[0][idx]
            );
        }
    }

    #[test]
    fn test_only_visual_projection_is_trainable() {
        let clip = ProjectionClip::new(tiny_config());
        let trainable = clip.trainable_parameters();
        assert_eq!(trainable.len(), 1);
        assert_eq!(trainable[0].shape(), &[4, 16]);
    }
}
