//! Model configuration

use serde::{Deserialize, Serialize};

/// Number of disease categories in the CT report label set
pub const NUM_CLASSES: usize = 18;

/// Width of the shared image/text latent space
pub const LATENT_DIM: usize = 512;

/// Token length of the text prompt fed to the text encoder
pub const TEXT_CONTEXT_LENGTH: usize = 200;

/// Projection CLIP configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipConfig {
    /// Number of voxels in a flattened input volume
    pub image_dim: usize,
    /// Text vocabulary size (must cover the tokenizer's)
    pub vocab_size: usize,
    /// Token embedding width
    pub dim_text: usize,
    /// Shared latent width
    pub dim_latent: usize,
    /// Prompt length the text encoder expects
    pub context_length: usize,
    /// Initialization seed (None = entropy)
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            image_dim: 24 * 24 * 24,
            vocab_size: 30522,
            dim_text: 768,
            dim_latent: LATENT_DIM,
            context_length: TEXT_CONTEXT_LENGTH,
            seed: None,
        }
    }
}

impl ClipConfig {
    /// Check that the tokenizer's vocabulary fits the embedding table
    pub fn validate_vocab_size(&self, tokenizer_vocab_size: usize) -> anyhow::Result<()> {
        if tokenizer_vocab_size > self.vocab_size {
            anyhow::bail!(
                "Tokenizer vocabulary ({}) exceeds text encoder vocabulary ({})",
                tokenizer_vocab_size,
                self.vocab_size
            );
        }
        Ok(())
    }
}

/// Classification head configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadConfig {
    /// Input latent width
    pub latent_dim: usize,
    /// Number of output classes
    pub num_classes: usize,
    /// Dropout probability applied to the latents during training
    pub dropout: f32,
    /// Initialization and dropout seed (None = entropy)
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            latent_dim: LATENT_DIM,
            num_classes: NUM_CLASSES,
            dropout: 0.3,
            seed: None,
        }
    }
}

/// Checkpoint configuration of an encoder + head wrapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig<C> {
    /// Encoder configuration
    pub encoder: C,
    /// Head configuration
    pub head: HeadConfig,
}
