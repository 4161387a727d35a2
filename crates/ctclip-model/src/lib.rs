//! CT-CLIP model components for multi-label fine-tuning
//!
//! This crate provides:
//! - The [`LatentEncoder`] seam and the [`ProjectionClip`] image/text encoder pair
//! - A ReLU -> Dropout -> Linear [`ClassificationHead`] with analytic backward
//! - [`ImageLatentsClassifier`], which chains the two and backpropagates into
//!   the encoder's image path
//! - SafeTensors checkpoints with a JSON metadata sidecar
//!
//! # Example
//!
//! ```no_run
//! use ctclip_model::{load_checkpoint, HeadConfig, ImageLatentsClassifier, ProjectionClip};
//! use ctclip_tokenizer::TokenizedPrompt;
//! use aprender::autograd::Tensor;
//!
//! // Load the pretrained encoder pair
//! let (encoder, _meta) = load_checkpoint::<ProjectionClip, _>("ctclip.pt")?;
//! let image_dim = encoder.config().image_dim;
//! let context = encoder.config().context_length;
//!
//! // Attach an 18-class head
//! let mut model = ImageLatentsClassifier::new(encoder, HeadConfig::default())?;
//! model.eval();
//!
//! let prompt = TokenizedPrompt::from_ids(Vec::new(), context, 0);
//! let images = Tensor::zeros(&[2, image_dim]);
//! let logits = model.forward(&[prompt], &images)?;
//! // logits shape: [2, 18]
//!
//! model.save("checkpoint_0_epoch_1.pt", None)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod encoder;
pub mod error;
pub mod grad;
pub mod head;
pub mod stability;

mod init;
mod ops;

/// Checkpoint management
///
/// Weights go to the requested path in SafeTensors format; configuration and
/// training metadata go to a `.json` sidecar next to it.
pub use checkpoint::{
    load_checkpoint, load_weights, save_checkpoint, CheckpointMetadata, Checkpointable,
    NamedParameters,
};

/// Classification wrapper (encoder + head)
pub use classifier::{ClassifierCache, ImageLatentsClassifier};

/// Model configuration
pub use config::{ClassifierConfig, ClipConfig, HeadConfig, LATENT_DIM, NUM_CLASSES, TEXT_CONTEXT_LENGTH};

/// Encoder pair
pub use encoder::{EncoderOutput, ImageCache, LatentEncoder, LatentRequest, ProjectionClip};

pub use error::ModelError;
pub use grad::Gradients;
pub use head::{ClassificationHead, HeadCache};

// Re-export common types for convenience
/// Result type alias for error handling
pub use anyhow::Result;
/// Error type alias for error handling
pub use anyhow::Error;
