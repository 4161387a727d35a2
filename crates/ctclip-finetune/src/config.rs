//! Fine-tuning configuration file
//!
//! JSON layout with `model`, `training` and `optimizer` sections. Every field
//! has a default, so a config file only needs the values it changes.

use crate::loss::DEFAULT_CLASS_WEIGHTS;
use crate::optimizer::OptimizerConfig;
use anyhow::{Context, Result};
use ctclip_model::{LATENT_DIM, NUM_CLASSES, TEXT_CONTEXT_LENGTH};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete fine-tuning configuration loaded from file
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfigFile {
    /// Classifier head and prompt settings
    pub model: ModelSection,
    /// Training loop settings
    pub training: TrainingSection,
    /// AdamW and schedule settings
    pub optimizer: OptimizerSection,
}

/// Classifier head and prompt settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    /// Number of output labels
    pub num_classes: usize,
    /// Encoder latent width feeding the head
    pub latent_dim: usize,
    /// Head dropout probability
    pub dropout: f32,
    /// Token length of the (empty) text prompt
    pub max_text_length: usize,
    /// Positive-class weights; defaults to the CT abnormality weights
    pub class_weights: Option<Vec<f32>>,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            num_classes: NUM_CLASSES,
            latent_dim: LATENT_DIM,
            dropout: 0.3,
            max_text_length: TEXT_CONTEXT_LENGTH,
            class_weights: None,
        }
    }
}

/// Training loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSection {
    /// Number of passes over the dataset
    pub epochs: usize,
    /// Samples per batch
    pub batch_size: usize,
    /// Volume-loading worker threads
    pub num_workers: usize,
    /// Number of data-parallel replicas
    pub devices: usize,
    /// Batches between progress lines
    pub print_every: usize,
    /// Batches between checkpoints
    pub save_every: usize,
    /// Maximum global gradient norm (0.0 = disabled)
    pub grad_clip: f32,
    /// Seed for shuffling, head init and dropout (None = entropy)
    pub seed: Option<u64>,
}

impl Default for TrainingSection {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 8,
            num_workers: 8,
            devices: 1,
            print_every: 100,
            save_every: 1000,
            grad_clip: 1.0,
            seed: None,
        }
    }
}

/// AdamW and schedule settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerSection {
    /// Peak learning rate
    pub learning_rate: f32,
    /// Decoupled weight decay
    pub weight_decay: f32,
    /// AdamW beta1
    pub beta1: f32,
    /// AdamW beta2
    pub beta2: f32,
    /// AdamW epsilon
    pub eps: f32,
    /// Linear warmup steps
    pub warmup_length: usize,
}

impl Default for OptimizerSection {
    fn default() -> Self {
        let defaults = OptimizerConfig::default();
        Self {
            learning_rate: defaults.learning_rate,
            weight_decay: defaults.weight_decay,
            beta1: defaults.beta1,
            beta2: defaults.beta2,
            eps: defaults.eps,
            warmup_length: defaults.warmup_length,
        }
    }
}

impl From<&OptimizerSection> for OptimizerConfig {
    fn from(section: &OptimizerSection) -> Self {
        Self {
            learning_rate: section.learning_rate,
            weight_decay: section.weight_decay,
            beta1: section.beta1,
            beta2: section.beta2,
            eps: section.eps,
            warmup_length: section.warmup_length,
        }
    }
}

impl TrainingConfigFile {
    /// Load configuration from JSON file
    ///
    /// # Example
    /// ```no_run
    /// use ctclip_finetune::config::TrainingConfigFile;
    /// use std::path::Path;
    ///
    /// let config = TrainingConfigFile::from_file(Path::new("finetune.json"))?;
    /// config.validate()?;
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: TrainingConfigFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Class weights from the file, or the defaults
    pub fn class_weights(&self) -> Vec<f32> {
        self.model
            .class_weights
            .clone()
            .unwrap_or_else(|| DEFAULT_CLASS_WEIGHTS.to_vec())
    }

    /// Reject values the training loop cannot run with
    pub fn validate(&self) -> Result<()> {
        let t = &self.training;
        for (name, value) in [
            ("training.epochs", t.epochs),
            ("training.batch_size", t.batch_size),
            ("training.devices", t.devices),
            ("training.print_every", t.print_every),
            ("training.save_every", t.save_every),
            ("model.num_classes", self.model.num_classes),
            ("model.latent_dim", self.model.latent_dim),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        if !(0.0..1.0).contains(&self.model.dropout) {
            anyhow::bail!("model.dropout must be in [0, 1), got {}", self.model.dropout);
        }

        let weights = self.class_weights();
        if weights.len() != self.model.num_classes {
            anyhow::bail!(
                "Expected {} class weights, got {}",
                self.model.num_classes,
                weights.len()
            );
        }
        if weights.iter().any(|w| !w.is_finite() || *w <= 0.0) {
            anyhow::bail!("Class weights must be positive and finite");
        }

        let o = &self.optimizer;
        if !(o.learning_rate.is_finite() && o.learning_rate > 0.0) {
            anyhow::bail!("optimizer.learning_rate must be positive, got {}", o.learning_rate);
        }
        if o.weight_decay < 0.0 {
            anyhow::bail!("optimizer.weight_decay must not be negative");
        }
        if !(0.0..1.0).contains(&o.beta1) || !(0.0..1.0).contains(&o.beta2) {
            anyhow::bail!("AdamW betas must be in [0, 1)");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_default() {
        let config = TrainingConfigFile::default();
        assert_eq!(config.model.num_classes, 18);
        assert_eq!(config.training.batch_size, 8);
        assert_eq!(config.optimizer.warmup_length, 500);
        assert_eq!(config.class_weights().len(), 18);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_from_file() {
        let config_json = r#"{
            "training": { "epochs": 2, "batch_size": 4, "seed": 7 },
            "optimizer": { "learning_rate": 0.0005 }
        }"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(config_json.as_bytes()).unwrap();

        let config = TrainingConfigFile::from_file(temp_file.path()).unwrap();
        assert_eq!(config.training.epochs, 2);
        assert_eq!(config.training.batch_size, 4);
        assert_eq!(config.training.seed, Some(7));
        assert_eq!(config.training.save_every, 1000);
        assert_eq!(config.optimizer.learning_rate, 0.0005);
        assert_eq!(config.optimizer.weight_decay, 0.1);
        assert_eq!(config.model.dropout, 0.3);
    }

    #[test]
    fn test_zero_epochs_rejected() {
        let mut config = TrainingConfigFile::default();
        config.training.epochs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("training.epochs"));
    }

    #[test]
    fn test_class_weight_length_checked() {
        let mut config = TrainingConfigFile::default();
        config.model.class_weights = Some(vec![1.0; 5]);
        assert!(config.validate().is_err());

        config.model.num_classes = 5;
        assert!(config.validate().is_ok());

        config.model.class_weights = Some(vec![1.0, 1.0, -1.0, 1.0, 1.0]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_json_reports_path() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"{ not json").unwrap();
        let err = TrainingConfigFile::from_file(temp_file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
