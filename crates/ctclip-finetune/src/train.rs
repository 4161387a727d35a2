//! Training loop for multi-label fine-tuning

use crate::clip::clip_grad_norm;
use crate::dataloader::VolumeDataLoader;
use crate::loss::WeightedBceWithLogits;
use crate::metrics::{MetricsLogger, TrainingMetrics};
use crate::optimizer::{AdamW, CosineSchedule, OptimizerConfig};
use crate::parallel::DataParallel;
use anyhow::{Context, Result};
use ctclip_model::{stability, CheckpointMetadata, ImageLatentsClassifier, LatentEncoder};
use ctclip_tokenizer::Tokenizer;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Training configuration
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Number of passes over the dataset
    pub epochs: usize,
    /// Batches between progress lines
    pub print_every: usize,
    /// Batches between checkpoints
    pub save_every: usize,
    /// Gradient clipping threshold (0.0 = disabled)
    pub grad_clip: f32,
    /// Token length of the text prompt
    pub max_text_length: usize,
    /// Directory receiving checkpoints and optimizer state
    pub save_dir: PathBuf,
}

/// What a finished run produced
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    /// Optimizer steps taken
    pub steps: usize,
    /// Loss of the last step
    pub final_loss: Option<f32>,
    /// Model checkpoints written, in order
    pub checkpoints: Vec<PathBuf>,
}

/// File name of a periodic model checkpoint
///
/// `epoch_index` is 0-based; the name carries the 1-based epoch.
///
/// # Example
/// ```
/// use ctclip_finetune::train::checkpoint_name;
///
/// assert_eq!(checkpoint_name(10, 2), "checkpoint_10_epoch_3.pt");
/// ```
pub fn checkpoint_name(batch_index: usize, epoch_index: usize) -> String {
    format!("checkpoint_{}_epoch_{}.pt", batch_index, epoch_index + 1)
}

/// File name of a periodic optimizer snapshot
pub fn optimizer_name(batch_index: usize, epoch_index: usize) -> String {
    format!("optim_{}_epoch_{}.pt", batch_index, epoch_index + 1)
}

/// File name of the end-of-training model checkpoint
pub fn final_checkpoint_name(epochs: usize) -> String {
    format!("checkpoint_{}.pt", epochs)
}

/// File name of the end-of-training optimizer snapshot
pub fn final_optimizer_name(epochs: usize) -> String {
    format!("optim_{}.pt", epochs)
}

fn save_state<E: LatentEncoder>(
    model: &ImageLatentsClassifier<E>,
    optimizer: &AdamW,
    save_dir: &Path,
    model_name: &str,
    optim_name: &str,
    metadata: CheckpointMetadata,
) -> Result<PathBuf> {
    std::fs::create_dir_all(save_dir)
        .with_context(|| format!("Failed to create save directory: {:?}", save_dir))?;

    let model_path = save_dir.join(model_name);
    log::info!("Saving model to {}", model_path.display());
    model.save(&model_path, Some(metadata))?;

    let optim_path = save_dir.join(optim_name);
    optimizer
        .save(&optim_path)
        .with_context(|| format!("Failed to save optimizer state to {:?}", optim_path))?;

    Ok(model_path)
}

/// Fine-tune the classifier (encoder image path and head)
///
/// Every step: set the scheduled learning rate, fetch a batch, run the
/// replicas on the empty prompt (encoded once up front), compute the weighted BCE loss, backprop,
/// clip, and take an AdamW step on the primary replica before broadcasting
/// it. Checkpoints are written every `save_every` batches and once more at
/// the end.
///
/// # Arguments
/// * `model` - Replicated classifier; the primary replica is trained
/// * `tokenizer` - Tokenizer for the text prompt
/// * `loader` - Batches of volumes and labels
/// * `loss_fn` - Weighted BCE loss
/// * `optimizer_config` - AdamW and warmup settings
/// * `config` - Loop settings
pub fn train<E: LatentEncoder>(
    model: &mut DataParallel<E>,
    tokenizer: &Tokenizer,
    loader: &mut VolumeDataLoader,
    loss_fn: &WeightedBceWithLogits,
    optimizer_config: &OptimizerConfig,
    config: &TrainingConfig,
) -> Result<TrainingSummary> {
    let num_batches = loader.len();
    if num_batches == 0 {
        anyhow::bail!("Data loader yields no batches");
    }
    if config.save_every == 0 {
        anyhow::bail!("save_every must be greater than 0");
    }

    let mut optimizer = AdamW::new(&model.primary().gradient_sizes(), optimizer_config);
    let schedule = CosineSchedule::new(
        optimizer_config.learning_rate,
        optimizer_config.warmup_length,
        config.epochs * num_batches,
    );
    let mut logger = MetricsLogger::new(config.print_every);

    // Text conditioning is neutralized: every step sees the empty prompt
    let prompt = tokenizer
        .encode_padded("", config.max_text_length)
        .context("Failed to encode the empty prompt")?;
    let prompts = [prompt];

    log::info!(
        "Training for {} epochs x {} batches on {} replica(s)",
        config.epochs,
        num_batches,
        model.num_replicas()
    );

    let mut summary = TrainingSummary {
        steps: 0,
        final_loss: None,
        checkpoints: Vec::new(),
    };

    for epoch in 0..config.epochs {
        model.train();
        loader.start_epoch();

        for i in 0..num_batches {
            let start_time = Instant::now();
            let step = i + epoch * num_batches;
            let lr = schedule.apply(&mut optimizer, step);

            // Gradients are rebuilt from scratch by every backward pass
            let batch = loader
                .batch(i)
                .with_context(|| format!("Failed to load batch {} of epoch {}", i, epoch))?;
            // Batch read and collate; the prompt was encoded before the loop
            let data_time = start_time.elapsed().as_secs_f32();

            let forward = model.forward(&prompts, &batch.images)?;
            let (loss, grad_logits) = loss_fn
                .forward_backward(&forward.logits, &batch.labels)
                .context("Failed to compute loss")?;
            if let Err(e) = stability::validate_values(&[loss], "loss") {
                log::warn!("Epoch {} batch {}: {}", epoch, i, e);
            }

            let mut grads = model.backward(&forward, &grad_logits)?;
            clip_grad_norm(&mut grads, config.grad_clip);
            optimizer.step(model.primary_mut().trainable_parameters_mut(), &grads)?;
            model.broadcast();
            let batch_time = start_time.elapsed().as_secs_f32();

            summary.steps += 1;
            summary.final_loss = Some(loss);

            logger.log_step(&TrainingMetrics {
                epoch,
                batch_index: i,
                num_batches,
                loss,
                data_time,
                batch_time,
            });

            if i % config.save_every == 0 {
                let metadata = CheckpointMetadata {
                    step,
                    epoch: Some(epoch + 1),
                    loss: Some(loss),
                    learning_rate: Some(lr),
                    ..Default::default()
                };
                let path = save_state(
                    model.primary(),
                    &optimizer,
                    &config.save_dir,
                    &checkpoint_name(i, epoch),
                    &optimizer_name(i, epoch),
                    metadata,
                )?;
                summary.checkpoints.push(path);
            }
        }
    }

    let metadata = CheckpointMetadata {
        step: summary.steps,
        epoch: Some(config.epochs),
        loss: summary.final_loss,
        learning_rate: Some(optimizer.lr()),
        ..Default::default()
    };
    let path = save_state(
        model.primary(),
        &optimizer,
        &config.save_dir,
        &final_checkpoint_name(config.epochs),
        &final_optimizer_name(config.epochs),
        metadata,
    )?;
    summary.checkpoints.push(path);

    log::info!("Fine-tuning finished after {} steps", summary.steps);
    Ok(summary)
}
