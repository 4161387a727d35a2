//! Fine-tune a multi-label abnormality classifier on a pretrained CT-CLIP model
//!
//! # Usage
//!
//! ```bash
//! ctclip-finetune \
//!   --pretrained ./ctclip.pt \
//!   --tokenizer ./tokenizer \
//!   --data-folder ./train_volumes \
//!   --reports-file ./train_reports.csv \
//!   --labels ./train_labels.csv \
//!   --save ./checkpoints \
//!   [--config finetune.json] \
//!   [--lr 1e-3] [--wd 0.1] [--warmup-length 500] [--epochs 10] \
//!   [--batch-size 8] [--workers 8] [--devices 1] \
//!   [--print-every 100] [--save-every 1000] [--seed 42]
//! ```
//!
//! Command-line values override the config file, which overrides defaults.
//! `RUST_LOG` controls log verbosity (default `info`, `warn` with `--quiet`).

use anyhow::{Context, Result};
use clap::Parser;
use ctclip_finetune::{
    config::TrainingConfigFile,
    dataloader::VolumeDataLoader,
    dataset::CtReportDataset,
    loss::WeightedBceWithLogits,
    optimizer::OptimizerConfig,
    parallel::{DataParallel, DeviceSet},
    train::{train, TrainingConfig},
};
use ctclip_model::{load_checkpoint, HeadConfig, ImageLatentsClassifier, LatentEncoder, ProjectionClip};
use ctclip_tokenizer::Tokenizer;
use std::path::PathBuf;

/// Fine-tune a multi-label classifier on a pretrained CT-CLIP encoder
#[derive(Parser, Debug)]
#[command(name = "ctclip-finetune")]
#[command(
    about = "Fine-tune a multi-label classifier on a pretrained CT-CLIP encoder",
    long_about = None
)]
struct Args {
    /// Path to JSON configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Pretrained encoder checkpoint (SafeTensors + JSON sidecar)
    #[arg(long, value_name = "PATH", required = true)]
    pretrained: PathBuf,

    /// Directory containing tokenizer.json
    #[arg(long, value_name = "PATH", required = true)]
    tokenizer: PathBuf,

    /// Folder searched recursively for volume files
    #[arg(long, value_name = "PATH", required = true)]
    data_folder: PathBuf,

    /// Reports CSV (VolumeName, Findings_EN, Impressions_EN)
    #[arg(long, value_name = "PATH", required = true)]
    reports_file: PathBuf,

    /// Labels CSV (VolumeName plus one column per class)
    #[arg(long, value_name = "PATH", required = true)]
    labels: PathBuf,

    /// Directory for checkpoints
    #[arg(long, value_name = "PATH", default_value = "checkpoints")]
    save: PathBuf,

    /// Peak learning rate
    #[arg(long)]
    lr: Option<f32>,

    /// Weight decay
    #[arg(long)]
    wd: Option<f32>,

    /// Linear warmup steps
    #[arg(long)]
    warmup_length: Option<usize>,

    /// Number of epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Samples per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Volume-loading worker threads
    #[arg(long)]
    workers: Option<usize>,

    /// Number of data-parallel replicas
    #[arg(long)]
    devices: Option<usize>,

    /// Batches between progress lines
    #[arg(long)]
    print_every: Option<usize>,

    /// Batches between checkpoints
    #[arg(long)]
    save_every: Option<usize>,

    /// Seed for shuffling, head initialization and dropout
    #[arg(long)]
    seed: Option<u64>,

    /// Only log warnings and errors
    #[arg(long)]
    quiet: bool,
}

impl Args {
    /// Apply command-line overrides on top of the file configuration
    fn apply_overrides(&self, config: &mut TrainingConfigFile) {
        let o = &mut config.optimizer;
        if let Some(lr) = self.lr {
            o.learning_rate = lr;
        }
        if let Some(wd) = self.wd {
            o.weight_decay = wd;
        }
        if let Some(warmup) = self.warmup_length {
            o.warmup_length = warmup;
        }

        let t = &mut config.training;
        if let Some(epochs) = self.epochs {
            t.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            t.batch_size = batch_size;
        }
        if let Some(workers) = self.workers {
            t.num_workers = workers;
        }
        if let Some(devices) = self.devices {
            t.devices = devices;
        }
        if let Some(print_every) = self.print_every {
            t.print_every = print_every;
        }
        if let Some(save_every) = self.save_every {
            t.save_every = save_every;
        }
        if self.seed.is_some() {
            t.seed = self.seed;
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    // Load configuration from file or use defaults
    let mut config = match &args.config {
        Some(path) => TrainingConfigFile::from_file(path).context("Failed to load config file")?,
        None => TrainingConfigFile::default(),
    };
    args.apply_overrides(&mut config);
    config.validate().context("Invalid configuration")?;

    // Load the pretrained encoder pair
    let (encoder, _metadata) = load_checkpoint::<ProjectionClip, _>(&args.pretrained)
        .with_context(|| format!("Failed to load pretrained model from: {:?}", args.pretrained))?;

    let tokenizer = Tokenizer::from_directory(&args.tokenizer)
        .context("Failed to load tokenizer. Ensure tokenizer.json exists in the tokenizer directory")?;
    encoder
        .config()
        .validate_vocab_size(tokenizer.vocab_size())
        .map_err(|e| anyhow::anyhow!("Tokenizer-model incompatibility: {}", e))?;
    if encoder.context_length() != config.model.max_text_length {
        anyhow::bail!(
            "model.max_text_length ({}) must match the text encoder context length ({})",
            config.model.max_text_length,
            encoder.context_length()
        );
    }
    let image_dim = encoder.image_dim();

    let seed = config.training.seed.unwrap_or_else(rand::random);
    log::info!("Using seed {}", seed);

    let classifier = ImageLatentsClassifier::new(
        encoder,
        HeadConfig {
            latent_dim: config.model.latent_dim,
            num_classes: config.model.num_classes,
            dropout: config.model.dropout,
            seed: Some(seed),
        },
    )?;

    let devices = DeviceSet::cpu(config.training.devices)?;
    let mut model = DataParallel::new(classifier, &devices, seed)?;

    let dataset = CtReportDataset::open(
        &args.data_folder,
        &args.reports_file,
        &args.labels,
        image_dim,
        config.model.num_classes,
    )
    .context("Failed to load dataset")?;
    let mut loader = VolumeDataLoader::new(
        dataset,
        config.training.batch_size,
        config.training.num_workers,
        true,
        Some(seed),
    )?;

    let loss_fn = WeightedBceWithLogits::new(config.class_weights())?;
    let optimizer_config = OptimizerConfig::from(&config.optimizer);
    let training_config = TrainingConfig {
        epochs: config.training.epochs,
        print_every: config.training.print_every,
        save_every: config.training.save_every,
        grad_clip: config.training.grad_clip,
        max_text_length: config.model.max_text_length,
        save_dir: args.save.clone(),
    };

    let summary = train(
        &mut model,
        &tokenizer,
        &mut loader,
        &loss_fn,
        &optimizer_config,
        &training_config,
    )
    .context("Training failed")?;

    log::info!(
        "Fine-tuning completed: {} steps, final loss {:?}, {} checkpoints in {:?}",
        summary.steps,
        summary.final_loss,
        summary.checkpoints.len(),
        args.save
    );

    Ok(())
}
