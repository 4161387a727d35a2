//! Multi-label fine-tuning of a CT-CLIP classifier
//!
//! This crate provides:
//! - The CT report dataset reader and a shuffling, multi-threaded batch loader
//! - Class-weighted BCE-with-logits loss
//! - AdamW with a warmup + cosine learning-rate schedule
//! - Global gradient norm clipping
//! - Data-parallel classifier replicas over an explicit device set
//! - The training loop and its JSON configuration

pub mod clip;
pub mod config;
pub mod dataloader;
pub mod dataset;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod parallel;
pub mod train;

pub use clip::clip_grad_norm;
pub use config::TrainingConfigFile;
pub use dataloader::{Batch, VolumeDataLoader};
pub use dataset::{CtReportDataset, Sample};
pub use loss::{WeightedBceWithLogits, DEFAULT_CLASS_WEIGHTS};
pub use optimizer::{cosine_lr, AdamW, CosineSchedule, OptimizerConfig};
pub use parallel::{DataParallel, Device, DeviceSet};
pub use train::{train, TrainingConfig, TrainingSummary};
