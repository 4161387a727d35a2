//! Shuffled mini-batches over a [`CtReportDataset`]
//!
//! Volume reads for one batch are fanned out over a dedicated rayon pool of
//! `num_workers` threads.

use crate::dataset::{CtReportDataset, Sample};
use anyhow::{Context, Result};
use aprender::autograd::Tensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// A collated batch
pub struct Batch {
    /// Flattened volumes `[batch, image_dim]`
    pub images: Tensor,
    /// Report texts, one per row
    pub texts: Vec<String>,
    /// Multi-hot labels `[batch, num_classes]`
    pub labels: Tensor,
}

impl Batch {
    /// Number of rows
    pub fn len(&self) -> usize {
        self.texts.len()
    }

    /// True for an empty batch
    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    /// Stack samples row-wise
    pub fn collate(samples: Vec<Sample>) -> Result<Self> {
        let first = samples.first().context("Cannot collate an empty batch")?;
        let (image_dim, num_classes) = (first.image.len(), first.labels.len());
        let rows = samples.len();

        let mut images = Vec::with_capacity(rows * image_dim);
        let mut labels = Vec::with_capacity(rows * num_classes);
        let mut texts = Vec::with_capacity(rows);
        for sample in samples {
            if sample.image.len() != image_dim || sample.labels.len() != num_classes {
                anyhow::bail!("Samples in a batch must share image and label sizes");
            }
            images.extend_from_slice(&sample.image);
            labels.extend_from_slice(&sample.labels);
            texts.push(sample.text);
        }

        Ok(Self {
            images: Tensor::new(&images, &[rows, image_dim]),
            texts,
            labels: Tensor::new(&labels, &[rows, num_classes]),
        })
    }
}

/// DataLoader state for logging and reproducibility
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataLoaderState {
    /// Epochs started so far
    pub epoch: usize,
    /// RNG seed
    pub rng_seed: u64,
}

/// Batching loader over CT volumes
pub struct VolumeDataLoader {
    dataset: CtReportDataset,
    batch_size: usize,
    shuffle: bool,
    pool: rayon::ThreadPool,
    order: Vec<usize>,
    rng: StdRng,
    state: DataLoaderState,
}

impl VolumeDataLoader {
    /// Create a loader
    ///
    /// # Arguments
    /// * `dataset` - Indexed dataset
    /// * `batch_size` - Samples per batch (the last batch may be smaller)
    /// * `num_workers` - Threads reading volumes (0 = one per core)
    /// * `shuffle` - Reshuffle the sample order at every epoch
    /// * `seed` - Shuffle seed (None = non-deterministic)
    pub fn new(
        dataset: CtReportDataset,
        batch_size: usize,
        num_workers: usize,
        shuffle: bool,
        seed: Option<u64>,
    ) -> Result<Self> {
        if batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .thread_name(|i| format!("volume-loader-{i}"))
            .build()
            .context("Failed to build data loader thread pool")?;

        let rng_seed = seed.unwrap_or_else(rand::random);
        let order = (0..dataset.len()).collect();

        Ok(Self {
            dataset,
            batch_size,
            shuffle,
            pool,
            order,
            rng: StdRng::seed_from_u64(rng_seed),
            state: DataLoaderState { epoch: 0, rng_seed },
        })
    }

    /// Number of batches per epoch, `ceil(samples / batch_size)`
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// True if an epoch has no batches
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Underlying dataset
    pub fn dataset(&self) -> &CtReportDataset {
        &self.dataset
    }

    /// Loader state
    pub fn state(&self) -> &DataLoaderState {
        &self.state
    }

    /// Begin a new epoch, reshuffling the sample order if enabled
    pub fn start_epoch(&mut self) {
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
        self.state.epoch += 1;
    }

    /// Sample indices of batch `index` in the current order
    pub fn batch_indices(&self, index: usize) -> &[usize] {
        let start = (index * self.batch_size).min(self.order.len());
        let end = (start + self.batch_size).min(self.order.len());
        &self.order[start..end]
    }

    /// Load and collate batch `index` of the current epoch
    pub fn batch(&self, index: usize) -> Result<Batch> {
        if index >= self.len() {
            anyhow::bail!("Batch index {} out of range ({})", index, self.len());
        }
        let indices = self.batch_indices(index);
        let samples = self.pool.install(|| {
            indices
                .par_iter()
                .map(|&i| self.dataset.get(i))
                .collect::<Result<Vec<Sample>>>()
        })?;
        Batch::collate(samples)
    }

    /// Iterate over the batches of the current epoch
    pub fn iter(&self) -> impl Iterator<Item = Result<Batch>> + '_ {
        (0..self.len()).map(move |i| self.batch(i))
    }
}
