//! Data-parallel replicas over an explicit device set
//!
//! [`DataParallel`] owns one classifier replica per [`Device`]. A batch is
//! scattered into contiguous row shards, each replica runs its shard on a
//! rayon pool, and logits are gathered back in row order. The caller
//! computes the loss on the gathered logits; [`DataParallel::backward`]
//! scatters `dL/dlogits` back and sums the shard gradients, which equals the
//! full-batch gradient. After an optimizer step on the primary replica,
//! [`DataParallel::broadcast`] copies its parameters to the others.

use anyhow::{Context, Result};
use aprender::autograd::Tensor;
use ctclip_model::{ClassifierCache, Gradients, ImageLatentsClassifier, LatentEncoder};
use ctclip_tokenizer::TokenizedPrompt;
use rayon::prelude::*;
use std::fmt;
use std::ops::Range;

/// A CPU worker device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    ordinal: usize,
}

impl Device {
    /// Device with the given ordinal
    pub fn cpu(ordinal: usize) -> Self {
        Self { ordinal }
    }

    /// Device ordinal
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu:{}", self.ordinal)
    }
}

/// Non-empty set of devices; the first one is the primary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSet {
    devices: Vec<Device>,
}

impl DeviceSet {
    /// Wrap an explicit device list
    ///
    /// # Errors
    /// Fails on an empty list.
    pub fn new(devices: Vec<Device>) -> Result<Self> {
        if devices.is_empty() {
            anyhow::bail!("At least one device is required");
        }
        Ok(Self { devices })
    }

    /// `count` CPU devices numbered from 0
    pub fn cpu(count: usize) -> Result<Self> {
        Self::new((0..count).map(Device::cpu).collect())
    }

    /// Number of devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// True if the set holds no devices
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Primary device
    pub fn primary(&self) -> Device {
        self.devices[0]
    }

    /// Iterate over the devices
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }
}

struct Replica<E: LatentEncoder> {
    device: Device,
    model: ImageLatentsClassifier<E>,
}

/// Per-shard state kept between forward and backward
struct ShardCache<C> {
    rows: Range<usize>,
    cache: ClassifierCache<C>,
}

/// Gathered result of a data-parallel forward pass
pub struct ParallelForward<C> {
    /// Logits `[batch, num_classes]` in input row order
    pub logits: Tensor,
    shards: Vec<ShardCache<C>>,
    num_classes: usize,
}

impl<C> ParallelForward<C> {
    /// Number of shards the batch was split into
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }
}

/// Contiguous row ranges for `rows` split over at most `parts` shards
pub fn shard_ranges(rows: usize, parts: usize) -> Vec<Range<usize>> {
    if rows == 0 || parts == 0 {
        return Vec::new();
    }
    let chunk = rows.div_ceil(parts);
    (0..rows)
        .step_by(chunk)
        .map(|start| start..(start + chunk).min(rows))
        .collect()
}

/// One classifier replica per device
pub struct DataParallel<E: LatentEncoder> {
    replicas: Vec<Replica<E>>,
    pool: rayon::ThreadPool,
}

impl<E: LatentEncoder> DataParallel<E> {
    /// Replicate `model` onto every device
    ///
    /// Replica `k` draws dropout masks from `dropout_seed + k`.
    pub fn new(
        model: ImageLatentsClassifier<E>,
        devices: &DeviceSet,
        dropout_seed: u64,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(devices.len())
            .thread_name(|i| format!("replica-{i}"))
            .build()
            .context("Failed to build replica thread pool")?;

        let replicas = devices
            .iter()
            .enumerate()
            .map(|(k, &device)| {
                let mut replica = model.clone();
                replica.reseed_dropout(dropout_seed.wrapping_add(k as u64));
                Replica {
                    device,
                    model: replica,
                }
            })
            .collect();

        Ok(Self { replicas, pool })
    }

    /// Number of replicas
    pub fn num_replicas(&self) -> usize {
        self.replicas.len()
    }

    /// Devices backing the replicas
    pub fn devices(&self) -> Vec<Device> {
        self.replicas.iter().map(|r| r.device).collect()
    }

    /// Replica whose parameters the optimizer updates
    pub fn primary(&self) -> &ImageLatentsClassifier<E> {
        &self.replicas[0].model
    }

    /// Mutable primary replica; call [`DataParallel::broadcast`] after changing it
    pub fn primary_mut(&mut self) -> &mut ImageLatentsClassifier<E> {
        &mut self.replicas[0].model
    }

    /// Every replica in device order, primary first
    pub fn replicas(&self) -> impl Iterator<Item = &ImageLatentsClassifier<E>> {
        self.replicas.iter().map(|r| &r.model)
    }

    /// True if every replica holds the primary's trainable parameters
    pub fn replicas_in_sync(&self) -> bool {
        let primary = self.primary().trainable_parameters();
        self.replicas().skip(1).all(|replica| {
            replica
                .trainable_parameters()
                .iter()
                .zip(&primary)
                .all(|(a, b)| a.data() == b.data())
        })
    }

    /// Enable dropout on every replica
    pub fn train(&mut self) {
        self.replicas.iter_mut().for_each(|r| r.model.train());
    }

    /// Disable dropout on every replica
    pub fn eval(&mut self) {
        self.replicas.iter_mut().for_each(|r| r.model.eval());
    }

    /// Scatter `images` over the replicas, run forward, gather logits
    ///
    /// # Arguments
    /// * `prompts` - One shared prompt, or one per row
    /// * `images` - `[batch, image_dim]`
    pub fn forward(
        &mut self,
        prompts: &[TokenizedPrompt],
        images: &Tensor,
    ) -> Result<ParallelForward<E::Cache>> {
        let shape = images.shape();
        if shape.len() != 2 {
            anyhow::bail!("Expected images of shape [batch, image_dim], got {:?}", shape);
        }
        let (batch, image_dim) = (shape[0], shape[1]);
        let shared_prompt = prompts.len() == 1;
        if !shared_prompt && prompts.len() != batch {
            anyhow::bail!(
                "Expected 1 or {} prompts, got {}",
                batch,
                prompts.len()
            );
        }

        let ranges = shard_ranges(batch, self.replicas.len());
        let data = images.data();
        let inputs: Vec<(Range<usize>, Tensor)> = ranges
            .into_iter()
            .map(|rows| {
                let shard = &data[rows.start * image_dim..rows.end * image_dim];
                let tensor = Tensor::new(shard, &[rows.len(), image_dim]);
                (rows, tensor)
            })
            .collect();

        let outputs = self.pool.install(|| {
            self.replicas
                .par_iter_mut()
                .zip(inputs.into_par_iter())
                .map(|(replica, (rows, shard))| {
                    let shard_prompts = if shared_prompt {
                        prompts
                    } else {
                        &prompts[rows.clone()]
                    };
                    let (logits, cache) = replica
                        .model
                        .forward_with_cache(shard_prompts, &shard)
                        .with_context(|| format!("Forward failed on {}", replica.device))?;
                    Ok((logits, ShardCache { rows, cache }))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let num_classes = self.primary().head().config().num_classes;
        let mut gathered = Vec::with_capacity(batch * num_classes);
        let mut shards = Vec::with_capacity(outputs.len());
        for (logits, shard) in outputs {
            gathered.extend_from_slice(logits.data());
            shards.push(shard);
        }

        Ok(ParallelForward {
            logits: Tensor::new(&gathered, &[batch, num_classes]),
            shards,
            num_classes,
        })
    }

    /// Scatter `dL/dlogits` to the shards and sum their gradients
    pub fn backward(
        &self,
        forward: &ParallelForward<E::Cache>,
        grad_logits: &[f32],
    ) -> Result<Gradients> {
        let c = forward.num_classes;
        if grad_logits.len() != forward.logits.data().len() {
            anyhow::bail!(
                "Gradient has {} values, logits have {}",
                grad_logits.len(),
                forward.logits.data().len()
            );
        }

        let shard_grads = self.pool.install(|| {
            self.replicas
                .par_iter()
                .zip(forward.shards.par_iter())
                .map(|(replica, shard)| {
                    let g = &grad_logits[shard.rows.start * c..shard.rows.end * c];
                    replica.model.backward(&shard.cache, g)
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let mut total = Gradients::zeros(&self.primary().gradient_sizes());
        for grads in &shard_grads {
            total.add_scaled(grads, 1.0);
        }
        Ok(total)
    }

    /// Copy the primary's trainable parameters to every other replica
    pub fn broadcast(&mut self) {
        if let Some((primary, rest)) = self.replicas.split_first_mut() {
            for replica in rest {
                replica.model.copy_trainable_from(&primary.model);
            }
        }
    }
}
