//! Checkpoint save/load functionality
//!
//! Weights are written in SafeTensors format to the exact path requested
//! (e.g. `checkpoint_10_epoch_3.pt`); configuration and training metadata go
//! to a JSON sidecar with the same stem (`checkpoint_10_epoch_3.json`).

use crate::error::ModelError;
use anyhow::{Context, Result};
use aprender::autograd::Tensor;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Checkpoint format version for compatibility checking
pub const CHECKPOINT_VERSION: &str = "1.0.0";

/// Parameters addressable by a stable name
pub trait NamedParameters {
    /// `(name, tensor)` pairs in a fixed order
    fn named_parameters(&self) -> Vec<(String, &Tensor)>;

    /// Mutable `(name, tensor)` pairs, same order as [`NamedParameters::named_parameters`]
    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)>;
}

/// A model that can be rebuilt from its serialized configuration
pub trait Checkpointable: NamedParameters + Sized {
    /// Architecture configuration stored in the metadata sidecar
    type Config: Serialize + DeserializeOwned;

    /// Current configuration
    fn checkpoint_config(&self) -> Self::Config;

    /// Build an (untrained) model from a configuration
    fn from_checkpoint_config(config: Self::Config) -> Result<Self>;
}

/// Checkpoint metadata containing training information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Training step number
    pub step: usize,
    /// Epoch number (1-indexed) if saved during training
    #[serde(default)]
    pub epoch: Option<usize>,
    /// Loss value at this checkpoint
    pub loss: Option<f32>,
    /// Learning rate at this checkpoint
    pub learning_rate: Option<f32>,
    /// Additional metadata as key-value pairs
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for CheckpointMetadata {
    fn default() -> Self {
        Self {
            step: 0,
            epoch: None,
            loss: None,
            learning_rate: None,
            extra: HashMap::new(),
        }
    }
}

/// Path of the JSON sidecar for a weights file
pub fn metadata_path(path: &Path) -> PathBuf {
    path.with_extension("json")
}

/// Write every named parameter to `path` in SafeTensors format
pub fn save_weights<M: NamedParameters + ?Sized>(model: &M, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create checkpoint directory: {}", parent.display())
            })?;
        }
    }

    let params = model.named_parameters();
    let buffers: Vec<(String, Vec<u8>, Vec<usize>)> = params
        .iter()
        .map(|(name, tensor)| {
            let bytes: Vec<u8> = bytemuck::cast_slice(tensor.data()).to_vec();
            (name.clone(), bytes, tensor.shape().to_vec())
        })
        .collect();

    let views = buffers
        .iter()
        .map(|(name, bytes, shape)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes)
                .map(|view| (name.as_str(), view))
                .map_err(|e| anyhow::anyhow!("Invalid tensor '{}': {}", name, e))
        })
        .collect::<Result<Vec<_>>>()?;

    let bytes = safetensors::serialize(views, None)
        .map_err(|e| anyhow::anyhow!("Failed to serialize weights: {}", e))?;
    fs::write(path, bytes)
        .with_context(|| format!("Failed to write weights file: {}", path.display()))?;

    Ok(())
}

/// Load every named parameter of `model` from the SafeTensors file at `path`
///
/// # Errors
/// Fails if the file is unreadable or corrupt, a tensor is missing, has a
/// non-`f32` dtype, or its shape differs from the model's parameter.
pub fn load_weights<M: NamedParameters + ?Sized>(model: &mut M, path: &Path) -> Result<()> {
    let bytes = fs::read(path)
        .with_context(|| format!("Failed to read weights file: {}", path.display()))?;
    let tensors = SafeTensors::deserialize(&bytes)
        .map_err(|e| anyhow::anyhow!("Failed to parse weights {}: {}", path.display(), e))?;

    for (name, param) in model.named_parameters_mut() {
        let view = tensors
            .tensor(&name)
            .map_err(|_| ModelError::MissingTensor(name.clone()))?;
        if view.dtype() != Dtype::F32 {
            return Err(ModelError::UnsupportedDtype {
                name,
                dtype: format!("{:?}", view.dtype()),
            }
            .into());
        }
        if view.shape() != param.shape() {
            return Err(ModelError::shape(name, param.shape(), view.shape()).into());
        }

        let data: Vec<f32> = view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        *param = Tensor::new(&data, view.shape());
    }

    Ok(())
}

/// Save weights plus a metadata sidecar holding the model configuration
///
/// # Arguments
/// * `model` - Model to save
/// * `path` - Weights path; the sidecar is `path` with a `.json` extension
/// * `metadata` - Optional training metadata
pub fn save_checkpoint<M: Checkpointable, P: AsRef<Path>>(
    model: &M,
    path: P,
    metadata: Option<CheckpointMetadata>,
) -> Result<()> {
    let path = path.as_ref();
    save_weights(model, path)?;

    let mut metadata = metadata.unwrap_or_default();
    metadata.extra.insert(
        "version".to_string(),
        serde_json::Value::String(CHECKPOINT_VERSION.to_string()),
    );
    metadata
        .extra
        .insert("config".to_string(), serde_json::to_value(model.checkpoint_config())?);

    let sidecar = metadata_path(path);
    let json_data = serde_json::to_string_pretty(&metadata)
        .context("Failed to serialize metadata to JSON")?;
    fs::write(&sidecar, json_data)
        .with_context(|| format!("Failed to write metadata file: {}", sidecar.display()))?;

    Ok(())
}

/// Read and validate the metadata sidecar of a checkpoint
pub fn load_metadata(path: &Path) -> Result<CheckpointMetadata> {
    let sidecar = metadata_path(path);
    let json_data = fs::read_to_string(&sidecar)
        .with_context(|| format!("Failed to read metadata file: {}", sidecar.display()))?;
    let metadata: CheckpointMetadata =
        serde_json::from_str(&json_data).context("Failed to parse metadata JSON")?;

    let version = metadata
        .extra
        .get("version")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("Missing version in metadata"))?;
    if version != CHECKPOINT_VERSION {
        return Err(ModelError::VersionMismatch {
            expected: CHECKPOINT_VERSION.to_string(),
            actual: version.to_string(),
        }
        .into());
    }

    Ok(metadata)
}

/// Rebuild a model from its checkpoint
///
/// # Returns
/// Tuple of (model, metadata)
pub fn load_checkpoint<M: Checkpointable, P: AsRef<Path>>(
    path: P,
) -> Result<(M, CheckpointMetadata)> {
    let path = path.as_ref();
    let metadata = load_metadata(path)?;

    let config_value = metadata
        .extra
        .get("config")
        .ok_or_else(|| anyhow::anyhow!("Missing config in metadata"))?;
    let config: M::Config = serde_json::from_value(config_value.clone())
        .context("Failed to parse config from metadata")?;

    let mut model = M::from_checkpoint_config(config)?;
    load_weights(&mut model, path)
        .with_context(|| format!("Failed to load weights from {}", path.display()))?;

    Ok((model, metadata))
}
