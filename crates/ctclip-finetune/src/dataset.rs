//! CT report dataset: volumes, report text and multi-hot labels
//!
//! Three inputs are joined on the volume name:
//! - a labels CSV (`VolumeName` plus one 0/1 column per class)
//! - a reports CSV (`VolumeName`, `Findings_EN`, `Impressions_EN`)
//! - a folder searched recursively for `*.safetensors` volumes, each holding
//!   one `f32` tensor named `volume`
//!
//! CSV names may carry a `.nii.gz` or `.nii` suffix; it is stripped before
//! matching against the volume file stem.

use anyhow::{Context, Result};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the tensor holding the voxels inside a volume file
pub const VOLUME_TENSOR: &str = "volume";

/// Extension of volume files
pub const VOLUME_EXTENSION: &str = "safetensors";

/// One training example
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Flattened volume, `image_dim` values
    pub image: Vec<f32>,
    /// Findings and impressions, space separated
    pub text: String,
    /// Multi-hot labels, `num_classes` values
    pub labels: Vec<f32>,
}

/// A volume on disk joined with its report and labels
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeRecord {
    /// Volume name (file stem)
    pub name: String,
    /// Path of the volume file
    pub path: PathBuf,
    /// Report text
    pub text: String,
    /// Multi-hot labels
    pub labels: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ReportRow {
    #[serde(rename = "VolumeName")]
    volume_name: String,
    #[serde(rename = "Findings_EN", default)]
    findings: Option<String>,
    #[serde(rename = "Impressions_EN", default)]
    impressions: Option<String>,
}

/// Strip a trailing `.nii.gz` or `.nii` from a volume name
pub fn volume_key(name: &str) -> &str {
    let name = name.trim();
    name.strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(name)
}

/// Read the flattened voxels of a volume file
///
/// # Errors
/// Fails if the file is unreadable, lacks a `volume` tensor, is not `f32`,
/// or does not hold exactly `image_dim` values.
pub fn read_volume(path: &Path, image_dim: usize) -> Result<Vec<f32>> {
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read volume: {}", path.display()))?;
    let tensors = SafeTensors::deserialize(&bytes)
        .map_err(|e| anyhow::anyhow!("Failed to parse volume {}: {}", path.display(), e))?;
    let view = tensors.tensor(VOLUME_TENSOR).map_err(|_| {
        anyhow::anyhow!(
            "Volume {} has no '{}' tensor",
            path.display(),
            VOLUME_TENSOR
        )
    })?;
    if view.dtype() != Dtype::F32 {
        anyhow::bail!(
            "Volume {} has dtype {:?}, expected F32",
            path.display(),
            view.dtype()
        );
    }

    let numel: usize = view.shape().iter().product();
    if numel != image_dim {
        anyhow::bail!(
            "Volume {} has {} voxels (shape {:?}), expected {}",
            path.display(),
            numel,
            view.shape(),
            image_dim
        );
    }

    Ok(view
        .data()
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Write a volume file readable by [`read_volume`]
pub fn write_volume(path: &Path, voxels: &[f32], shape: &[usize]) -> Result<()> {
    let numel: usize = shape.iter().product();
    if numel != voxels.len() {
        anyhow::bail!("Shape {:?} does not match {} voxels", shape, voxels.len());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let bytes: &[u8] = bytemuck::cast_slice(voxels);
    let view = TensorView::new(Dtype::F32, shape.to_vec(), bytes)
        .map_err(|e| anyhow::anyhow!("Invalid volume tensor: {}", e))?;
    let data = safetensors::serialize([(VOLUME_TENSOR, view)], None)
        .map_err(|e| anyhow::anyhow!("Failed to serialize volume: {}", e))?;
    fs::write(path, data).with_context(|| format!("Failed to write volume: {}", path.display()))
}

fn collect_volume_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read directory: {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            collect_volume_files(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some(VOLUME_EXTENSION) {
            out.push(path);
        }
    }
    Ok(())
}

/// Read the labels CSV
///
/// # Returns
/// Label column names and a map from volume key to labels
pub fn read_labels(path: &Path, num_classes: usize) -> Result<(Vec<String>, HashMap<String, Vec<f32>>)> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open labels file: {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("Failed to read labels header: {}", path.display()))?
        .clone();

    let name_col = headers
        .iter()
        .position(|h| h == "VolumeName")
        .with_context(|| format!("Labels file {} has no VolumeName column", path.display()))?;
    let label_names: Vec<String> = headers
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != name_col)
        .map(|(_, h)| h.to_string())
        .collect();
    if label_names.len() != num_classes {
        anyhow::bail!(
            "Labels file {} has {} label columns, expected {}",
            path.display(),
            label_names.len(),
            num_classes
        );
    }

    let mut labels = HashMap::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Bad row {} in {}", row + 1, path.display()))?;
        let name = record.get(name_col).unwrap_or_default();
        let values = record
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != name_col)
            .map(|(_, cell)| {
                cell.trim().parse::<f32>().with_context(|| {
                    format!("Invalid label '{}' for {} in {}", cell, name, path.display())
                })
            })
            .collect::<Result<Vec<f32>>>()?;
        labels.insert(volume_key(name).to_string(), values);
    }

    Ok((label_names, labels))
}

/// Read the reports CSV into a map from volume key to report text
pub fn read_reports(path: &Path) -> Result<HashMap<String, String>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open reports file: {}", path.display()))?;

    let mut reports = HashMap::new();
    for (row, result) in reader.deserialize::<ReportRow>().enumerate() {
        let report = result.with_context(|| format!("Bad row {} in {}", row + 1, path.display()))?;
        let text = [report.findings, report.impressions]
            .into_iter()
            .flatten()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        reports.insert(volume_key(&report.volume_name).to_string(), text);
    }
    Ok(reports)
}

/// Dataset of labelled CT volumes with their reports
#[derive(Debug, Clone)]
pub struct CtReportDataset {
    records: Vec<VolumeRecord>,
    label_names: Vec<String>,
    image_dim: usize,
}

impl CtReportDataset {
    /// Index a dataset
    ///
    /// Volumes are read lazily by [`CtReportDataset::get`]; only names,
    /// reports and labels are loaded here.
    ///
    /// # Arguments
    /// * `data_folder` - Root folder searched recursively for volume files
    /// * `reports_file` - Reports CSV
    /// * `labels_file` - Labels CSV
    /// * `image_dim` - Voxels per volume
    /// * `num_classes` - Expected number of label columns
    pub fn open(
        data_folder: &Path,
        reports_file: &Path,
        labels_file: &Path,
        image_dim: usize,
        num_classes: usize,
    ) -> Result<Self> {
        let (label_names, mut labels) = read_labels(labels_file, num_classes)?;
        let mut reports = read_reports(reports_file)?;

        let mut files = Vec::new();
        collect_volume_files(data_folder, &mut files)?;
        files.sort();

        let mut records = Vec::with_capacity(files.len());
        for path in files {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(|s| volume_key(s).to_string())
                .unwrap_or_default();
            let Some(sample_labels) = labels.remove(&stem) else {
                log::debug!("Skipping {}: no label row", path.display());
                continue;
            };
            let text = reports.remove(&stem).unwrap_or_default();
            records.push(VolumeRecord {
                name: stem,
                path,
                text,
                labels: sample_labels,
            });
        }

        for name in labels.keys() {
            log::debug!("Label row {} has no volume file", name);
        }
        if records.is_empty() {
            anyhow::bail!(
                "No labelled volumes found under {}",
                data_folder.display()
            );
        }
        log::info!(
            "Indexed {} volumes from {}",
            records.len(),
            data_folder.display()
        );

        Ok(Self {
            records,
            label_names,
            image_dim,
        })
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if the dataset holds no samples
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Voxels per volume
    pub fn image_dim(&self) -> usize {
        self.image_dim
    }

    /// Label column names, in label order
    pub fn label_names(&self) -> &[String] {
        &self.label_names
    }

    /// Indexed records, sorted by path
    pub fn records(&self) -> &[VolumeRecord] {
        &self.records
    }

    /// Load sample `index`, reading its volume from disk
    pub fn get(&self, index: usize) -> Result<Sample> {
        let record = self
            .records
            .get(index)
            .with_context(|| format!("Sample index {} out of range ({})", index, self.len()))?;
        let image = read_volume(&record.path, self.image_dim)?;
        Ok(Sample {
            image,
            text: record.text.clone(),
            labels: record.labels.clone(),
        })
    }
}
