//! Tests for the CT report dataset and batch loader

use ctclip_finetune::dataloader::VolumeDataLoader;
use ctclip_finetune::dataset::{write_volume, CtReportDataset};
use std::path::Path;
use tempfile::TempDir;

const IMAGE_DIM: usize = 8;

/// Three labelled volumes, one unlabelled volume, one label row without a volume
fn create_dataset(root: &Path) {
    for (i, name) in ["vol_a_1", "vol_b_1", "vol_c_1", "vol_unlabelled"].iter().enumerate() {
        let voxels = vec![i as f32; IMAGE_DIM];
        write_volume(
            &root.join("data").join(format!("{}.safetensors", name)),
            &voxels,
            &[2, 2, 2],
        )
        .expect("Failed to write volume");
    }
    std::fs::write(root.join("data").join("notes.txt"), "ignored").expect("Failed to write");

    std::fs::write(
        root.join("labels.csv"),
        "VolumeName,Emphysema,Nodule\n\
         vol_a_1.nii.gz,1,0\n\
         vol_b_1.nii.gz,0,1\n\
         vol_c_1.nii.gz,1,1\n\
         vol_missing.nii.gz,0,0\n",
    )
    .expect("Failed to write labels");
    std::fs::write(
        root.join("reports.csv"),
        "VolumeName,Findings_EN,Impressions_EN\n\
         vol_a_1.nii.gz,Emphysema.,Stable.\n",
    )
    .expect("Failed to write reports");
}

fn open(root: &Path) -> CtReportDataset {
    CtReportDataset::open(
        &root.join("data"),
        &root.join("reports.csv"),
        &root.join("labels.csv"),
        IMAGE_DIM,
        2,
    )
    .expect("Failed to open dataset")
}

#[test]
fn test_dataset_joins_labels_reports_and_volumes() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    create_dataset(dir.path());
    let dataset = open(dir.path());

    assert_eq!(dataset.len(), 3);
    assert_eq!(dataset.label_names(), &["Emphysema", "Nodule"]);

    let first = dataset.get(0).expect("Failed to load sample");
    assert_eq!(first.image, vec![0.0; IMAGE_DIM]);
    assert_eq!(first.labels, vec![1.0, 0.0]);
    assert_eq!(first.text, "Emphysema. Stable.");

    // No report row: empty text
    let second = dataset.get(1).expect("Failed to load sample");
    assert_eq!(second.text, "");
    assert!(dataset.get(3).is_err());
}

#[test]
fn test_loader_len_keeps_partial_batch() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    create_dataset(dir.path());
    let mut loader = VolumeDataLoader::new(open(dir.path()), 2, 2, true, Some(42))
        .expect("Failed to build loader");
    assert_eq!(loader.len(), 2);

    loader.start_epoch();
    let batches: Vec<_> = loader
        .iter()
        .collect::<anyhow::Result<Vec<_>>>()
        .expect("Failed to load batches");
    assert_eq!(batches[0].images.shape(), &[2, IMAGE_DIM]);
    assert_eq!(batches[0].labels.shape(), &[2, 2]);
    assert_eq!(batches[1].len(), 1);
    assert!(loader.batch(2).is_err());
}

#[test]
fn test_seeded_shuffle_is_reproducible() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    create_dataset(dir.path());

    let orders = |seed| {
        let mut loader = VolumeDataLoader::new(open(dir.path()), 1, 1, true, Some(seed))
            .expect("Failed to build loader");
        (0..4)
            .map(|_| {
                loader.start_epoch();
                (0..3).map(|i| loader.batch_indices(i)[0]).collect::<Vec<_>>()
            })
            .collect::<Vec<_>>()
    };

    assert_eq!(orders(7), orders(7));
    for order in orders(7) {
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2]);
    }
}

#[test]
fn test_wrong_volume_size_fails_batch() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    create_dataset(dir.path());
    let dataset = CtReportDataset::open(
        &dir.path().join("data"),
        &dir.path().join("reports.csv"),
        &dir.path().join("labels.csv"),
        IMAGE_DIM + 1,
        2,
    )
    .expect("Indexing does not read volumes");
    let loader = VolumeDataLoader::new(dataset, 3, 1, false, Some(0)).expect("loader");
    assert!(loader.batch(0).is_err());
}
