//! End-to-end tests for the fine-tuning loop on a synthetic dataset

use ctclip_finetune::{
    dataloader::VolumeDataLoader,
    dataset::{write_volume, CtReportDataset},
    loss::WeightedBceWithLogits,
    optimizer::{AdamW, OptimizerConfig},
    parallel::{DataParallel, DeviceSet},
    train::{train, TrainingConfig},
};
use ctclip_model::{
    load_checkpoint, ClipConfig, HeadConfig, ImageLatentsClassifier, NamedParameters,
    ProjectionClip,
};
use std::collections::HashMap;
use ctclip_tokenizer::Tokenizer;
use std::fmt::Write as _;
use std::path::Path;
use tempfile::TempDir;

const IMAGE_DIM: usize = 27;
const NUM_CLASSES: usize = 18;
const CONTEXT: usize = 16;

fn create_test_tokenizer() -> Tokenizer {
    let corpus = vec![
        "no acute findings",
        "bilateral pleural effusion",
        "mild cardiomegaly without effusion",
        "emphysema and lung nodule",
    ];
    Tokenizer::train_from_iterator(corpus.iter(), 100).expect("Failed to create test tokenizer")
}

/// Writes `n` volumes under nested folders plus matching CSVs
fn create_dataset(root: &Path, n: usize) {
    let mut labels = String::from("VolumeName");
    for c in 0..NUM_CLASSES {
        write!(labels, ",Label{}", c).unwrap();
    }
    labels.push('\n');
    let mut reports = String::from("VolumeName,Findings_EN,Impressions_EN\n");

    for i in 0..n {
        let name = format!("train_{}_a_1", i);
        let voxels: Vec<f32> = (0..IMAGE_DIM)
            .map(|v| ((i * 31 + v * 7) % 13) as f32 / 13.0 - 0.4)
            .collect();
        let path = root
            .join("volumes")
            .join(format!("train_{}", i))
            .join(format!("{}.safetensors", name));
        write_volume(&path, &voxels, &[3, 3, 3]).expect("Failed to write volume");

        write!(labels, "{}.nii.gz", name).unwrap();
        for c in 0..NUM_CLASSES {
            write!(labels, ",{}", u8::from((i + c) % 3 == 0)).unwrap();
        }
        labels.push('\n');
        writeln!(reports, "{}.nii.gz,Finding {},Impression {}", name, i, i).unwrap();
    }

    std::fs::write(root.join("labels.csv"), labels).expect("Failed to write labels");
    std::fs::write(root.join("reports.csv"), reports).expect("Failed to write reports");
}

fn create_model(tokenizer: &Tokenizer, devices: usize) -> DataParallel<ProjectionClip> {
    let encoder = ProjectionClip::new(ClipConfig {
        image_dim: IMAGE_DIM,
        vocab_size: tokenizer.vocab_size().max(1),
        dim_text: 8,
        dim_latent: 16,
        context_length: CONTEXT,
        seed: Some(3),
    });
    let classifier = ImageLatentsClassifier::new(
        encoder,
        HeadConfig {
            latent_dim: 16,
            num_classes: NUM_CLASSES,
            dropout: 0.3,
            seed: Some(3),
        },
    )
    .expect("Failed to build classifier");
    DataParallel::new(classifier, &DeviceSet::cpu(devices).unwrap(), 3)
        .expect("Failed to replicate model")
}

fn parameters_by_name(model: &ImageLatentsClassifier<ProjectionClip>) -> HashMap<String, Vec<f32>> {
    model
        .named_parameters()
        .into_iter()
        .map(|(name, t)| (name, t.data().to_vec()))
        .collect()
}

fn create_loader(root: &Path, batch_size: usize) -> VolumeDataLoader {
    let dataset = CtReportDataset::open(
        &root.join("volumes"),
        &root.join("reports.csv"),
        &root.join("labels.csv"),
        IMAGE_DIM,
        NUM_CLASSES,
    )
    .expect("Failed to open dataset");
    VolumeDataLoader::new(dataset, batch_size, 2, true, Some(11)).expect("Failed to build loader")
}

fn training_config(save_dir: &Path, epochs: usize, save_every: usize) -> TrainingConfig {
    TrainingConfig {
        epochs,
        print_every: 1,
        save_every,
        grad_clip: 1.0,
        max_text_length: CONTEXT,
        save_dir: save_dir.to_path_buf(),
    }
}

fn optimizer_config() -> OptimizerConfig {
    OptimizerConfig {
        learning_rate: 1e-2,
        warmup_length: 2,
        ..OptimizerConfig::default()
    }
}

#[test]
fn test_training_writes_expected_checkpoints() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    create_dataset(dir.path(), 5);
    let save_dir = dir.path().join("out");

    let tokenizer = create_test_tokenizer();
    let mut model = create_model(&tokenizer, 1);
    let mut loader = create_loader(dir.path(), 2);
    assert_eq!(loader.len(), 3);

    let summary = train(
        &mut model,
        &tokenizer,
        &mut loader,
        &WeightedBceWithLogits::default(),
        &optimizer_config(),
        &training_config(&save_dir, 2, 2),
    )
    .expect("Training failed");

    assert_eq!(summary.steps, 6);
    assert!(summary.final_loss.expect("loss").is_finite());

    // Batches 0 and 2 of each epoch, then the final save
    let names: Vec<String> = summary
        .checkpoints
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec![
            "checkpoint_0_epoch_1.pt",
            "checkpoint_2_epoch_1.pt",
            "checkpoint_0_epoch_2.pt",
            "checkpoint_2_epoch_2.pt",
            "checkpoint_2.pt",
        ]
    );
    for name in ["optim_0_epoch_1.pt", "optim_2_epoch_2.pt", "optim_2.pt"] {
        assert!(save_dir.join(name).exists(), "missing {}", name);
    }
    assert!(save_dir.join("checkpoint_2.json").exists());

    let optimizer = AdamW::load(save_dir.join("optim_2.pt")).expect("Failed to load optimizer");
    assert_eq!(optimizer.step_count(), 6);
    // The schedule reaches zero only after the last step
    assert!(optimizer.lr() > 0.0);
}

#[test]
fn test_final_checkpoint_matches_trained_model() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    create_dataset(dir.path(), 4);
    let save_dir = dir.path().join("out");

    let tokenizer = create_test_tokenizer();
    let mut model = create_model(&tokenizer, 1);
    let initial = parameters_by_name(model.primary());
    let mut loader = create_loader(dir.path(), 4);

    train(
        &mut model,
        &tokenizer,
        &mut loader,
        &WeightedBceWithLogits::default(),
        &optimizer_config(),
        &training_config(&save_dir, 1, 100),
    )
    .expect("Training failed");

    // The head and the visual projection move; the text tower gets no gradient
    let trained = parameters_by_name(model.primary());
    for name in ["head.weight", "head.bias", "encoder.to_visual_latent"] {
        assert_ne!(trained[name], initial[name], "{} did not change", name);
    }
    for name in [
        "encoder.token_embedding",
        "encoder.to_text_latent",
        "encoder.temperature",
    ] {
        assert_eq!(trained[name], initial[name], "{} changed", name);
    }

    let (loaded, metadata): (ImageLatentsClassifier<ProjectionClip>, _) =
        load_checkpoint(save_dir.join("checkpoint_1.pt")).expect("Failed to load checkpoint");
    assert_eq!(metadata.epoch, Some(1));
    assert_eq!(parameters_by_name(&loaded), trained);
}

#[test]
fn test_replicas_stay_in_sync() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    create_dataset(dir.path(), 6);

    let tokenizer = create_test_tokenizer();
    let mut model = create_model(&tokenizer, 3);
    let mut loader = create_loader(dir.path(), 3);

    let summary = train(
        &mut model,
        &tokenizer,
        &mut loader,
        &WeightedBceWithLogits::default(),
        &optimizer_config(),
        &training_config(&dir.path().join("out"), 1, 100),
    )
    .expect("Training failed");
    assert_eq!(summary.steps, 2);
    assert_eq!(model.num_replicas(), 3);

    assert!(model.replicas_in_sync());
    let primary = parameters_by_name(model.primary());
    for replica in model.replicas().skip(1) {
        assert_eq!(parameters_by_name(replica), primary);
    }
}

#[test]
fn test_replicas_diverge_without_broadcast() {
    let tokenizer = create_test_tokenizer();
    let mut model = create_model(&tokenizer, 2);
    assert!(model.replicas_in_sync());

    let shifted: Vec<f32> = model
        .primary()
        .head()
        .bias()
        .data()
        .iter()
        .map(|b| b + 0.5)
        .collect();
    let params = model.primary_mut().trainable_parameters_mut();
    let bias = params.into_iter().last().expect("bias");
    *bias = aprender::autograd::Tensor::new(&shifted, &[NUM_CLASSES]);
    assert!(!model.replicas_in_sync());

    model.broadcast();
    assert!(model.replicas_in_sync());
}

#[test]
fn test_missing_dataset_folder_is_an_error() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    create_dataset(dir.path(), 2);
    let result = CtReportDataset::open(
        &dir.path().join("nope"),
        &dir.path().join("reports.csv"),
        &dir.path().join("labels.csv"),
        IMAGE_DIM,
        NUM_CLASSES,
    );
    assert!(result.is_err());
}
