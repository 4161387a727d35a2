//! Tests for the learning-rate schedule and AdamW state persistence

use aprender::autograd::Tensor;
use ctclip_finetune::optimizer::{cosine_lr, AdamW, CosineSchedule, OptimizerConfig};
use ctclip_model::Gradients;
use proptest::prelude::*;
use tempfile::TempDir;

proptest! {
    #[test]
    fn test_schedule_increases_during_warmup(
        warmup in 1usize..200,
        extra in 1usize..500,
        base_lr in 1e-5f32..1.0,
    ) {
        let total = warmup + extra;
        for step in 1..warmup {
            prop_assert!(cosine_lr(base_lr, warmup, total, step) > cosine_lr(base_lr, warmup, total, step - 1));
        }
    }

    #[test]
    fn test_schedule_non_increasing_after_warmup(
        warmup in 0usize..200,
        extra in 1usize..500,
        base_lr in 1e-5f32..1.0,
    ) {
        let total = warmup + extra;
        for step in warmup + 1..=total {
            prop_assert!(cosine_lr(base_lr, warmup, total, step) <= cosine_lr(base_lr, warmup, total, step - 1));
        }
    }

    #[test]
    fn test_schedule_is_zero_at_end(
        warmup in 0usize..200,
        extra in 1usize..500,
        base_lr in 1e-5f32..1.0,
    ) {
        let total = warmup + extra;
        prop_assert_eq!(cosine_lr(base_lr, warmup, total, total), 0.0);
    }

    #[test]
    fn test_schedule_never_exceeds_base(
        warmup in 0usize..50,
        total in 1usize..200,
        step in 0usize..300,
    ) {
        let lr = cosine_lr(1e-3, warmup, total, step);
        prop_assert!(lr >= 0.0);
        prop_assert!(lr <= 1e-3 * (1.0 + 1e-6));
    }
}

#[test]
fn test_schedule_applies_to_optimizer() {
    let mut opt = AdamW::new(&[1], &OptimizerConfig::default());
    let schedule = CosineSchedule::new(2e-3, 10, 100);
    let lr = schedule.apply(&mut opt, 4);
    approx::assert_relative_eq!(lr, 1e-3, epsilon = 1e-9);
    assert_eq!(opt.lr(), lr);
    assert_eq!(schedule.total_steps(), 100);
}

#[test]
fn test_optimizer_state_roundtrip() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("optim_0_epoch_1.pt");

    let mut opt = AdamW::new(&[3, 1], &OptimizerConfig::default());
    let mut weight = Tensor::new(&[0.1, 0.2, 0.3], &[1, 3]);
    let mut bias = Tensor::new(&[0.0], &[1]);
    let grads = Gradients::new(vec![vec![0.5, -0.5, 1.0], vec![0.25]]);
    opt.step(vec![&mut weight, &mut bias], &grads)
        .expect("Optimizer step failed");
    opt.save(&path).expect("Failed to save optimizer");

    let loaded = AdamW::load(&path).expect("Failed to load optimizer");
    assert_eq!(loaded.state(), opt.state());
    assert_eq!(loaded.step_count(), 1);
}

#[test]
fn test_corrupted_optimizer_state() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("optim.pt");
    std::fs::write(&path, "{}").expect("Failed to write");
    assert!(AdamW::load(&path).is_err());
}
