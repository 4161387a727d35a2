//! Seeded weight initialization
//!
//! Linear layers use the uniform `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` scheme
//! for both weight and bias. Embedding tables use `N(0, 1)` via Box-Muller.

use aprender::autograd::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// RNG from an optional seed
pub(crate) fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

fn uniform(rng: &mut StdRng, numel: usize, bound: f32) -> Vec<f32> {
    (0..numel).map(|_| rng.gen_range(-bound..=bound)).collect()
}

/// Linear weight of shape `[out_features, in_features]`
pub(crate) fn init_linear_weight(
    in_features: usize,
    out_features: usize,
    rng: &mut StdRng,
) -> Tensor {
    let bound = 1.0 / (in_features.max(1) as f32).sqrt();
    let data = uniform(rng, out_features * in_features, bound);
    Tensor::new(&data, &[out_features, in_features])
}

/// Linear bias of shape `[out_features]`
pub(crate) fn init_linear_bias(in_features: usize, out_features: usize, rng: &mut StdRng) -> Tensor {
    let bound = 1.0 / (in_features.max(1) as f32).sqrt();
    let data = uniform(rng, out_features, bound);
    Tensor::new(&data, &[out_features])
}

/// Embedding table of shape `[num_embeddings, dim]` drawn from N(0, 1)
pub(crate) fn init_embedding(num_embeddings: usize, dim: usize, rng: &mut StdRng) -> Tensor {
    let data: Vec<f32> = (0..num_embeddings * dim)
        .map(|_| {
            let u1: f32 = rng.gen_range(0.0001_f32..1.0_f32);
            let u2: f32 = rng.gen_range(0.0_f32..1.0_f32);
            (-2.0_f32 * u1.ln()).sqrt() * (2.0_f32 * std::f32::consts::PI * u2).cos()
        })
        .collect();
    Tensor::new(&data, &[num_embeddings, dim])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_weight_shape_and_bound() {
        let mut rng = make_rng(Some(42));
        let weight = init_linear_weight(16, 4, &mut rng);
        assert_eq!(weight.shape(), &[4, 16]);
        assert!(weight.data().iter().all(|&w| w.abs() <= 0.25));
    }

    #[test]
    fn test_seeded_init_is_reproducible() {
        let a = init_linear_weight(10, 20, &mut make_rng(Some(123)));
        let b = init_linear_weight(10, 20, &mut make_rng(Some(123)));
        assert_eq!(a.data(), b.data());
    }

    #[test]
    fn test_embedding_roughly_standard_normal() {
        let table = init_embedding(100, 100, &mut make_rng(Some(7)));
        let data = table.data();
        let mean: f32 = data.iter().sum::<f32>() / data.len() as f32;
        let var: f32 = data.iter().map(|&x| (x - mean).powi(2)).sum::<f32>() / data.len() as f32;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var.sqrt() - 1.0).abs() < 0.1, "std {}", var.sqrt());
    }
}
