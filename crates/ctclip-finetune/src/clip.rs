//! Gradient norm clipping

use ctclip_model::Gradients;

/// Clip gradients in place to a maximum global L2 norm
///
/// When the norm exceeds `max_norm`, every gradient is scaled by
/// `max_norm / (norm + 1e-6)`. A non-positive `max_norm` disables clipping.
///
/// # Returns
/// The global norm before clipping
pub fn clip_grad_norm(grads: &mut Gradients, max_norm: f32) -> f32 {
    let total_norm = grads.global_norm();
    if max_norm > 0.0 && total_norm > max_norm {
        grads.scale(max_norm / (total_norm + 1e-6));
    }
    total_norm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_gradients_untouched() {
        let mut grads = Gradients::new(vec![vec![0.3, 0.4]]);
        let norm = clip_grad_norm(&mut grads, 1.0);
        assert!((norm - 0.5).abs() < 1e-6);
        assert_eq!(grads.tensors()[0], vec![0.3, 0.4]);
    }

    #[test]
    fn test_large_gradients_scaled() {
        let mut grads = Gradients::new(vec![vec![30.0], vec![40.0]]);
        let norm = clip_grad_norm(&mut grads, 1.0);
        assert_eq!(norm, 50.0);
        assert!(grads.global_norm() <= 1.0);
        assert!((grads.tensors()[0][0] - 0.6).abs() < 1e-5);
    }

    #[test]
    fn test_zero_max_norm_disables_clipping() {
        let mut grads = Gradients::new(vec![vec![30.0, 40.0]]);
        clip_grad_norm(&mut grads, 0.0);
        assert_eq!(grads.global_norm(), 50.0);
    }
}
