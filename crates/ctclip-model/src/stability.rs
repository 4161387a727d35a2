//! Numerical stability checks
//!
//! Used by the training loop to flag non-finite logits, losses and gradients
//! before they are written into a checkpoint.

use anyhow::Result;
use aprender::autograd::Tensor;

/// Check if a slice contains any NaN values
pub fn has_nan(values: &[f32]) -> bool {
    values.iter().any(|x| x.is_nan())
}

/// Check if a slice contains any Inf values
pub fn has_inf(values: &[f32]) -> bool {
    values.iter().any(|x| x.is_infinite())
}

/// Validate that a tensor doesn't contain NaN or Inf values
///
/// # Arguments
/// * `tensor` - Tensor to validate
/// * `name` - Name of the tensor for error messages
pub fn validate_tensor(tensor: &Tensor, name: &str) -> Result<()> {
    validate_values(tensor.data(), name)
}

/// Same as [`validate_tensor`] for a raw buffer
pub fn validate_values(values: &[f32], name: &str) -> Result<()> {
    if has_nan(values) {
        anyhow::bail!("Tensor '{}' contains NaN values", name);
    }
    if has_inf(values) {
        anyhow::bail!("Tensor '{}' contains Inf values", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_finite_tensor() {
        let tensor = Tensor::ones(&[2, 3]);
        assert!(validate_tensor(&tensor, "logits").is_ok());
    }

    #[test]
    fn test_nan_and_inf_are_reported() {
        let err = validate_values(&[1.0, f32::NAN], "loss").unwrap_err();
        assert!(err.to_string().contains("NaN"));
        let err = validate_values(&[f32::NEG_INFINITY], "grad").unwrap_err();
        assert!(err.to_string().contains("Inf"));
    }
}
