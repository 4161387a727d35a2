//! Gradient buffers for the trainable parameters

/// Gradients of the trainable parameters, one flat buffer per parameter
///
/// Buffers are ordered like [`crate::ImageLatentsClassifier::trainable_parameters`].
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    tensors: Vec<Vec<f32>>,
}

impl Gradients {
    /// Wrap per-parameter gradient buffers
    pub fn new(tensors: Vec<Vec<f32>>) -> Self {
        Self { tensors }
    }

    /// Zero gradients with the given buffer sizes
    pub fn zeros(sizes: &[usize]) -> Self {
        Self {
            tensors: sizes.iter().map(|&n| vec![0.0; n]).collect(),
        }
    }

    /// Append `other`'s buffers after this one's
    pub fn chain(mut self, other: Gradients) -> Self {
        self.tensors.extend(other.tensors);
        self
    }

    /// Buffer sizes
    pub fn sizes(&self) -> Vec<usize> {
        self.tensors.iter().map(Vec::len).collect()
    }

    /// `self += scale * other`
    pub fn add_scaled(&mut self, other: &Gradients, scale: f32) {
        debug_assert_eq!(self.sizes(), other.sizes());
        for (dst, src) in self.tensors.iter_mut().zip(&other.tensors) {
            for (d, &s) in dst.iter_mut().zip(src) {
                *d += scale * s;
            }
        }
    }

    /// Multiply every gradient by `factor`
    pub fn scale(&mut self, factor: f32) {
        self.tensors.iter_mut().flatten().for_each(|g| *g *= factor);
    }

    /// Global L2 norm over all buffers
    pub fn global_norm(&self) -> f32 {
        self.tensors
            .iter()
            .flatten()
            .map(|&g| g * g)
            .sum::<f32>()
            .sqrt()
    }

    /// Reset every gradient to zero
    pub fn zero(&mut self) {
        self.tensors.iter_mut().flatten().for_each(|g| *g = 0.0);
    }

    /// Per-parameter buffers
    pub fn tensors(&self) -> &[Vec<f32>] {
        &self.tensors
    }

    /// Number of parameter buffers
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// True if no parameters are tracked
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}
