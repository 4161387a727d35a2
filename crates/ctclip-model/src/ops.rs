//! Dense kernels over row-major `f32` buffers

/// Lower bound on the norm used by [`l2_normalize_rows`]
const L2_EPS: f32 = 1e-12;

/// `y = x W^T + b` for `x: [rows, in]`, `W: [out, in]`, `b: [out]`
pub(crate) fn linear_forward(
    x: &[f32],
    rows: usize,
    in_features: usize,
    weight: &[f32],
    bias: Option<&[f32]>,
    out_features: usize,
) -> Vec<f32> {
    let mut y = vec![0.0f32; rows * out_features];
    for r in 0..rows {
        let x_row = &x[r * in_features..(r + 1) * in_features];
        let y_row = &mut y[r * out_features..(r + 1) * out_features];
        for (o, y_val) in y_row.iter_mut().enumerate() {
            let w_row = &weight[o * in_features..(o + 1) * in_features];
            let dot: f32 = x_row.iter().zip(w_row).map(|(&a, &b)| a * b).sum();
            *y_val = dot + bias.map_or(0.0, |b| b[o]);
        }
    }
    y
}

/// Normalize each row of `x: [rows, cols]` to unit L2 norm
pub(crate) fn l2_normalize_rows(x: &mut [f32], cols: usize) {
    for row in x.chunks_exact_mut(cols) {
        let norm = row.iter().map(|&v| v * v).sum::<f32>().sqrt().max(L2_EPS);
        row.iter_mut().for_each(|v| *v /= norm);
    }
}

/// `dL/dz` for one row of `y = z / max(||z||, eps)` given `dL/dy`
pub(crate) fn l2_normalize_backward(z: &[f32], grad: &[f32]) -> Vec<f32> {
    let norm = z.iter().map(|&v| v * v).sum::<f32>().sqrt();
    if norm <= L2_EPS {
        return grad.iter().map(|&g| g / L2_EPS).collect();
    }
    // Remove the radial component of the upstream gradient
    let radial = z.iter().zip(grad).map(|(&v, &g)| v * g).sum::<f32>() / (norm * norm);
    z.iter()
        .zip(grad)
        .map(|(&v, &g)| (g - v * radial) / norm)
        .collect()
}

/// Accumulate `dW += dy^T x` for `x: [rows, in]`, `dy: [rows, out]`
pub(crate) fn linear_weight_grad(
    x: &[f32],
    grad_y: &[f32],
    rows: usize,
    in_features: usize,
    out_features: usize,
    grad_weight: &mut [f32],
) {
    for r in 0..rows {
        let x_row = &x[r * in_features..(r + 1) * in_features];
        let g_row = &grad_y[r * out_features..(r + 1) * out_features];
        for (o, &g) in g_row.iter().enumerate() {
            if g == 0.0 {
                continue;
            }
            let w_row = &mut grad_weight[o * in_features..(o + 1) * in_features];
            for (gw, &xv) in w_row.iter_mut().zip(x_row) {
                *gw += g * xv;
            }
        }
    }
}
