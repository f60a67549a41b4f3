use ndarray::{Array2, Axis};
use rand::Rng;

/// Row-wise softmax, shifted by each row's maximum for stability.
pub(crate) fn softmax_rows(mut logits: Array2<f32>) -> Array2<f32> {
    for mut row in logits.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
    logits
}

pub(crate) fn relu_inplace(values: &mut Array2<f32>) {
    values.mapv_inplace(|v| v.max(0.0));
}

/// Glorot (Xavier) uniform initialization for a `fan_in x fan_out` kernel.
pub(crate) fn glorot_uniform<R: Rng + ?Sized>(fan_in: usize, fan_out: usize, rng: &mut R) -> Array2<f32> {
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    Array2::from_shape_fn((fan_in, fan_out), |_| rng.gen_range(-limit..limit))
}
