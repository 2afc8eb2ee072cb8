// init — parameter initializers
//
// Each initializer takes an explicit RngKey, so a model initialized twice
// from the same seed gets identical weights.
//
//   uniform(key, shape, low, high)   U(low, high)
//   normal(key, shape, mean, std)    N(mean, std)
//   glorot_uniform(key, shape)       U(-a, a), a = sqrt(6 / (fan_in + fan_out))
//   glorot_normal(key, shape)        N(0, sqrt(2 / (fan_in + fan_out)))
//
// Weights are laid out [.., fan_in, fan_out]: a Dense kernel is [d_in, d_out]
// and is applied as x @ W.

use strand_core::backend::Backend;
use strand_core::{DType, Result, RngKey, Shape, Tensor};

/// `(fan_in, fan_out)` of a `[.., in, out]` weight.
fn compute_fans(shape: &Shape) -> (f64, f64) {
    let dims = shape.dims();
    match dims.len() {
        0 => (1.0, 1.0),
        1 => (dims[0] as f64, dims[0] as f64),
        n => {
            let receptive_field: usize = dims[..n - 2].iter().product();
            let fan_in = dims[n - 2] as f64 * receptive_field as f64;
            let fan_out = dims[n - 1] as f64 * receptive_field as f64;
            (fan_in, fan_out)
        }
    }
}

pub fn uniform<B: Backend>(
    key: RngKey,
    shape: impl Into<Shape>,
    low: f64,
    high: f64,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    key.uniform(shape, low, high, dtype, device)
}

pub fn normal<B: Backend>(
    key: RngKey,
    shape: impl Into<Shape>,
    mean: f64,
    std: f64,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    key.normal(shape, mean, std, dtype, device)
}

/// Glorot (Xavier) uniform initialization.
pub fn glorot_uniform<B: Backend>(
    key: RngKey,
    shape: impl Into<Shape>,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let shape = shape.into();
    let (fan_in, fan_out) = compute_fans(&shape);
    let a = (6.0 / (fan_in + fan_out)).sqrt();
    uniform::<B>(key, shape, -a, a, dtype, device)
}

/// Glorot (Xavier) normal initialization.
pub fn glorot_normal<B: Backend>(
    key: RngKey,
    shape: impl Into<Shape>,
    dtype: DType,
    device: &B::Device,
) -> Result<Tensor<B>> {
    let shape = shape.into();
    let (fan_in, fan_out) = compute_fans(&shape);
    let std = (2.0 / (fan_in + fan_out)).sqrt();
    normal::<B>(key, shape, 0.0, std, dtype, device)
}
