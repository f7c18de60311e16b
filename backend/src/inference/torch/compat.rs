//! Tensor operations the legacy attention layers are written against.
//!
//! Each op is a thin fallible wrapper over libtorch so the layer code reads the
//! same regardless of which tensor API revision is linked.

use tch::{Kind, TchError, Tensor};

pub const EPSILON: f64 = 1e-7;

pub fn dot(x: &Tensor, y: &Tensor) -> Result<Tensor, TchError> {
    x.f_matmul(y)
}

/// Batched matrix product over the leading dimension.
pub fn batch_dot(x: &Tensor, y: &Tensor) -> Result<Tensor, TchError> {
    if x.dim() < 3 || y.dim() < 3 {
        return Err(TchError::Shape(format!(
            "batch_dot expects rank >= 3, got {} and {}",
            x.dim(),
            y.dim()
        )));
    }
    x.f_matmul(y)
}

pub fn reshape(x: &Tensor, shape: &[i64]) -> Result<Tensor, TchError> {
    x.f_reshape(shape)
}

pub fn permute_dimensions(x: &Tensor, pattern: &[i64]) -> Result<Tensor, TchError> {
    x.f_permute(pattern)
}

pub fn expand_dims(x: &Tensor, axis: i64) -> Result<Tensor, TchError> {
    x.f_unsqueeze(axis)
}

pub fn sum(x: &Tensor, axis: i64, keepdims: bool) -> Result<Tensor, TchError> {
    x.f_sum_dim_intlist([axis].as_slice(), keepdims, Kind::Float)
}

pub fn max(x: &Tensor, axis: i64, keepdims: bool) -> Result<Tensor, TchError> {
    x.f_amax([axis].as_slice(), keepdims)
}

pub fn mean(x: &Tensor, axis: i64, keepdims: bool) -> Result<Tensor, TchError> {
    x.f_mean_dim([axis].as_slice(), keepdims, Kind::Float)
}

pub fn clip(x: &Tensor, min_value: f64, max_value: f64) -> Result<Tensor, TchError> {
    x.f_clamp(min_value, max_value)
}

/// Softmax with the row maximum subtracted before exponentiation.
pub fn softmax(x: &Tensor, axis: i64) -> Result<Tensor, TchError> {
    let shifted = x.f_sub(&max(x, axis, true)?)?;
    let e = shifted.f_exp()?;
    let total = clip(&sum(&e, axis, true)?, EPSILON, f64::MAX)?;
    e.f_div(&total)
}
