//! Elementwise arithmetic.

use super::reconcile_shapes;
use crate::{Result, Tensor};

pub(super) fn multiply(a: &Tensor, alpha: f32) -> Tensor {
    Tensor::from_f32(a.to_f32() * alpha, a.dtype())
}

pub(super) fn add(key: &str, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (x, y) = reconcile_shapes(key, a.to_f32(), b.to_f32())?;
    Ok(Tensor::from_f32(x + y, a.dtype()))
}

pub(super) fn sub(key: &str, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (x, y) = reconcile_shapes(key, a.to_f32(), b.to_f32())?;
    Ok(Tensor::from_f32(x - y, a.dtype()))
}
