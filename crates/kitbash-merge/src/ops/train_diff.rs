//! Train-difference: a signed, distance-weighted copy of `b - c`.

use ndarray::Zip;

use super::require_same_shape;
use crate::{Result, Tensor};

const TRAIN_DIFF_GAIN: f32 = 1.8;

pub(super) fn train_diff(key: &str, a: &Tensor, b: &Tensor, c: &Tensor) -> Result<Tensor> {
    let (a32, b32, c32) = (a.to_f32(), b.to_f32(), c.to_f32());
    require_same_shape(key, &b32, &c32)?;
    require_same_shape(key, &b32, &a32)?;

    if b32 == c32 {
        return Ok(Tensor::zeros(a.shape(), a.dtype()));
    }

    let mut out = b32.clone();
    Zip::from(&mut out)
        .and(&a32)
        .and(&b32)
        .and(&c32)
        .for_each(|o, &a, &b, &c| {
            let diff = b - c;
            let to_c = diff.abs();
            let to_a = (b - a).abs();
            let sum = to_c + to_a;
            let scale = if sum != 0.0 { to_a / sum } else { 0.0 };
            *o = sign(diff) * scale.abs() * to_c * TRAIN_DIFF_GAIN;
        });
    Ok(Tensor::from_f32(out, a.dtype()))
}

/// Sign with `sign(0) == 0`.
fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}
