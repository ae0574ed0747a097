//! Difference-gated interpolation between two tensors.
//!
//! All four operators compute a per-element weight `m` and return
//! `a * (1 - m) + b * m`. They differ in how `m` is derived from the
//! normalized absolute difference `|a - b| / max|a - b|`.

use ndarray::{ArrayD, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{lerp, max_element, mean_axis0_broadcast, nan_to_num, require_same_shape};
use crate::{Result, Tensor};

const MIN_ALPHA: f32 = 0.001;

/// Normalized difference. With `similarity`, 1 means identical elements;
/// otherwise 1 means the largest difference in the tensor.
fn normalized_difference(a: &ArrayD<f32>, b: &ArrayD<f32>, similarity: bool) -> ArrayD<f32> {
    let mut delta = a - b;
    delta.mapv_inplace(f32::abs);
    let max = max_element(&delta);
    delta.mapv_inplace(|d| {
        let v = if similarity { (max - d) / max } else { d / max };
        nan_to_num(v)
    });
    delta
}

/// Exponent that bends the curve from concave (`alpha -> 0`) to convex.
fn exponent(alpha: f32) -> f32 {
    1.0 / alpha.max(MIN_ALPHA) - 1.0
}

/// One Bernoulli draw per element with probability `clamp(p, 0, 1)`.
fn bernoulli(p: &ArrayD<f32>, seed: u64) -> ArrayD<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    p.map(|&p| {
        let draw = rng.gen::<f32>();
        if draw < p.clamp(0.0, 1.0) {
            1.0
        } else {
            0.0
        }
    })
}

/// Powered weights, a Bernoulli mask drawn from them, and the two mixed by
/// `smoothness`.
fn smoothed_mask(weights: ArrayD<f32>, smoothness: f32, seed: u64) -> ArrayD<f32> {
    let mut mask = bernoulli(&weights, seed);
    Zip::from(&mut mask)
        .and(&weights)
        .for_each(|m, &w| *m = lerp(*m, w, smoothness));
    mask
}

fn blend(a: &ArrayD<f32>, b: &ArrayD<f32>, mask: &ArrayD<f32>, dtype: crate::Dtype) -> Tensor {
    let mut out = a.clone();
    Zip::from(&mut out)
        .and(b)
        .and(mask)
        .for_each(|o, &b, &m| *o = *o * (1.0 - m) + b * m);
    Tensor::from_f32(out, dtype)
}

fn operands(key: &str, a: &Tensor, b: &Tensor) -> Result<(ArrayD<f32>, ArrayD<f32>)> {
    let (x, y) = (a.to_f32(), b.to_f32());
    require_same_shape(key, &x, &y)?;
    Ok((x, y))
}

pub(super) fn interp_difference(
    key: &str,
    a: &Tensor,
    b: &Tensor,
    alpha: f32,
    beta: f32,
    gamma: f32,
    seed: u64,
) -> Result<Tensor> {
    let (x, y) = operands(key, a, b)?;
    let e = exponent(alpha);
    let mut diff = normalized_difference(&x, &y, beta != 1.0);
    diff.mapv_inplace(|d| nan_to_num(d.powf(e)));
    let mask = smoothed_mask(diff, gamma, seed);
    Ok(blend(&x, &y, &mask, a.dtype()))
}

#[allow(clippy::too_many_arguments)]
pub(super) fn manual_interp_difference(
    key: &str,
    a: &Tensor,
    b: &Tensor,
    alpha: f32,
    beta: f32,
    gamma: f32,
    delta: f32,
    seed: u64,
) -> Result<Tensor> {
    let (x, y) = operands(key, a, b)?;
    let e = exponent(alpha);
    let mut diff = normalized_difference(&x, &y, true);
    let mean = mean_axis0_broadcast(&diff);
    Zip::from(&mut diff).and(&mean).for_each(|d, &m| {
        let in_band = beta < m && m < gamma;
        *d = if in_band { nan_to_num(d.powf(e)) } else { 0.0 };
    });
    let mask = smoothed_mask(diff, delta, seed);
    Ok(blend(&x, &y, &mask, a.dtype()))
}

pub(super) fn auto_interp_difference(
    key: &str,
    a: &Tensor,
    b: &Tensor,
    alpha: f32,
    beta: f32,
    gamma: f32,
    seed: u64,
) -> Result<Tensor> {
    let (x, y) = operands(key, a, b)?;
    let e = exponent(alpha);
    let mut diff = normalized_difference(&x, &y, true);
    let mean = diff.mean().unwrap_or(0.0);
    let lower = mean * (1.0 - beta);
    let upper = mean * (1.0 + beta);
    diff.mapv_inplace(|d| {
        if lower < d && d < upper {
            nan_to_num(d.powf(e))
        } else {
            0.0
        }
    });
    let mask = smoothed_mask(diff, gamma, seed);
    Ok(blend(&x, &y, &mask, a.dtype()))
}

/// Weighted sum by `alpha`, applied only where the axis-0 mean similarity
/// lies strictly between `beta` and `gamma`.
pub(super) fn weight_sum_cutoff(
    key: &str,
    a: &Tensor,
    b: &Tensor,
    alpha: f32,
    beta: f32,
    gamma: f32,
) -> Result<Tensor> {
    let (x, y) = operands(key, a, b)?;
    let diff = normalized_difference(&x, &y, true);
    let mut mask = mean_axis0_broadcast(&diff);
    mask.mapv_inplace(|m| if beta < m && m < gamma { alpha } else { 0.0 });
    Ok(blend(&x, &y, &mask, a.dtype()))
}
