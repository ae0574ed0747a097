//! Drop-and-rescale operators over `b - a`.
//!
//! Masks are drawn from a [`StdRng`] seeded with the operator's seed, one
//! uniform sample per element in row-major order, so a given seed always
//! produces the same mask for the same shape.

use ndarray::{ArrayD, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::reconcile_shapes;
use crate::{MergeError, Result, Tensor};

/// `b - a`, zero-padding same-rank mismatches.
fn delta(key: &str, a: &Tensor, b: &Tensor) -> Result<(ArrayD<f32>, ArrayD<f32>)> {
    let (a, b) = reconcile_shapes(key, a.to_f32(), b.to_f32())?;
    let delta = &b - &a;
    Ok((a, delta))
}

/// Uniform `[0, 1)` samples compared against `keep`; true means keep.
fn keep_mask(like: &ArrayD<f32>, keep: f32, seed: u64) -> ArrayD<bool> {
    let mut rng = StdRng::seed_from_u64(seed);
    like.map(|_| rng.gen::<f32>() < keep)
}

fn check_rate(mode: &str, alpha: f32) -> Result<()> {
    if !(0.0..1.0).contains(&alpha) {
        return Err(MergeError::InvalidParameter {
            mode: mode.to_string(),
            parameter: "alpha".to_string(),
            value: alpha,
            min: 0.0,
            max: 1.0,
        });
    }
    Ok(())
}

/// DARE: keep each element of `b - a` with probability `alpha`, then divide
/// by `1 - alpha`. Returns the rescaled delta only.
pub(super) fn power_up(key: &str, a: &Tensor, b: &Tensor, alpha: f32, seed: u64) -> Result<Tensor> {
    check_rate("power_up", alpha)?;
    let (_, mut delta) = delta(key, a, b)?;
    let mask = keep_mask(&delta, alpha, seed);
    let rescale = 1.0 / (1.0 - alpha);
    Zip::from(&mut delta).and(&mask).for_each(|d, &keep| {
        *d = if keep { *d * rescale } else { 0.0 };
    });
    Ok(Tensor::from_f32(delta, a.dtype()))
}

/// DELLA: drop elements of `b - a` at rate `alpha`, rescale the survivors,
/// zero everything whose magnitude is not above `gamma`, and add `beta` times
/// the result onto `a`.
pub(super) fn della(
    key: &str,
    a: &Tensor,
    b: &Tensor,
    alpha: f32,
    beta: f32,
    gamma: f32,
    seed: u64,
) -> Result<Tensor> {
    check_rate("della", alpha)?;
    let (mut base, delta) = delta(key, a, b)?;
    let mask = keep_mask(&delta, 1.0 - alpha, seed);
    let rescale = 1.0 / (1.0 - alpha);
    Zip::from(&mut base)
        .and(&delta)
        .and(&mask)
        .for_each(|out, &d, &keep| {
            if keep && d.abs() > gamma {
                *out += d * rescale * beta;
            }
        });
    Ok(Tensor::from_f32(base, a.dtype()))
}
