//! Cosine-similarity feature extraction.
//!
//! For each last-axis row, the similarity `c` between `a` and `b` (relative
//! to an optional baseline) becomes a weight `d = ((c + 1) / 2)^gamma`. The
//! result is `lerp(a, b, alpha) * lerp(d, 1 - d, beta)`: `beta = 0` keeps
//! what the two models agree on, `beta = 1` keeps what they disagree on.

use ndarray::{ArrayD, Axis, IxDyn, Zip};

use super::{lerp, require_same_shape};
use crate::{MergeError, Result, Tensor};

const COSINE_EPS: f32 = 1e-8;

pub(super) fn extract(
    key: &str,
    base: Option<&Tensor>,
    a: &Tensor,
    b: &Tensor,
    alpha: f32,
    beta: f32,
    gamma: f32,
) -> Result<Tensor> {
    let mode = if base.is_some() { "extract" } else { "similarities" };
    check_range(mode, "alpha", alpha, 0.0, 1.0)?;
    check_range(mode, "beta", beta, 0.0, 1.0)?;
    check_range(mode, "gamma", gamma, 0.0, f32::MAX)?;

    let mut x = a.to_f32();
    let mut y = b.to_f32();
    require_same_shape(key, &x, &y)?;
    if let Some(base) = base {
        let z = base.to_f32();
        require_same_shape(key, &z, &x)?;
        x -= &z;
        y -= &z;
    }
    let dtype = base.map_or(a.dtype(), Tensor::dtype);

    let scalar = x.ndim() == 0;
    if scalar {
        x = to_shape(x, &[1])?;
        y = to_shape(y, &[1])?;
    }

    let last = Axis(x.ndim() - 1);
    let mut out = ArrayD::<f32>::zeros(x.raw_dim());
    Zip::from(out.lanes_mut(last))
        .and(x.lanes(last))
        .and(y.lanes(last))
        .for_each(|mut o, x, y| {
            let dot: f32 = x.iter().zip(y.iter()).map(|(p, q)| p * q).sum();
            let nx = x.iter().map(|p| p * p).sum::<f32>().sqrt();
            let ny = y.iter().map(|q| q * q).sum::<f32>().sqrt();
            let norm = (nx * ny).max(COSINE_EPS);
            let c = (dot / norm).clamp(-1.0, 1.0);
            let d = ((c + 1.0) / 2.0).powf(gamma);
            let weight = lerp(d, 1.0 - d, beta);
            Zip::from(&mut o).and(&x).and(&y).for_each(|o, &x, &y| {
                *o = lerp(x, y, alpha) * weight;
            });
        });

    if scalar {
        out = to_shape(out, &[])?;
    }
    Ok(Tensor::from_f32(out, dtype))
}

fn check_range(mode: &str, parameter: &str, value: f32, min: f32, max: f32) -> Result<()> {
    if !(min..=max).contains(&value) {
        return Err(MergeError::InvalidParameter {
            mode: mode.to_string(),
            parameter: parameter.to_string(),
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn to_shape(x: ArrayD<f32>, shape: &[usize]) -> Result<ArrayD<f32>> {
    x.into_shape(IxDyn(shape))
        .map_err(|e| MergeError::Internal(format!("reshape to {shape:?}: {e}")))
}
