//! Shape reconciliation by trailing zero-padding.

use ndarray::{ArrayD, IxDyn, Slice};

use crate::tensor::checked_numel;
use crate::{MergeError, Result};

/// Zero-pad `a` and `b` to their elementwise-maximum shape.
///
/// Padding is appended at the end of every mismatched axis; values are never
/// truncated. Tensors of different rank cannot be reconciled.
pub fn reconcile_shapes(
    key: &str,
    a: ArrayD<f32>,
    b: ArrayD<f32>,
) -> Result<(ArrayD<f32>, ArrayD<f32>)> {
    if a.shape() == b.shape() {
        return Ok((a, b));
    }
    if a.ndim() != b.ndim() {
        return Err(MergeError::ShapeMismatch {
            name: key.to_string(),
            expected: a.shape().to_vec(),
            actual: b.shape().to_vec(),
        });
    }
    let target: Vec<usize> = a
        .shape()
        .iter()
        .zip(b.shape())
        .map(|(&x, &y)| x.max(y))
        .collect();
    checked_numel(&target)?;
    tracing::trace!(
        "Padding '{}' from {:?} / {:?} to {:?}",
        key,
        a.shape(),
        b.shape(),
        target
    );
    Ok((pad_to(a, &target), pad_to(b, &target)))
}

fn pad_to(x: ArrayD<f32>, target: &[usize]) -> ArrayD<f32> {
    if x.shape() == target {
        return x;
    }
    let mut out = ArrayD::<f32>::zeros(IxDyn(target));
    out.slice_each_axis_mut(|ax| Slice::from(0..x.shape()[ax.axis.index()]))
        .assign(&x);
    out
}
