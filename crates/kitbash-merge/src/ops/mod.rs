//! Operator catalogue.
//!
//! Every operator is a pure function of its input tensors and the scalars
//! stored in its [`Op`] variant. The graph engine only ever calls
//! [`Op::apply`], so adding an operator means adding a variant here and a
//! function in one of the submodules.
//!
//! Operators read their inputs through an `f32` working view and cast the
//! result back to the dtype of the first input.

mod arith;
mod dare;
mod extract;
mod interp;
mod shape;
mod smooth;
mod train_diff;

pub use shape::reconcile_shapes;

use ndarray::{ArrayD, Axis};

use crate::{CheckpointId, MergeError, Result, Tensor};

/// One deferred tensor operation together with its scalar parameters.
#[derive(Debug, Clone)]
pub enum Op {
    /// Fetch the node's key from a checkpoint. Has no operator function.
    Load {
        /// Checkpoint to read from.
        checkpoint: CheckpointId,
    },
    /// `a * alpha`
    Multiply {
        /// Scale factor.
        alpha: f32,
    },
    /// `a + b`, zero-padding same-rank shape mismatches.
    Add,
    /// `a - b`, zero-padding same-rank shape mismatches.
    Sub,
    /// Median filter (size 3) followed by a Gaussian blur (sigma 1).
    Smooth,
    /// Train-difference of `(a, b, c)`.
    TrainDiff,
    /// Cosine-similarity feature extraction of `(base, a, b)`.
    Extract {
        /// Blend between `a` and `b`.
        alpha: f32,
        /// Blend between similarity and dissimilarity.
        beta: f32,
        /// Similarity exponent.
        gamma: f32,
    },
    /// [`Op::Extract`] of `(a, b)` without a baseline.
    Similarities {
        /// Blend between `a` and `b`.
        alpha: f32,
        /// Blend between similarity and dissimilarity.
        beta: f32,
        /// Similarity exponent.
        gamma: f32,
    },
    /// Seeded drop-and-rescale of `b - a`.
    PowerUp {
        /// Keep probability.
        alpha: f32,
        /// Mask seed.
        seed: u64,
    },
    /// Drop-and-rescale with a magnitude gate, added back onto `a`.
    Della {
        /// Drop rate.
        alpha: f32,
        /// Scale of the added delta.
        beta: f32,
        /// Magnitude threshold.
        gamma: f32,
        /// Mask seed.
        seed: u64,
    },
    /// Similarity-gated interpolation between `a` and `b`.
    InterpDifference {
        /// Interpolation strength (concave to convex).
        alpha: f32,
        /// `1` selects difference, anything else similarity.
        beta: f32,
        /// Smoothness (binomial to linear).
        gamma: f32,
        /// Mask seed.
        seed: u64,
    },
    /// Interpolation gated by user thresholds on the axis-0 mean.
    ManualInterpDifference {
        /// Interpolation strength.
        alpha: f32,
        /// Lower mean threshold.
        beta: f32,
        /// Upper mean threshold.
        gamma: f32,
        /// Smoothness factor.
        delta: f32,
        /// Mask seed.
        seed: u64,
    },
    /// Interpolation gated by thresholds derived from the mean difference.
    AutoInterpDifference {
        /// Interpolation strength.
        alpha: f32,
        /// Threshold adjustment factor.
        beta: f32,
        /// Smoothness factor.
        gamma: f32,
        /// Mask seed.
        seed: u64,
    },
    /// Weighted sum applied only where the axis-0 mean lies between thresholds.
    WeightSumCutoff {
        /// Blend factor inside the band.
        alpha: f32,
        /// Lower mean threshold.
        beta: f32,
        /// Upper mean threshold.
        gamma: f32,
    },
}

/// Structural identity of an operator: kind, scalar bits, seed, checkpoint.
#[derive(PartialEq, Eq, Hash)]
pub(crate) struct OpIdentity<'a> {
    kind: &'static str,
    scalars: [u32; 4],
    seed: Option<u64>,
    checkpoint: Option<&'a CheckpointId>,
}

/// Bit pattern used for identity; `-0.0` and `0.0` compare equal.
fn scalar_bits(value: f32) -> u32 {
    if value == 0.0 {
        0
    } else {
        value.to_bits()
    }
}

impl Op {
    /// Short operator name, used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Load { .. } => "load",
            Op::Multiply { .. } => "multiply",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Smooth => "smooth",
            Op::TrainDiff => "train_diff",
            Op::Extract { .. } => "extract",
            Op::Similarities { .. } => "similarities",
            Op::PowerUp { .. } => "power_up",
            Op::Della { .. } => "della",
            Op::InterpDifference { .. } => "interp_difference",
            Op::ManualInterpDifference { .. } => "manual_interp_difference",
            Op::AutoInterpDifference { .. } => "auto_interp_difference",
            Op::WeightSumCutoff { .. } => "weight_sum_cutoff",
        }
    }

    /// Number of source nodes the operator consumes.
    pub fn arity(&self) -> usize {
        match self {
            Op::Load { .. } => 0,
            Op::Multiply { .. } | Op::Smooth => 1,
            Op::TrainDiff | Op::Extract { .. } => 3,
            _ => 2,
        }
    }

    pub(crate) fn identity(&self) -> OpIdentity<'_> {
        let (scalars, seed, checkpoint) = match self {
            Op::Load { checkpoint } => ([0.0; 4], None, Some(checkpoint)),
            Op::Multiply { alpha } => ([*alpha, 0.0, 0.0, 0.0], None, None),
            Op::Add | Op::Sub | Op::Smooth | Op::TrainDiff => ([0.0; 4], None, None),
            Op::Extract { alpha, beta, gamma }
            | Op::Similarities { alpha, beta, gamma }
            | Op::WeightSumCutoff { alpha, beta, gamma } => {
                ([*alpha, *beta, *gamma, 0.0], None, None)
            }
            Op::PowerUp { alpha, seed } => ([*alpha, 0.0, 0.0, 0.0], Some(*seed), None),
            Op::Della {
                alpha,
                beta,
                gamma,
                seed,
            }
            | Op::InterpDifference {
                alpha,
                beta,
                gamma,
                seed,
            }
            | Op::AutoInterpDifference {
                alpha,
                beta,
                gamma,
                seed,
            } => ([*alpha, *beta, *gamma, 0.0], Some(*seed), None),
            Op::ManualInterpDifference {
                alpha,
                beta,
                gamma,
                delta,
                seed,
            } => ([*alpha, *beta, *gamma, *delta], Some(*seed), None),
        };
        OpIdentity {
            kind: self.name(),
            scalars: scalars.map(scalar_bits),
            seed,
            checkpoint,
        }
    }

    /// Apply the operator to already-evaluated sources, in source order.
    pub fn apply(&self, key: &str, inputs: &[Tensor]) -> Result<Tensor> {
        if inputs.len() != self.arity() {
            return Err(MergeError::Internal(format!(
                "{} on '{key}' expects {} inputs, got {}",
                self.name(),
                self.arity(),
                inputs.len()
            )));
        }
        match self {
            Op::Load { checkpoint } => Err(MergeError::Internal(format!(
                "load of '{key}' from '{checkpoint}' has no operator function"
            ))),
            Op::Multiply { alpha } => Ok(arith::multiply(&inputs[0], *alpha)),
            Op::Add => arith::add(key, &inputs[0], &inputs[1]),
            Op::Sub => arith::sub(key, &inputs[0], &inputs[1]),
            Op::Smooth => Ok(smooth::smooth(&inputs[0])),
            Op::TrainDiff => train_diff::train_diff(key, &inputs[0], &inputs[1], &inputs[2]),
            Op::Extract { alpha, beta, gamma } => extract::extract(
                key,
                Some(&inputs[0]),
                &inputs[1],
                &inputs[2],
                *alpha,
                *beta,
                *gamma,
            ),
            Op::Similarities { alpha, beta, gamma } => {
                extract::extract(key, None, &inputs[0], &inputs[1], *alpha, *beta, *gamma)
            }
            Op::PowerUp { alpha, seed } => dare::power_up(key, &inputs[0], &inputs[1], *alpha, *seed),
            Op::Della {
                alpha,
                beta,
                gamma,
                seed,
            } => dare::della(key, &inputs[0], &inputs[1], *alpha, *beta, *gamma, *seed),
            Op::InterpDifference {
                alpha,
                beta,
                gamma,
                seed,
            } => interp::interp_difference(key, &inputs[0], &inputs[1], *alpha, *beta, *gamma, *seed),
            Op::ManualInterpDifference {
                alpha,
                beta,
                gamma,
                delta,
                seed,
            } => interp::manual_interp_difference(
                key, &inputs[0], &inputs[1], *alpha, *beta, *gamma, *delta, *seed,
            ),
            Op::AutoInterpDifference {
                alpha,
                beta,
                gamma,
                seed,
            } => interp::auto_interp_difference(
                key, &inputs[0], &inputs[1], *alpha, *beta, *gamma, *seed,
            ),
            Op::WeightSumCutoff { alpha, beta, gamma } => {
                interp::weight_sum_cutoff(key, &inputs[0], &inputs[1], *alpha, *beta, *gamma)
            }
        }
    }
}

impl PartialEq for Op {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Op {}

impl std::hash::Hash for Op {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

/// Replace NaN with 0 and infinities with the finite extremes.
pub(crate) fn nan_to_num(x: f32) -> f32 {
    if x.is_nan() {
        0.0
    } else if x == f32::INFINITY {
        f32::MAX
    } else if x == f32::NEG_INFINITY {
        f32::MIN
    } else {
        x
    }
}

/// Linear interpolation `start + weight * (end - start)`.
#[inline]
pub(crate) fn lerp(start: f32, end: f32, weight: f32) -> f32 {
    start + weight * (end - start)
}

/// Fail unless `a` and `b` have identical shapes.
pub(crate) fn require_same_shape(key: &str, a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(MergeError::ShapeMismatch {
            name: key.to_string(),
            expected: a.shape().to_vec(),
            actual: b.shape().to_vec(),
        });
    }
    Ok(())
}

/// Mean over axis 0, broadcast back to the input's shape.
pub(crate) fn mean_axis0_broadcast(x: &ArrayD<f32>) -> ArrayD<f32> {
    if x.ndim() == 0 {
        return x.clone();
    }
    match x.mean_axis(Axis(0)) {
        Some(mean) => {
            let mean = mean.insert_axis(Axis(0));
            match mean.broadcast(x.raw_dim()) {
                Some(view) => view.to_owned(),
                None => x.clone(),
            }
        }
        None => x.clone(),
    }
}

/// Largest element, or NaN for an empty tensor.
pub(crate) fn max_element(x: &ArrayD<f32>) -> f32 {
    if x.is_empty() {
        return f32::NAN;
    }
    x.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v))
}
