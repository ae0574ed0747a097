//! Feature extraction modes built on cosine similarity.

use super::{CalcMode, Slider};
use crate::graph::{Node, NodeRef};
use crate::ops::Op;
use crate::weights::{Param, WeightSet};
use crate::Checkpoints;

/// The similarity-bias slider is scaled by this before reaching the operator.
const GAMMA_SCALE: f32 = 15.0;

const EXTRACT_SLIDERS: [Slider; 4] = [
    Slider {
        label: "model_b - model_c",
        param: Param::Alpha,
        min: 0.0,
        max: 1.0,
        step: 0.01,
    },
    Slider {
        label: "similarity - dissimilarity",
        param: Param::Beta,
        min: 0.0,
        max: 1.0,
        step: 0.01,
    },
    Slider {
        label: "similarity bias",
        param: Param::Gamma,
        min: 0.0,
        max: 2.0,
        step: 0.01,
    },
    Slider {
        label: "addition multiplier",
        param: Param::Delta,
        min: -1.0,
        max: 4.0,
        step: 0.01,
    },
];

const DISSIMILARITY_SLIDERS: [Slider; 3] = [
    Slider {
        label: "model_b - model_c",
        param: Param::Alpha,
        min: 0.0,
        max: 1.0,
        step: 0.01,
    },
    Slider {
        label: "addition multiplier",
        param: Param::Beta,
        min: -1.0,
        max: 4.0,
        step: 0.01,
    },
    Slider {
        label: "similarity bias",
        param: Param::Gamma,
        min: 0.0,
        max: 2.0,
        step: 0.01,
    },
];

/// `A + Extract(A, B, C) * delta`: (dis)similar features of `B - A` and
/// `C - A`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractMode;

impl CalcMode for ExtractMode {
    fn name(&self) -> &'static str {
        "Extract"
    }

    fn description(&self) -> &'static str {
        "Adds (dis)similar features between (model_b - model_a) and (model_c - model_a) to model_a"
    }

    fn input_models(&self) -> usize {
        3
    }

    fn sliders(&self) -> &'static [Slider] {
        &EXTRACT_SLIDERS
    }

    fn create_recipe(&self, key: &str, checkpoints: &Checkpoints, weights: &WeightSet) -> NodeRef {
        let a = Node::load(key, checkpoints.model_a());
        let b = Node::load(key, checkpoints.model_b());
        let c = Node::load(key, checkpoints.model_c());

        let extracted = Node::cached(
            key,
            Op::Extract {
                alpha: weights.alpha(),
                beta: weights.beta(),
                gamma: weights.gamma() * GAMMA_SCALE,
            },
            vec![a.clone(), b, c],
        );
        let scaled = Node::new(
            key,
            Op::Multiply {
                alpha: weights.get_or(Param::Delta, 1.0),
            },
            vec![extracted],
        );
        Node::new(key, Op::Add, vec![a, scaled])
    }
}

/// `A + Similarities(B, C) * beta`, always keeping the dissimilar part.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddDissimilaritiesMode;

impl CalcMode for AddDissimilaritiesMode {
    fn name(&self) -> &'static str {
        "Add Dissimilarities"
    }

    fn description(&self) -> &'static str {
        "Adds dissimilar features between model_b and model_c to model_a"
    }

    fn input_models(&self) -> usize {
        3
    }

    fn sliders(&self) -> &'static [Slider] {
        &DISSIMILARITY_SLIDERS
    }

    fn create_recipe(&self, key: &str, checkpoints: &Checkpoints, weights: &WeightSet) -> NodeRef {
        let a = Node::load(key, checkpoints.model_a());
        let b = Node::load(key, checkpoints.model_b());
        let c = Node::load(key, checkpoints.model_c());

        let extracted = Node::cached(
            key,
            Op::Similarities {
                alpha: weights.alpha(),
                beta: 1.0,
                gamma: weights.gamma() * GAMMA_SCALE,
            },
            vec![b, c],
        );
        let scaled = Node::new(key, Op::Multiply { alpha: weights.beta() }, vec![extracted]);
        Node::new(key, Op::Add, vec![a, scaled])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calcmodes::test_support::ckpts;

    #[test]
    fn test_extract_recipe() {
        let weights = WeightSet {
            alpha: Some(0.5),
            beta: Some(0.25),
            gamma: Some(0.2),
            ..Default::default()
        };
        let node = ExtractMode.create_recipe("k", &ckpts(), &weights);
        let scaled = &node.sources()[1];
        assert_eq!(scaled.op(), &Op::Multiply { alpha: 1.0 });
        let extracted = &scaled.sources()[0];
        assert!(extracted.is_cacheable());
        assert_eq!(
            extracted.op(),
            &Op::Extract {
                alpha: 0.5,
                beta: 0.25,
                gamma: 0.2 * 15.0
            }
        );
        assert_eq!(extracted.sources().len(), 3);
    }

    #[test]
    fn test_dissimilarities_recipe() {
        let weights = WeightSet {
            alpha: Some(0.5),
            beta: Some(2.0),
            gamma: Some(1.0),
            ..Default::default()
        };
        let node = AddDissimilaritiesMode.create_recipe("k", &ckpts(), &weights);
        let scaled = &node.sources()[1];
        assert_eq!(scaled.op(), &Op::Multiply { alpha: 2.0 });
        assert_eq!(
            scaled.sources()[0].op(),
            &Op::Similarities {
                alpha: 0.5,
                beta: 1.0,
                gamma: 15.0
            }
        );
    }
}
