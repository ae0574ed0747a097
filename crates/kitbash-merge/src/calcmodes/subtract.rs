//! Subtract-Weights: `(A * alpha - B * beta) * gamma`.

use super::{CalcMode, Slider};
use crate::graph::{Node, NodeRef};
use crate::ops::Op;
use crate::weights::{Param, WeightSet};
use crate::Checkpoints;

const SLIDERS: [Slider; 3] = [
    Slider {
        label: "model_a ratio",
        param: Param::Alpha,
        min: -1.0,
        max: 1.0,
        step: 0.01,
    },
    Slider {
        label: "model_b ratio",
        param: Param::Beta,
        min: -1.0,
        max: 1.0,
        step: 0.01,
    },
    Slider {
        label: "total ratio",
        param: Param::Gamma,
        min: -1.0,
        max: 1.0,
        step: 0.01,
    },
];

/// Scaled difference of A and B. Unset ratios default to 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubtractWeightsMode;

impl CalcMode for SubtractWeightsMode {
    fn name(&self) -> &'static str {
        "Subtract-Weights"
    }

    fn description(&self) -> &'static str {
        "(model_a * alpha - model_b * beta) * gamma"
    }

    fn input_models(&self) -> usize {
        2
    }

    fn sliders(&self) -> &'static [Slider] {
        &SLIDERS
    }

    fn create_recipe(&self, key: &str, checkpoints: &Checkpoints, weights: &WeightSet) -> NodeRef {
        let alpha = weights.get_or(Param::Alpha, 1.0);
        let beta = weights.get_or(Param::Beta, 1.0);
        let gamma = weights.get_or(Param::Gamma, 1.0);

        let a = Node::new(
            key,
            Op::Multiply { alpha },
            vec![Node::load(key, checkpoints.model_a())],
        );
        let b = Node::new(
            key,
            Op::Multiply { alpha: beta },
            vec![Node::load(key, checkpoints.model_b())],
        );
        let diff = Node::new(key, Op::Sub, vec![a, b]);
        Node::new(key, Op::Multiply { alpha: gamma }, vec![diff])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calcmodes::test_support::ckpts;

    #[test]
    fn test_defaults_are_one() {
        let node = SubtractWeightsMode.create_recipe("k", &ckpts(), &WeightSet::default());
        assert_eq!(node.op(), &Op::Multiply { alpha: 1.0 });
        let diff = &node.sources()[0];
        assert_eq!(diff.op(), &Op::Sub);
        assert_eq!(diff.sources()[1].op(), &Op::Multiply { alpha: 1.0 });
    }

    #[test]
    fn test_set_ratios() {
        let weights = WeightSet {
            alpha: Some(0.5),
            beta: Some(-0.25),
            gamma: Some(0.75),
            ..Default::default()
        };
        let node = SubtractWeightsMode.create_recipe("k", &ckpts(), &weights);
        assert_eq!(node.op(), &Op::Multiply { alpha: 0.75 });
        let diff = &node.sources()[0];
        assert_eq!(diff.sources()[0].op(), &Op::Multiply { alpha: 0.5 });
        assert_eq!(diff.sources()[1].op(), &Op::Multiply { alpha: -0.25 });
    }
}
