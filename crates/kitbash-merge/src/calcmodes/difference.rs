//! Difference modes: add what B learned relative to C onto A.
//!
//! The difference node is cached. It only depends on B and C (and A for
//! train-difference), so re-running with a different multiplier reuses it.

use super::{CalcMode, Slider};
use crate::graph::{Node, NodeRef};
use crate::ops::Op;
use crate::weights::{Param, WeightSet};
use crate::Checkpoints;

const MULTIPLIER: Slider = Slider {
    label: "addition multiplier",
    param: Param::Alpha,
    min: -1.0,
    max: 2.0,
    step: 0.01,
};

const ADD_DIFFERENCE_SLIDERS: [Slider; 2] = [
    MULTIPLIER,
    Slider {
        label: "smooth (slow)",
        param: Param::Beta,
        min: 0.0,
        max: 1.0,
        step: 1.0,
    },
];

const TRAIN_DIFFERENCE_SLIDERS: [Slider; 1] = [MULTIPLIER];

/// `A + (B - C) * alpha`, optionally smoothing the difference.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddDifferenceMode;

impl CalcMode for AddDifferenceMode {
    fn name(&self) -> &'static str {
        "Add Difference"
    }

    fn description(&self) -> &'static str {
        "model_a + (model_b - model_c) * alpha"
    }

    fn input_models(&self) -> usize {
        3
    }

    fn sliders(&self) -> &'static [Slider] {
        &ADD_DIFFERENCE_SLIDERS
    }

    fn create_recipe(&self, key: &str, checkpoints: &Checkpoints, weights: &WeightSet) -> NodeRef {
        let a = Node::load(key, checkpoints.model_a());
        let b = Node::load(key, checkpoints.model_b());
        let c = Node::load(key, checkpoints.model_c());

        let diff = if weights.beta() == 1.0 {
            let raw = Node::new(key, Op::Sub, vec![b, c]);
            Node::cached(key, Op::Smooth, vec![raw])
        } else {
            Node::cached(key, Op::Sub, vec![b, c])
        };
        let scaled = Node::new(key, Op::Multiply { alpha: weights.alpha() }, vec![diff]);
        Node::new(key, Op::Add, vec![a, scaled])
    }
}

/// `A + TrainDiff(A, B, C) * alpha`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrainDifferenceMode;

impl CalcMode for TrainDifferenceMode {
    fn name(&self) -> &'static str {
        "Train Difference"
    }

    fn description(&self) -> &'static str {
        "model_a + train_diff(model_a, model_b, model_c) * alpha"
    }

    fn input_models(&self) -> usize {
        3
    }

    fn sliders(&self) -> &'static [Slider] {
        &TRAIN_DIFFERENCE_SLIDERS
    }

    fn create_recipe(&self, key: &str, checkpoints: &Checkpoints, weights: &WeightSet) -> NodeRef {
        let a = Node::load(key, checkpoints.model_a());
        let b = Node::load(key, checkpoints.model_b());
        let c = Node::load(key, checkpoints.model_c());

        let diff = Node::cached(key, Op::TrainDiff, vec![a.clone(), b, c]);
        let scaled = Node::new(key, Op::Multiply { alpha: weights.alpha() }, vec![diff]);
        Node::new(key, Op::Add, vec![a, scaled])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calcmodes::test_support::ckpts;

    #[test]
    fn test_add_difference_caches_diff() {
        let weights = WeightSet {
            alpha: Some(0.5),
            ..Default::default()
        };
        let node = AddDifferenceMode.create_recipe("k", &ckpts(), &weights);
        let scaled = &node.sources()[1];
        let diff = &scaled.sources()[0];
        assert_eq!(diff.op(), &Op::Sub);
        assert!(diff.is_cacheable());
    }

    #[test]
    fn test_add_difference_smooth() {
        let weights = WeightSet {
            alpha: Some(0.5),
            beta: Some(1.0),
            ..Default::default()
        };
        let node = AddDifferenceMode.create_recipe("k", &ckpts(), &weights);
        let diff = &node.sources()[1].sources()[0];
        assert_eq!(diff.op(), &Op::Smooth);
        assert!(diff.is_cacheable());
    }

    #[test]
    fn test_diff_shared_across_multipliers() {
        let w1 = WeightSet {
            alpha: Some(0.5),
            ..Default::default()
        };
        let w2 = WeightSet {
            alpha: Some(1.5),
            ..Default::default()
        };
        let x = TrainDifferenceMode.create_recipe("k", &ckpts(), &w1);
        let y = TrainDifferenceMode.create_recipe("k", &ckpts(), &w2);
        assert_ne!(x, y);
        assert_eq!(x.sources()[1].sources()[0], y.sources()[1].sources()[0]);
    }
}
