//! Weight-Sum: `A * (1 - alpha) + B * alpha`.
//!
//! At either end of the slider the recipe is the load node itself, so no
//! arithmetic runs and the tensor is copied bit-for-bit.

use super::{CalcMode, Slider};
use crate::graph::{Node, NodeRef};
use crate::ops::Op;
use crate::weights::{Param, WeightSet};
use crate::Checkpoints;

const SLIDERS: [Slider; 1] = [Slider {
    label: "model_a - model_b",
    param: Param::Alpha,
    min: 0.0,
    max: 1.0,
    step: 0.01,
}];

/// Linear blend of A and B.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightSumMode;

impl CalcMode for WeightSumMode {
    fn name(&self) -> &'static str {
        "Weight-Sum"
    }

    fn description(&self) -> &'static str {
        "model_a * (1 - alpha) + model_b * alpha"
    }

    fn input_models(&self) -> usize {
        2
    }

    fn sliders(&self) -> &'static [Slider] {
        &SLIDERS
    }

    fn create_recipe(&self, key: &str, checkpoints: &Checkpoints, weights: &WeightSet) -> NodeRef {
        let alpha = weights.alpha();
        let a = Node::load(key, checkpoints.model_a());
        let b = Node::load(key, checkpoints.model_b());

        if alpha >= 1.0 {
            return b;
        }
        if alpha <= 0.0 {
            return a;
        }

        let a = Node::new(key, Op::Multiply { alpha: 1.0 - alpha }, vec![a]);
        let b = Node::new(key, Op::Multiply { alpha }, vec![b]);
        Node::new(key, Op::Add, vec![a, b])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calcmodes::test_support::ckpts;

    fn alpha(a: f32) -> WeightSet {
        WeightSet {
            alpha: Some(a),
            ..Default::default()
        }
    }

    #[test]
    fn test_boundaries_return_load_nodes() {
        let ckpts = ckpts();
        let zero = WeightSumMode.create_recipe("k", &ckpts, &alpha(0.0));
        assert_eq!(zero, Node::load("k", ckpts.model_a()));
        let one = WeightSumMode.create_recipe("k", &ckpts, &alpha(1.0));
        assert_eq!(one, Node::load("k", ckpts.model_b()));
    }

    #[test]
    fn test_interior_builds_blend() {
        let ckpts = ckpts();
        let node = WeightSumMode.create_recipe("k", &ckpts, &alpha(0.25));
        assert_eq!(node.op(), &Op::Add);
        assert_eq!(node.sources()[0].op(), &Op::Multiply { alpha: 0.75 });
        assert_eq!(node.sources()[1].op(), &Op::Multiply { alpha: 0.25 });
        assert!(!node.is_cacheable());
    }

    #[test]
    fn test_missing_alpha_defaults_to_a() {
        let ckpts = ckpts();
        let node = WeightSumMode.create_recipe("k", &ckpts, &WeightSet::default());
        assert_eq!(node, Node::load("k", ckpts.model_a()));
    }
}
