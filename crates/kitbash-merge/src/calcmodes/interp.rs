//! Interpolation modes gated by the A/B difference.

use super::{CalcMode, Slider, TEXT_EMBEDDING_PREFIXES};
use crate::graph::{Node, NodeRef};
use crate::ops::Op;
use crate::weights::{Param, WeightSet};
use crate::Checkpoints;

const fn unit(label: &'static str, param: Param, step: f32) -> Slider {
    Slider {
        label,
        param,
        min: 0.0,
        max: 1.0,
        step,
    }
}

const COMPARATIVE_SLIDERS: [Slider; 3] = [
    unit("concave - convex", Param::Alpha, 0.01),
    unit("similarity - difference", Param::Beta, 1.0),
    unit("binomial - linear", Param::Gamma, 0.01),
];

const MANUAL_SLIDERS: [Slider; 4] = [
    unit("interpolation strength", Param::Alpha, 0.001),
    unit("lower mean threshold", Param::Beta, 0.001),
    unit("upper mean threshold", Param::Gamma, 0.001),
    unit("smoothness factor", Param::Delta, 0.001),
];

const AUTO_SLIDERS: [Slider; 3] = [
    unit("interpolation strength", Param::Alpha, 0.001),
    unit("threshold adjustment factor", Param::Beta, 0.001),
    unit("smoothness factor", Param::Gamma, 0.001),
];

const CUTOFF_SLIDERS: [Slider; 3] = [
    unit("difference weight scale", Param::Alpha, 0.001),
    unit("lower mean threshold", Param::Beta, 0.001),
    unit("upper mean threshold", Param::Gamma, 0.001),
];

/// Per-element interpolation; all text-embedding keys come from A.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComparativeInterpMode;

impl CalcMode for ComparativeInterpMode {
    fn name(&self) -> &'static str {
        "Comparative Interp"
    }

    fn description(&self) -> &'static str {
        "Interpolates between each pair of values from A and B depending on their difference relative to other values"
    }

    fn input_models(&self) -> usize {
        2
    }

    fn sliders(&self) -> &'static [Slider] {
        &COMPARATIVE_SLIDERS
    }

    fn create_recipe(&self, key: &str, checkpoints: &Checkpoints, weights: &WeightSet) -> NodeRef {
        let a = Node::load(key, checkpoints.model_a());
        if TEXT_EMBEDDING_PREFIXES.iter().any(|p| key.starts_with(*p)) {
            return a;
        }
        let b = Node::load(key, checkpoints.model_b());
        Node::new(
            key,
            Op::InterpDifference {
                alpha: weights.alpha(),
                beta: weights.beta(),
                gamma: weights.gamma(),
                seed: weights.seed(),
            },
            vec![a, b],
        )
    }
}

/// Interpolation restricted to a user-chosen band of mean similarity.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualInterpMode;

impl CalcMode for ManualInterpMode {
    fn name(&self) -> &'static str {
        "Enhanced Man Interp"
    }

    fn description(&self) -> &'static str {
        "Interpolation between A and B restricted to values whose mean similarity lies between two thresholds"
    }

    fn input_models(&self) -> usize {
        2
    }

    fn sliders(&self) -> &'static [Slider] {
        &MANUAL_SLIDERS
    }

    fn create_recipe(&self, key: &str, checkpoints: &Checkpoints, weights: &WeightSet) -> NodeRef {
        let a = Node::load(key, checkpoints.model_a());
        if key.starts_with(TEXT_EMBEDDING_PREFIXES[0]) {
            return a;
        }
        let b = Node::load(key, checkpoints.model_b());
        Node::new(
            key,
            Op::ManualInterpDifference {
                alpha: weights.alpha(),
                beta: weights.beta(),
                gamma: weights.gamma(),
                delta: weights.delta(),
                seed: weights.seed(),
            },
            vec![a, b],
        )
    }
}

/// Interpolation restricted to a band around the mean similarity.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoInterpMode;

impl CalcMode for AutoInterpMode {
    fn name(&self) -> &'static str {
        "Enhanced Auto Interp"
    }

    fn description(&self) -> &'static str {
        "Interpolation between A and B restricted to values near the mean similarity"
    }

    fn input_models(&self) -> usize {
        2
    }

    fn sliders(&self) -> &'static [Slider] {
        &AUTO_SLIDERS
    }

    fn create_recipe(&self, key: &str, checkpoints: &Checkpoints, weights: &WeightSet) -> NodeRef {
        let a = Node::load(key, checkpoints.model_a());
        if key.starts_with(TEXT_EMBEDDING_PREFIXES[0]) {
            return a;
        }
        let b = Node::load(key, checkpoints.model_b());
        Node::new(
            key,
            Op::AutoInterpDifference {
                alpha: weights.alpha(),
                beta: weights.beta(),
                gamma: weights.gamma(),
                seed: weights.seed(),
            },
            vec![a, b],
        )
    }
}

/// Weighted sum applied only inside a band of mean similarity.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightSumCutoffMode;

impl CalcMode for WeightSumCutoffMode {
    fn name(&self) -> &'static str {
        "Weighted Sum CutOff"
    }

    fn description(&self) -> &'static str {
        "Weighted sum applied where the mean similarity lies between two thresholds"
    }

    fn input_models(&self) -> usize {
        2
    }

    fn sliders(&self) -> &'static [Slider] {
        &CUTOFF_SLIDERS
    }

    fn create_recipe(&self, key: &str, checkpoints: &Checkpoints, weights: &WeightSet) -> NodeRef {
        let a = Node::load(key, checkpoints.model_a());
        let b = Node::load(key, checkpoints.model_b());
        Node::new(
            key,
            Op::WeightSumCutoff {
                alpha: weights.alpha(),
                beta: weights.beta(),
                gamma: weights.gamma(),
            },
            vec![a, b],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calcmodes::test_support::ckpts;

    const TOKEN_KEY: &str = "conditioner.embedders.1.model.token_embedding.weight";
    const CLIP_KEY: &str = "cond_stage_model.transformer.text_model.embeddings.position_ids";

    #[test]
    fn test_comparative_skips_all_embedding_prefixes() {
        let ckpts = ckpts();
        for key in [TOKEN_KEY, CLIP_KEY] {
            let node = ComparativeInterpMode.create_recipe(key, &ckpts, &WeightSet::default());
            assert_eq!(node, Node::load(key, ckpts.model_a()));
        }
    }

    #[test]
    fn test_enhanced_modes_skip_only_first_prefix() {
        let ckpts = ckpts();
        let w = WeightSet::default();
        assert_eq!(ManualInterpMode.create_recipe(CLIP_KEY, &ckpts, &w).op().name(), "load");
        assert_eq!(
            ManualInterpMode.create_recipe(TOKEN_KEY, &ckpts, &w).op().name(),
            "manual_interp_difference"
        );
        assert_eq!(
            AutoInterpMode.create_recipe(TOKEN_KEY, &ckpts, &w).op().name(),
            "auto_interp_difference"
        );
    }

    #[test]
    fn test_cutoff_recipe() {
        let weights = WeightSet {
            alpha: Some(0.5),
            beta: Some(0.1),
            gamma: Some(0.9),
            ..Default::default()
        };
        let node = WeightSumCutoffMode.create_recipe("w", &ckpts(), &weights);
        assert_eq!(
            node.op(),
            &Op::WeightSumCutoff {
                alpha: 0.5,
                beta: 0.1,
                gamma: 0.9
            }
        );
    }
}
