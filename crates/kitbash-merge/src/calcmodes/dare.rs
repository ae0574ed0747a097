//! Drop-and-rescale modes.
//!
//! Both operators divide by `1 - alpha`, so on top of the slider range
//! `alpha` must stay strictly below 1.

use super::{CalcMode, Slider};
use crate::graph::{Node, NodeRef};
use crate::ops::Op;
use crate::weights::{Param, WeightSet};
use crate::{Checkpoints, MergeError, Result};

const POWER_UP_SLIDERS: [Slider; 2] = [
    Slider {
        label: "dropout rate",
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
];

const DELLA_SLIDERS: [Slider; 3] = [
    Slider {
        label: "drop rate",
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
        label: "magnitude threshold",
        param: Param::Gamma,
        min: 0.0,
        max: 1.0,
        step: 0.001,
    },
];

fn validate_rate(mode: &dyn CalcMode, weights: &WeightSet) -> Result<()> {
    for slider in mode.sliders() {
        if let Some(value) = weights.get(slider.param) {
            slider.check(mode.name(), value)?;
        }
    }
    let alpha = weights.alpha();
    if alpha >= 1.0 {
        return Err(MergeError::InvalidParameter {
            mode: mode.name().to_string(),
            parameter: "alpha".to_string(),
            value: alpha,
            min: 0.0,
            max: 1.0,
        });
    }
    Ok(())
}

/// `A + PowerUp(A, B) * beta`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PowerUpMode;

impl CalcMode for PowerUpMode {
    fn name(&self) -> &'static str {
        "Power-up (DARE)"
    }

    fn description(&self) -> &'static str {
        "Adds the capabilities of model_b to model_a"
    }

    fn input_models(&self) -> usize {
        2
    }

    fn sliders(&self) -> &'static [Slider] {
        &POWER_UP_SLIDERS
    }

    fn validate(&self, weights: &WeightSet) -> Result<()> {
        validate_rate(self, weights)
    }

    fn create_recipe(&self, key: &str, checkpoints: &Checkpoints, weights: &WeightSet) -> NodeRef {
        let a = Node::load(key, checkpoints.model_a());
        let b = Node::load(key, checkpoints.model_b());

        let delta_hat = Node::cached(
            key,
            Op::PowerUp {
                alpha: weights.alpha(),
                seed: weights.seed(),
            },
            vec![a.clone(), b],
        );
        let scaled = Node::new(key, Op::Multiply { alpha: weights.beta() }, vec![delta_hat]);
        Node::new(key, Op::Add, vec![a, scaled])
    }
}

/// `Della(A, B)`: drop, rescale and magnitude-gate `B - A`, then add it
/// onto A scaled by `beta`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DellaMode;

impl CalcMode for DellaMode {
    fn name(&self) -> &'static str {
        "DELLA"
    }

    fn description(&self) -> &'static str {
        "Drops and rescales (model_b - model_a) above a magnitude threshold and adds it to model_a"
    }

    fn input_models(&self) -> usize {
        2
    }

    fn sliders(&self) -> &'static [Slider] {
        &DELLA_SLIDERS
    }

    fn validate(&self, weights: &WeightSet) -> Result<()> {
        validate_rate(self, weights)
    }

    fn create_recipe(&self, key: &str, checkpoints: &Checkpoints, weights: &WeightSet) -> NodeRef {
        let a = Node::load(key, checkpoints.model_a());
        let b = Node::load(key, checkpoints.model_b());
        Node::cached(
            key,
            Op::Della {
                alpha: weights.alpha(),
                beta: weights.beta(),
                gamma: weights.gamma(),
                seed: weights.seed(),
            },
            vec![a, b],
        )
    }
}
