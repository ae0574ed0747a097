//! Calc modes: named strategies that turn one key into a recipe graph.
//!
//! Each mode decides which checkpoints it reads, which operators it chains
//! and which intermediate nodes are worth caching. Modes never touch tensors
//! themselves.
//!
//! Built-in modes:
//!
//! - **Weight-Sum**, **Subtract-Weights**: plain linear combinations
//! - **Comparative / Enhanced Man / Enhanced Auto Interp**, **Weighted Sum
//!   CutOff**: per-element interpolation gated by how much A and B differ
//! - **Add Difference**, **Train Difference**: add a (smoothed or
//!   distance-scaled) B - C onto A
//! - **Extract**, **Add Dissimilarities**: add cosine-similarity features
//! - **Power-up (DARE)**, **DELLA**: add a randomly dropped and rescaled B - A

mod dare;
mod difference;
mod extract;
mod interp;
mod subtract;
mod weight_sum;

pub use dare::{DellaMode, PowerUpMode};
pub use difference::{AddDifferenceMode, TrainDifferenceMode};
pub use extract::{AddDissimilaritiesMode, ExtractMode};
pub use interp::{AutoInterpMode, ComparativeInterpMode, ManualInterpMode, WeightSumCutoffMode};
pub use subtract::SubtractWeightsMode;
pub use weight_sum::WeightSumMode;

use std::fmt;

use crate::graph::NodeRef;
use crate::weights::{Param, WeightSet};
use crate::{Checkpoints, MergeError, Result};

/// One user-facing scalar control of a calc mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Slider {
    /// What the slider does.
    pub label: &'static str,
    /// Parameter it drives.
    pub param: Param,
    /// Inclusive lower bound.
    pub min: f32,
    /// Inclusive upper bound.
    pub max: f32,
    /// UI step.
    pub step: f32,
}

impl Slider {
    /// Fail if `value` lies outside `[min, max]`.
    pub fn check(&self, mode: &str, value: f32) -> Result<()> {
        if !(self.min..=self.max).contains(&value) {
            return Err(MergeError::InvalidParameter {
                mode: mode.to_string(),
                parameter: self.param.as_str().to_string(),
                value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }
}

/// Trait for calc mode implementations.
pub trait CalcMode: Send + Sync {
    /// Name used in merge requests.
    fn name(&self) -> &'static str;

    /// Human-readable description.
    fn description(&self) -> &'static str;

    /// Number of checkpoints the mode reads (2 to 4).
    fn input_models(&self) -> usize;

    /// Exposed sliders.
    fn sliders(&self) -> &'static [Slider];

    /// Check resolved parameters before any evaluation.
    ///
    /// The default rejects any set slider parameter outside its range.
    fn validate(&self, weights: &WeightSet) -> Result<()> {
        for slider in self.sliders() {
            if let Some(value) = weights.get(slider.param) {
                slider.check(self.name(), value)?;
            }
        }
        Ok(())
    }

    /// Build the recipe for `key`.
    fn create_recipe(&self, key: &str, checkpoints: &Checkpoints, weights: &WeightSet) -> NodeRef;
}

/// Name to calc mode lookup.
pub struct CalcModeRegistry {
    modes: Vec<Box<dyn CalcMode>>,
}

impl CalcModeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self { modes: Vec::new() }
    }

    /// A registry holding every built-in mode.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(WeightSumMode));
        registry.register(Box::new(SubtractWeightsMode));
        registry.register(Box::new(ComparativeInterpMode));
        registry.register(Box::new(ManualInterpMode));
        registry.register(Box::new(AutoInterpMode));
        registry.register(Box::new(AddDifferenceMode));
        registry.register(Box::new(TrainDifferenceMode));
        registry.register(Box::new(ExtractMode));
        registry.register(Box::new(AddDissimilaritiesMode));
        registry.register(Box::new(PowerUpMode));
        registry.register(Box::new(DellaMode));
        registry.register(Box::new(WeightSumCutoffMode));
        registry
    }

    /// Add a mode, replacing any mode of the same name.
    pub fn register(&mut self, mode: Box<dyn CalcMode>) {
        match self.modes.iter().position(|m| m.name() == mode.name()) {
            Some(i) => self.modes[i] = mode,
            None => self.modes.push(mode),
        }
    }

    /// Look up a mode by name.
    pub fn get(&self, name: &str) -> Result<&dyn CalcMode> {
        self.modes
            .iter()
            .find(|m| m.name() == name)
            .map(|m| m.as_ref())
            .ok_or_else(|| MergeError::UnknownCalcMode(name.to_string()))
    }

    /// Registered modes, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn CalcMode> {
        self.modes.iter().map(|m| m.as_ref())
    }

    /// Number of registered modes.
    pub fn len(&self) -> usize {
        self.modes.len()
    }

    /// Whether no mode is registered.
    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }
}

impl Default for CalcModeRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl fmt::Debug for CalcModeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.modes.iter().map(|m| m.name())).finish()
    }
}

/// Keys of text-encoder embeddings the interp modes copy from A unchanged.
pub(crate) const TEXT_EMBEDDING_PREFIXES: [&str; 4] = [
    "cond_stage_model.transformer.text_model.embeddings",
    "conditioner.embedders.0.transformer.text_model.embeddings",
    "conditioner.embedders.1.model.token_embedding",
    "conditioner.embedders.1.model.positional_embedding",
];

#[cfg(test)]
pub(crate) mod test_support {
    use crate::Checkpoints;

    pub fn ckpts() -> Checkpoints {
        Checkpoints::new(["a", "b", "c", ""])
    }
}
