//! Per-key weight assignment.
//!
//! A merge request carries an ordered list of [`Target`]s, each a name
//! pattern plus a partial [`WeightSet`]. Every key collects the sets of all
//! patterns that match it. Broad patterns are applied first and narrow ones
//! last, field by field, so a pattern covering fewer keys overrides the
//! values it sets and leaves the rest alone.

use std::cmp::Reverse;
use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{MergeError, Result};

/// Scalar parameter a slider drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Param {
    /// First slider.
    Alpha,
    /// Second slider.
    Beta,
    /// Third slider.
    Gamma,
    /// Fourth slider.
    Delta,
}

impl Param {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Param::Alpha => "alpha",
            Param::Beta => "beta",
            Param::Gamma => "gamma",
            Param::Delta => "delta",
        }
    }
}

/// A partial set of scalar parameters. Unset fields fall back to the calc
/// mode's defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightSet {
    /// First slider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha: Option<f32>,
    /// Second slider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beta: Option<f32>,
    /// Third slider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gamma: Option<f32>,
    /// Fourth slider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<f32>,
    /// Seed for random masks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl WeightSet {
    /// Overwrite every field that `other` sets.
    pub fn update(&mut self, other: &WeightSet) {
        self.alpha = other.alpha.or(self.alpha);
        self.beta = other.beta.or(self.beta);
        self.gamma = other.gamma.or(self.gamma);
        self.delta = other.delta.or(self.delta);
        self.seed = other.seed.or(self.seed);
    }

    /// Value of `param`, if set.
    pub fn get(&self, param: Param) -> Option<f32> {
        match param {
            Param::Alpha => self.alpha,
            Param::Beta => self.beta,
            Param::Gamma => self.gamma,
            Param::Delta => self.delta,
        }
    }

    /// Value of `param`, or `default`.
    pub fn get_or(&self, param: Param, default: f32) -> f32 {
        self.get(param).unwrap_or(default)
    }

    /// `alpha`, defaulting to 0.
    pub fn alpha(&self) -> f32 {
        self.alpha.unwrap_or(0.0)
    }

    /// `beta`, defaulting to 0.
    pub fn beta(&self) -> f32 {
        self.beta.unwrap_or(0.0)
    }

    /// `gamma`, defaulting to 0.
    pub fn gamma(&self) -> f32 {
        self.gamma.unwrap_or(0.0)
    }

    /// `delta`, defaulting to 0.
    pub fn delta(&self) -> f32 {
        self.delta.unwrap_or(0.0)
    }

    /// `seed`, defaulting to 0.
    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or(0)
    }
}

/// One `(pattern, weights)` entry of a merge request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Glob or `re:`-prefixed regex.
    pub pattern: String,
    /// Parameters assigned to matching keys.
    #[serde(flatten)]
    pub weights: WeightSet,
}

impl Target {
    /// Create a target.
    pub fn new(pattern: impl Into<String>, weights: WeightSet) -> Self {
        Self {
            pattern: pattern.into(),
            weights,
        }
    }
}

/// A compiled key pattern.
///
/// Globs support `*` (any run of characters, dots included) and `?` (one
/// character); everything else is literal. A `re:` prefix takes the rest as
/// a regular expression. Both forms must match the whole key.
#[derive(Debug, Clone)]
pub struct TargetPattern {
    source: String,
    regex: Regex,
}

impl TargetPattern {
    /// Compile `pattern`.
    pub fn compile(pattern: &str) -> Result<Self> {
        let body = match pattern.strip_prefix("re:") {
            Some(raw) => raw.to_string(),
            None => glob_to_regex(pattern),
        };
        let regex = Regex::new(&format!("^(?:{body})$")).map_err(|source| {
            MergeError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            }
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Pattern as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `key` matches.
    pub fn is_match(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2);
    let mut buf = [0u8; 4];
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    out
}

/// Resolve `targets` over `keys`.
///
/// Keys matched by no target are absent from the result.
pub fn resolve<S: AsRef<str>>(targets: &[Target], keys: &[S]) -> Result<HashMap<String, WeightSet>> {
    let mut matched: Vec<(usize, &WeightSet, Vec<&str>)> = Vec::with_capacity(targets.len());
    for (index, target) in targets.iter().enumerate() {
        let pattern = TargetPattern::compile(&target.pattern)?;
        let hits: Vec<&str> = keys
            .iter()
            .map(AsRef::as_ref)
            .filter(|k| pattern.is_match(k))
            .collect();
        debug!("Pattern '{}' matches {} keys", pattern.as_str(), hits.len());
        matched.push((index, &target.weights, hits));
    }

    // Broadest first; among equals, earlier declarations are applied last.
    matched.sort_by_key(|(index, _, hits)| (Reverse(hits.len()), Reverse(*index)));

    let mut resolved: HashMap<String, WeightSet> = HashMap::new();
    for (_, weights, hits) in &matched {
        for key in hits {
            resolved.entry((*key).to_string()).or_default().update(weights);
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alpha(a: f32) -> WeightSet {
        WeightSet {
            alpha: Some(a),
            ..Default::default()
        }
    }

    #[test]
    fn test_glob_matching() {
        let p = TargetPattern::compile("model.*.weight").unwrap();
        assert!(p.is_match("model.layer.0.weight"));
        assert!(!p.is_match("model.layer.0.bias"));
        assert!(!p.is_match("xmodel.a.weight"));

        let p = TargetPattern::compile("k?").unwrap();
        assert!(p.is_match("k1"));
        assert!(!p.is_match("k12"));

        let p = TargetPattern::compile("a+b").unwrap();
        assert!(p.is_match("a+b"));
        assert!(!p.is_match("aab"));
    }

    #[test]
    fn test_regex_pattern_is_anchored() {
        let p = TargetPattern::compile("re:k[0-9]").unwrap();
        assert!(p.is_match("k7"));
        assert!(!p.is_match("xk7"));
        assert!(!p.is_match("k77"));
    }

    #[test]
    fn test_invalid_regex() {
        let err = TargetPattern::compile("re:k[").unwrap_err();
        assert!(matches!(err, MergeError::InvalidPattern { .. }));
    }

    #[test]
    fn test_narrowest_pattern_wins() {
        let keys = ["k1", "k2", "k3"];
        let targets = vec![Target::new("k2", alpha(0.8)), Target::new("k*", alpha(0.5))];
        let resolved = resolve(&targets, &keys).unwrap();
        assert_eq!(resolved["k1"].alpha, Some(0.5));
        assert_eq!(resolved["k2"].alpha, Some(0.8));
        assert_eq!(resolved["k3"].alpha, Some(0.5));
    }

    #[test]
    fn test_declaration_order_does_not_change_overlap() {
        let keys = ["k1", "k2", "k3"];
        let targets = vec![Target::new("k*", alpha(0.5)), Target::new("k2", alpha(0.8))];
        let resolved = resolve(&targets, &keys).unwrap();
        assert_eq!(resolved["k2"].alpha, Some(0.8));
    }

    #[test]
    fn test_fieldwise_overwrite() {
        let keys = ["k1", "k2"];
        let broad = WeightSet {
            alpha: Some(0.1),
            beta: Some(0.2),
            ..Default::default()
        };
        let targets = vec![Target::new("*", broad), Target::new("k1", alpha(0.9))];
        let resolved = resolve(&targets, &keys).unwrap();
        assert_eq!(resolved["k1"].alpha, Some(0.9));
        assert_eq!(resolved["k1"].beta, Some(0.2));
    }

    #[test]
    fn test_equal_counts_earlier_wins() {
        let keys = ["k1"];
        let targets = vec![Target::new("k1", alpha(0.3)), Target::new("k?", alpha(0.7))];
        let resolved = resolve(&targets, &keys).unwrap();
        assert_eq!(resolved["k1"].alpha, Some(0.3));
    }

    #[test]
    fn test_unmatched_keys_absent() {
        let keys = ["a", "b"];
        let resolved = resolve(&[Target::new("a", alpha(1.0))], &keys).unwrap();
        assert!(resolved.contains_key("a"));
        assert!(!resolved.contains_key("b"));
    }

    #[test]
    fn test_target_yaml() {
        let t: Target = serde_yaml::from_str("pattern: \"*.bias\"\nalpha: 0.5\nseed: 3\n").unwrap();
        assert_eq!(t.pattern, "*.bias");
        assert_eq!(t.weights.alpha, Some(0.5));
        assert_eq!(t.weights.seed, Some(3));
        assert_eq!(t.weights.beta, None);
    }
}
