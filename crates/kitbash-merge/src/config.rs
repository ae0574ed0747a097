//! Configuration types for merging, typically loaded from YAML.

use serde::{Deserialize, Serialize};

use crate::cache::MAX_CACHE_BYTES;
use crate::weights::{Target, TargetPattern};
use crate::{Checkpoints, Device, Dtype, MergeError, Result};

/// Settings of a [`Merger`](crate::Merger) that outlive a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergerConfig {
    /// Result cache budget in MiB, clamped to 8192. 0 disables the cache.
    #[serde(default = "default_cache_size_mib")]
    pub cache_size_mib: usize,

    /// Worker threads. 0 means twice the available parallelism.
    #[serde(default)]
    pub threads: usize,

    /// Compute device.
    #[serde(default)]
    pub device: Device,

    /// Working precision every tensor is normalized to.
    #[serde(default)]
    pub dtype: Dtype,
}

fn default_cache_size_mib() -> usize {
    4096
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            cache_size_mib: default_cache_size_mib(),
            threads: 0,
            device: Device::default(),
            dtype: Dtype::default(),
        }
    }
}

impl MergerConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Cache budget in bytes, after clamping.
    pub fn cache_bytes(&self) -> usize {
        self.cache_size_mib
            .saturating_mul(1024 * 1024)
            .min(MAX_CACHE_BYTES)
    }

    /// Worker count actually used.
    pub fn effective_threads(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(2)
    }
}

/// How the filter list of a request selects keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Only matching keys may be merged.
    Include,
    /// Matching keys are copied from the primary checkpoint.
    Exclude,
}

/// Compiled key filter.
#[derive(Debug, Clone)]
pub struct KeyFilter {
    mode: FilterMode,
    patterns: Vec<TargetPattern>,
}

impl KeyFilter {
    /// Parse `[mode, pattern...]`. An empty list yields `None`.
    pub fn parse(list: &[String]) -> Result<Option<Self>> {
        let Some((mode, patterns)) = list.split_first() else {
            return Ok(None);
        };
        let mode = match mode.to_ascii_lowercase().as_str() {
            "include" => FilterMode::Include,
            "exclude" => FilterMode::Exclude,
            other => {
                return Err(MergeError::InvalidConfig(format!(
                    "filter mode must be 'include' or 'exclude', got '{other}'"
                )))
            }
        };
        let patterns = patterns
            .iter()
            .map(|p| TargetPattern::compile(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Self { mode, patterns }))
    }

    /// Filter mode.
    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    /// Whether `key` may receive a recipe.
    pub fn allows(&self, key: &str) -> bool {
        let matched = self.patterns.iter().any(|p| p.is_match(key));
        match self.mode {
            FilterMode::Include => matched,
            FilterMode::Exclude => !matched,
        }
    }
}

/// One merge request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    /// Name of the calc mode.
    pub calc_mode: String,

    /// Two to four checkpoint names; the first is the primary. Unused
    /// trailing slots may be empty strings.
    pub checkpoints: Vec<String>,

    /// Weight assignments, broadest to narrowest in any order.
    #[serde(default)]
    pub targets: Vec<Target>,

    /// `[include|exclude, pattern...]`.
    #[serde(default)]
    pub filter: Vec<String>,
}

impl MergeRequest {
    /// Create a request with no targets and no filter.
    pub fn new<I, S>(calc_mode: impl Into<String>, checkpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            calc_mode: calc_mode.into(),
            checkpoints: checkpoints.into_iter().map(Into::into).collect(),
            targets: Vec::new(),
            filter: Vec::new(),
        }
    }

    /// Builder: append a target.
    pub fn with_target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    /// Builder: set the filter list.
    pub fn with_filter<I, S>(mut self, filter: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter = filter.into_iter().map(Into::into).collect();
        self
    }

    /// Load a request from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse a request from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Checkpoint slots in request order.
    pub fn checkpoints(&self) -> Checkpoints {
        Checkpoints::new(&self.checkpoints)
    }

    /// Compiled filter, if any.
    pub fn key_filter(&self) -> Result<Option<KeyFilter>> {
        KeyFilter::parse(&self.filter)
    }

    /// Structural checks that need no calc mode.
    pub fn validate(&self) -> Result<()> {
        if !(2..=4).contains(&self.checkpoints.len()) {
            return Err(MergeError::InvalidConfig(format!(
                "expected 2 to 4 checkpoints, got {}",
                self.checkpoints.len()
            )));
        }
        if self.checkpoints[0].is_empty() {
            return Err(MergeError::InvalidConfig(
                "primary checkpoint must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_defaults() {
        let config = MergerConfig::from_yaml("threads: 3\n").unwrap();
        assert_eq!(config.threads, 3);
        assert_eq!(config.cache_size_mib, 4096);
        assert_eq!(config.dtype, Dtype::F16);
        assert_eq!(config.device, Device::Cpu);
        assert_eq!(config.effective_threads(), 3);
    }

    #[test]
    fn test_cache_bytes_clamped() {
        let config = MergerConfig {
            cache_size_mib: 100_000,
            ..Default::default()
        };
        assert_eq!(config.cache_bytes(), MAX_CACHE_BYTES);
        let config = MergerConfig {
            cache_size_mib: 1,
            ..Default::default()
        };
        assert_eq!(config.cache_bytes(), 1024 * 1024);
    }

    #[test]
    fn test_parse_config_dtype() {
        let config = MergerConfig::from_yaml("dtype: bf16\ncache_size_mib: 0\n").unwrap();
        assert_eq!(config.dtype, Dtype::BF16);
        assert_eq!(config.cache_bytes(), 0);
        assert!(MergerConfig::from_yaml("device: tpu\n").is_err());
    }

    #[test]
    fn test_parse_request() {
        let yaml = r#"
calc_mode: Weight-Sum
checkpoints: [a.safetensors, b.safetensors, "", ""]
targets:
  - pattern: "*"
    alpha: 0.5
  - pattern: "model.diffusion_model.out.*"
    alpha: 0.8
    seed: 42
filter: [exclude, "first_stage_model.*"]
"#;
        let request = MergeRequest::from_yaml(yaml).unwrap();
        assert_eq!(request.calc_mode, "Weight-Sum");
        assert_eq!(request.targets.len(), 2);
        assert_eq!(request.targets[1].weights.seed, Some(42));
        request.validate().unwrap();

        let ckpts = request.checkpoints();
        assert_eq!(ckpts.primary().as_str(), "a.safetensors");
        assert!(ckpts.model_c().is_empty());

        let filter = request.key_filter().unwrap().unwrap();
        assert_eq!(filter.mode(), FilterMode::Exclude);
        assert!(!filter.allows("first_stage_model.decoder.w"));
        assert!(filter.allows("model.diffusion_model.w"));
    }

    #[test]
    fn test_include_filter() {
        let filter = KeyFilter::parse(&["include".into(), "unet.*".into()]).unwrap().unwrap();
        assert!(filter.allows("unet.a"));
        assert!(!filter.allows("vae.a"));
    }

    #[test]
    fn test_filter_rejects_unknown_mode() {
        let err = KeyFilter::parse(&["maybe".into()]).unwrap_err();
        assert!(matches!(err, MergeError::InvalidConfig(_)));
        assert!(KeyFilter::parse(&[]).unwrap().is_none());
    }

    #[test]
    fn test_request_validation() {
        assert!(MergeRequest::new("Weight-Sum", ["a"]).validate().is_err());
        assert!(MergeRequest::new("Weight-Sum", ["", "b"]).validate().is_err());
        assert!(MergeRequest::new("Weight-Sum", ["a", "b", "c", "d", "e"])
            .validate()
            .is_err());
        assert!(MergeRequest::new("Weight-Sum", ["a", "b"]).validate().is_ok());
    }
}
