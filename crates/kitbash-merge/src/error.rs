//! Error types for checkpoint merging.

use thiserror::Error;

/// Errors that can occur while building or evaluating a merge.
#[derive(Debug, Error)]
pub enum MergeError {
    /// A checkpoint does not contain the requested key.
    #[error("Key '{key}' not found in checkpoint '{checkpoint}'")]
    MissingKey {
        /// Checkpoint that was queried.
        checkpoint: String,
        /// Tensor key that was requested.
        key: String,
    },

    /// A checkpoint could not be opened.
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// Shape mismatch between tensors that an operator cannot reconcile.
    #[error("Shape mismatch for tensor '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Tensor name.
        name: String,
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// A resolved scalar lies outside the range a calc mode accepts.
    #[error("Invalid {parameter} = {value} for '{mode}' (expected {min}..={max})")]
    InvalidParameter {
        /// Calc mode that rejected the value.
        mode: String,
        /// Parameter name (alpha, beta, gamma, delta).
        parameter: String,
        /// Offending value.
        value: f32,
        /// Inclusive lower bound.
        min: f32,
        /// Inclusive upper bound.
        max: f32,
    },

    /// Memory or addressable size exhausted.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The requested calc mode is not registered.
    #[error("Unknown calc mode: {0}")]
    UnknownCalcMode(String),

    /// Not enough checkpoints for the selected calc mode.
    #[error("Expected at least {expected} models, got {actual}")]
    NotEnoughModels {
        /// Expected number of models.
        expected: usize,
        /// Actual number of models.
        actual: usize,
    },

    /// Invalid merge configuration or request.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A target pattern failed to compile.
    #[error("Invalid target pattern '{pattern}': {source}")]
    InvalidPattern {
        /// Pattern as written by the user.
        pattern: String,
        /// Underlying regex error.
        #[source]
        source: regex::Error,
    },

    /// Tensor dtype not supported by the merge engine.
    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    /// Broken internal invariant or worker failure.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Safetensors error.
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl MergeError {
    /// Whether this is a missing key in a checkpoint other than `primary`.
    ///
    /// Such failures are recovered per task by loading the primary's tensor.
    pub fn is_secondary_missing_key(&self, primary: &str) -> bool {
        matches!(self, MergeError::MissingKey { checkpoint, .. } if checkpoint != primary)
    }
}

/// Result type for merge operations.
pub type Result<T> = std::result::Result<T, MergeError>;
