//! Checkpoint merging for diffusion models.
//!
//! Every tensor of the output is described by a small recipe: a graph of
//! operators over tensors loaded from up to four checkpoints. Recipes are
//! built per key by a calc mode, evaluated lazily on a worker pool and
//! memoized structurally, so equal subexpressions computed by one merge are
//! served from a bounded LRU cache in the next.
//!
//! # Calc Modes
//!
//! - **Weight-Sum**: `A * (1 - alpha) + B * alpha`
//! - **Add Difference**: `A + (B - C) * alpha`, optionally smoothed
//! - **Train Difference**: adds `B - C` as if A had been fine-tuned on it
//! - **Extract / Add Dissimilarities**: cosine-similarity feature transfer
//! - **Power-up (DARE) / DELLA**: drop-and-rescale of `B - A`
//! - **Comparative / Enhanced Interp, Weighted Sum CutOff**: interpolation
//!   gated by the A/B difference
//!
//! # Weights
//!
//! Weights are assigned by glob or regex targets. When several targets match
//! a key, the narrowest one (fewest matching keys) wins field by field.
//!
//! # Example
//!
//! ```ignore
//! use kitbash_merge::{Merger, MergerConfig, MergeRequest, SafetensorsStore};
//!
//! let request = MergeRequest::from_yaml_file("request.yaml")?;
//! let store = SafetensorsStore::new("models/");
//! let merger = Merger::new(MergerConfig::default());
//!
//! let outcome = merger.merge(&request, &store, None)?;
//! println!("{} tensors merged", outcome.tensors.len());
//! ```

#![warn(missing_docs)]

mod cache;
pub mod calcmodes;
mod config;
mod error;
mod executor;
pub mod graph;
mod loader;
mod merge;
pub mod ops;
mod store;
mod tensor;
mod weights;

pub use cache::*;
pub use config::*;
pub use error::*;
pub use executor::*;
pub use loader::*;
pub use merge::*;
pub use store::*;
pub use tensor::*;
pub use weights::*;

/// Re-export calc mode building blocks for convenience
pub use calcmodes::{CalcMode, CalcModeRegistry, Slider};
pub use graph::{Node, NodeRef};
pub use ops::Op;
