//! Checkpoint access.
//!
//! A [`TensorStore`] opens a set of checkpoints for the duration of one merge
//! and hands back a [`CheckpointSet`]. Everything the set holds open is
//! released when it is dropped, on success and failure alike.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::{MergeError, Result, Tensor};

/// Name of a checkpoint as given in a merge request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckpointId(Arc<str>);

impl CheckpointId {
    /// Create an id from a checkpoint name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// The checkpoint name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Unused request slots carry an empty name.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CheckpointId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for CheckpointId {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

/// The up-to-four checkpoint slots of a merge, in request order.
///
/// Slot A is the primary checkpoint. Unused slots hold an empty id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoints {
    slots: [CheckpointId; 4],
}

impl Checkpoints {
    /// Build from request order; missing trailing slots become empty.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut slots: [CheckpointId; 4] = std::array::from_fn(|_| CheckpointId::new(""));
        for (slot, name) in slots.iter_mut().zip(names) {
            *slot = CheckpointId::new(name);
        }
        Self { slots }
    }

    /// Primary checkpoint (slot A).
    pub fn primary(&self) -> &CheckpointId {
        &self.slots[0]
    }

    /// Slot A.
    pub fn model_a(&self) -> &CheckpointId {
        &self.slots[0]
    }

    /// Slot B.
    pub fn model_b(&self) -> &CheckpointId {
        &self.slots[1]
    }

    /// Slot C.
    pub fn model_c(&self) -> &CheckpointId {
        &self.slots[2]
    }

    /// Slot D.
    pub fn model_d(&self) -> &CheckpointId {
        &self.slots[3]
    }

    /// All four slots.
    pub fn slots(&self) -> &[CheckpointId] {
        &self.slots
    }

    /// Distinct non-empty ids, in slot order.
    pub fn distinct(&self) -> Vec<CheckpointId> {
        let mut out: Vec<CheckpointId> = Vec::with_capacity(4);
        for id in self.slots.iter().filter(|id| !id.is_empty()) {
            if !out.contains(id) {
                out.push(id.clone());
            }
        }
        out
    }
}

/// Source of checkpoint tensors, supplied by the host.
pub trait TensorStore: Send + Sync {
    /// Open `ids` for the duration of one merge.
    fn open(&self, ids: &[CheckpointId]) -> Result<Box<dyn CheckpointSet + '_>>;
}

/// A scoped handle over opened checkpoints.
pub trait CheckpointSet: Send + Sync {
    /// Keys of one opened checkpoint, in the checkpoint's own order.
    fn keys(&self, checkpoint: &CheckpointId) -> Result<Vec<String>>;

    /// Fetch one tensor. Fails with [`MergeError::MissingKey`] if absent.
    fn get_tensor(&self, checkpoint: &CheckpointId, key: &str) -> Result<Tensor>;
}

/// In-process checkpoints, for hosts that already hold tensors in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    checkpoints: HashMap<CheckpointId, MemoryCheckpoint>,
}

#[derive(Debug, Default, Clone)]
struct MemoryCheckpoint {
    order: Vec<String>,
    tensors: HashMap<String, Arc<Tensor>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a tensor.
    pub fn insert(&mut self, checkpoint: impl Into<CheckpointId>, key: impl Into<String>, tensor: Tensor) {
        let ckpt = self.checkpoints.entry(checkpoint.into()).or_default();
        let key = key.into();
        if !ckpt.tensors.contains_key(&key) {
            ckpt.order.push(key.clone());
        }
        ckpt.tensors.insert(key, Arc::new(tensor));
    }

    /// Builder-style [`MemoryStore::insert`].
    pub fn with_tensor(
        mut self,
        checkpoint: impl Into<CheckpointId>,
        key: impl Into<String>,
        tensor: Tensor,
    ) -> Self {
        self.insert(checkpoint, key, tensor);
        self
    }

    /// Whether a checkpoint with this id exists.
    pub fn contains(&self, checkpoint: &CheckpointId) -> bool {
        self.checkpoints.contains_key(checkpoint)
    }
}

impl TensorStore for MemoryStore {
    fn open(&self, ids: &[CheckpointId]) -> Result<Box<dyn CheckpointSet + '_>> {
        let mut opened = HashMap::with_capacity(ids.len());
        for id in ids {
            let ckpt = self
                .checkpoints
                .get(id)
                .ok_or_else(|| MergeError::CheckpointNotFound(id.to_string()))?;
            opened.insert(id.clone(), ckpt);
        }
        debug!("Opened {} in-memory checkpoints", opened.len());
        Ok(Box::new(MemorySet { opened }))
    }
}

struct MemorySet<'a> {
    opened: HashMap<CheckpointId, &'a MemoryCheckpoint>,
}

impl MemorySet<'_> {
    fn checkpoint(&self, id: &CheckpointId) -> Result<&MemoryCheckpoint> {
        self.opened
            .get(id)
            .copied()
            .ok_or_else(|| MergeError::CheckpointNotFound(id.to_string()))
    }
}

impl CheckpointSet for MemorySet<'_> {
    fn keys(&self, checkpoint: &CheckpointId) -> Result<Vec<String>> {
        Ok(self.checkpoint(checkpoint)?.order.clone())
    }

    fn get_tensor(&self, checkpoint: &CheckpointId, key: &str) -> Result<Tensor> {
        self.checkpoint(checkpoint)?
            .tensors
            .get(key)
            .map(|t| Tensor::clone(t))
            .ok_or_else(|| MergeError::MissingKey {
                checkpoint: checkpoint.to_string(),
                key: key.to_string(),
            })
    }
}
