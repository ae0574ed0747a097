//! Lazy operation graph.
//!
//! A recipe is a tree of immutable [`Node`]s shared through [`Arc`]. Nothing
//! is computed when a node is built; [`evaluate`] walks the tree depth-first,
//! loading leaves from the opened checkpoints and applying operators on the
//! way back up.
//!
//! Two nodes are equal when their key, operator (kind, scalars, seed,
//! checkpoint) and sources are recursively equal. The result cache relies on
//! this: recipes rebuilt from scratch for a later merge still hit the entries
//! stored by an earlier one.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tracing::trace;

use crate::ops::Op;
use crate::{CheckpointId, CheckpointSet, Device, Dtype, ResultCache, Result, Tensor};

/// Name of a tensor inside a checkpoint.
pub type TensorKey = Arc<str>;

/// Shared handle to a graph node.
pub type NodeRef = Arc<Node>;

/// One vertex of a merge recipe.
pub struct Node {
    key: TensorKey,
    op: Op,
    sources: Vec<NodeRef>,
    cacheable: bool,
    hash: u64,
}

impl Node {
    /// Build an operator node over `sources`.
    pub fn new(key: impl Into<TensorKey>, op: Op, sources: Vec<NodeRef>) -> NodeRef {
        Self::build(key.into(), op, sources, false)
    }

    /// Like [`Node::new`], with the result kept in the cache when one is
    /// configured.
    pub fn cached(key: impl Into<TensorKey>, op: Op, sources: Vec<NodeRef>) -> NodeRef {
        Self::build(key.into(), op, sources, true)
    }

    /// Leaf reading `key` from `checkpoint`.
    pub fn load(key: impl Into<TensorKey>, checkpoint: &CheckpointId) -> NodeRef {
        Self::build(
            key.into(),
            Op::Load {
                checkpoint: checkpoint.clone(),
            },
            Vec::new(),
            false,
        )
    }

    fn build(key: TensorKey, op: Op, sources: Vec<NodeRef>, cacheable: bool) -> NodeRef {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        op.hash(&mut hasher);
        for source in &sources {
            hasher.write_u64(source.hash);
        }
        Arc::new(Self {
            key,
            op,
            sources,
            cacheable,
            hash: hasher.finish(),
        })
    }

    /// Tensor key this node produces.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The node's operator.
    pub fn op(&self) -> &Op {
        &self.op
    }

    /// Child nodes, in operator argument order.
    pub fn sources(&self) -> &[NodeRef] {
        &self.sources
    }

    /// Whether results of this node go through the cache.
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Checkpoints read anywhere below this node.
    pub fn checkpoints(&self) -> Vec<CheckpointId> {
        let mut out = Vec::new();
        self.collect_checkpoints(&mut out);
        out
    }

    fn collect_checkpoints(&self, out: &mut Vec<CheckpointId>) {
        if let Op::Load { checkpoint } = &self.op {
            if !out.contains(checkpoint) {
                out.push(checkpoint.clone());
            }
        }
        for source in &self.sources {
            source.collect_checkpoints(out);
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        self.hash == other.hash
            && self.key == other.key
            && self.op == other.op
            && self.sources.len() == other.sources.len()
            && self
                .sources
                .iter()
                .zip(&other.sources)
                .all(|(a, b)| Arc::ptr_eq(a, b) || **a == **b)
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            Op::Load { checkpoint } => write!(f, "load({checkpoint}:{})", self.key),
            op => {
                write!(f, "{}(", op.name())?;
                for (i, source) in self.sources.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{source:?}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// What [`evaluate`] needs from the surrounding merge.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    /// Opened checkpoints.
    pub checkpoints: &'a dyn CheckpointSet,
    /// Result cache, if enabled.
    pub cache: Option<&'a ResultCache>,
    /// Device every loaded tensor is moved to.
    pub device: Device,
    /// Dtype every loaded tensor is cast to.
    pub dtype: Dtype,
}

/// Evaluate `node` and everything below it.
///
/// Cacheable nodes are looked up before their sources are touched; on a miss
/// the freshly computed tensor is stored. Failures propagate unchanged.
pub fn evaluate(node: &NodeRef, ctx: &EvalContext<'_>) -> Result<Tensor> {
    if let Op::Load { checkpoint } = &node.op {
        let tensor = ctx.checkpoints.get_tensor(checkpoint, &node.key)?;
        return Ok(tensor.into_device(ctx.device, ctx.dtype));
    }

    let cache = ctx.cache.filter(|_| node.cacheable);
    if let Some(cache) = cache {
        if let Some(hit) = cache.get(node) {
            trace!("Cache hit for {} '{}'", node.op.name(), node.key);
            return Ok(hit);
        }
    }

    let inputs = node
        .sources
        .iter()
        .map(|source| evaluate(source, ctx))
        .collect::<Result<Vec<_>>>()?;
    let out = node.op.apply(&node.key, &inputs)?;

    if let Some(cache) = cache {
        cache.put(node, &out);
    }
    Ok(out)
}
