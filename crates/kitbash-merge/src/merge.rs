//! Merge orchestration.
//!
//! [`Merger::merge`] runs one request end to end: resolve weights, build one
//! recipe per primary key, reuse whatever the previous merge already
//! produced, evaluate the rest on the worker pool and assemble the result.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::calcmodes::{CalcMode, CalcModeRegistry};
use crate::graph::{evaluate, EvalContext, Node, NodeRef, TensorKey};
use crate::weights::resolve;
use crate::{
    CacheStats, CheckpointId, Checkpoints, Executor, MergeError, MergeRequest, MergerConfig,
    Result, ResultCache, Tensor, TensorStore,
};

/// Scheduler buffers that are never merged.
pub const SKIP_KEYS: [&str; 12] = [
    "alphas_cumprod",
    "alphas_cumprod_prev",
    "betas",
    "log_one_minus_alphas_cumprod",
    "posterior_log_variance_clipped",
    "posterior_mean_coef1",
    "posterior_mean_coef2",
    "posterior_variance",
    "sqrt_alphas_cumprod",
    "sqrt_one_minus_alphas_cumprod",
    "sqrt_recip_alphas_cumprod",
    "sqrt_recipm1_alphas_cumprod",
];

/// Whether `key` is always copied from the primary checkpoint.
pub fn is_skipped_key(key: &str) -> bool {
    SKIP_KEYS.contains(&key) || key.contains("model_ema")
}

/// One unit of work: a key and the recipe producing it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Task {
    key: TensorKey,
    root: NodeRef,
}

impl Task {
    /// Create a task.
    pub fn new(key: impl Into<TensorKey>, root: NodeRef) -> Self {
        Self {
            key: key.into(),
            root,
        }
    }

    /// A task copying `key` from `primary`.
    pub fn passthrough(key: &str, primary: &CheckpointId) -> Self {
        Self::new(key, Node::load(key, primary))
    }

    /// Tensor key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Recipe root.
    pub fn root(&self) -> &NodeRef {
        &self.root
    }

    /// Whether the task only copies from `primary`.
    pub fn is_passthrough(&self, primary: &CheckpointId) -> bool {
        matches!(self.root.op(), crate::ops::Op::Load { checkpoint } if checkpoint == primary)
    }
}

/// Fingerprint of a merge: its tasks, in primary key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSignature {
    tasks: Vec<Task>,
}

impl MergeSignature {
    /// Build from tasks.
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    /// The tasks.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Number of tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether there are no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks present in both signatures.
    pub fn intersection<'a>(&'a self, other: &MergeSignature) -> HashSet<&'a Task> {
        let theirs: HashSet<&Task> = other.tasks.iter().collect();
        self.tasks.iter().filter(|t| theirs.contains(t)).collect()
    }
}

/// Output of an earlier successful merge, kept by the host for reuse.
#[derive(Debug, Clone, Default)]
pub struct PriorMerge {
    /// Signature of that merge.
    pub signature: MergeSignature,
    /// Its merged tensors.
    pub tensors: HashMap<String, Tensor>,
}

/// Holder for the most recent [`PriorMerge`].
#[derive(Debug, Default)]
pub struct PriorMergeStore {
    last: Option<PriorMerge>,
}

impl PriorMergeStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `outcome` as the newest merge.
    pub fn record(&mut self, outcome: &MergeOutcome) {
        self.last = Some(PriorMerge {
            signature: outcome.signature.clone(),
            tensors: outcome.tensors.clone(),
        });
    }

    /// The newest merge, if any.
    pub fn get(&self) -> Option<&PriorMerge> {
        self.last.as_ref()
    }

    /// Forget the stored merge.
    pub fn clear(&mut self) {
        self.last = None;
    }
}

/// Counters for one merge.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeStats {
    /// Keys copied from the prior merge.
    pub reused: usize,
    /// Keys evaluated on the worker pool.
    pub evaluated: usize,
    /// Keys whose recipe is a plain copy from the primary checkpoint.
    pub passthrough: usize,
    /// Keys loaded from the primary because a secondary lacked them.
    pub fallbacks: usize,
    /// Result cache counters after the merge.
    pub cache: CacheStats,
    /// Wall time.
    pub elapsed: Duration,
}

/// Result of a successful merge.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// Merged tensors covering exactly the primary key set.
    pub tensors: HashMap<String, Tensor>,
    /// Signature for reuse by the next merge.
    pub signature: MergeSignature,
    /// Counters.
    pub stats: MergeStats,
}

/// Phases of [`Merger::merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    /// Opening checkpoints, resolving weights, building recipes.
    Resolving,
    /// Signature formed.
    Scheduled,
    /// Copying tensors from the prior merge.
    Reusing,
    /// Evaluating remaining tasks.
    Evaluating,
    /// Finished.
    Done,
    /// Aborted with an error.
    Failed,
}

impl fmt::Display for MergeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeState::Resolving => "resolving",
            MergeState::Scheduled => "scheduled",
            MergeState::Reusing => "reusing",
            MergeState::Evaluating => "evaluating",
            MergeState::Done => "done",
            MergeState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-key evaluation result.
struct Evaluated {
    key: TensorKey,
    tensor: Tensor,
    fell_back: bool,
}

/// Runs merges and owns the result cache shared between them.
pub struct Merger {
    config: MergerConfig,
    registry: CalcModeRegistry,
    cache: Arc<ResultCache>,
    executor: Executor,
}

impl Merger {
    /// Create a merger with the built-in calc modes.
    pub fn new(config: MergerConfig) -> Self {
        Self::with_registry(config, CalcModeRegistry::with_builtin())
    }

    /// Create a merger with a custom registry.
    pub fn with_registry(config: MergerConfig, registry: CalcModeRegistry) -> Self {
        let cache = ResultCache::new(config.cache_bytes()).with_target(config.device, config.dtype);
        let executor = Executor::new(config.effective_threads());
        debug!(
            "Merger: {} workers, {} byte cache, {} on {}",
            executor.threads(),
            cache.capacity(),
            config.dtype,
            config.device
        );
        Self {
            config,
            registry,
            cache: Arc::new(cache),
            executor,
        }
    }

    /// Configuration.
    pub fn config(&self) -> &MergerConfig {
        &self.config
    }

    /// Calc mode registry.
    pub fn registry(&self) -> &CalcModeRegistry {
        &self.registry
    }

    /// Shared result cache.
    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Empty the result cache.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Validate `request` and build one task per key of `keys`.
    ///
    /// `keys` is the primary checkpoint's key set in its own order.
    pub fn build_tasks<S: AsRef<str>>(&self, request: &MergeRequest, keys: &[S]) -> Result<Vec<Task>> {
        let mode = self.validated_mode(request)?;
        self.plan(mode, request, &request.checkpoints(), keys)
    }

    /// Run `request` against `store`.
    ///
    /// `prior` is the outcome of an earlier merge; keys whose recipe is
    /// unchanged are copied from it instead of being evaluated. Any failure
    /// other than a key missing from a secondary checkpoint aborts the merge
    /// and clears the result cache.
    pub fn merge(
        &self,
        request: &MergeRequest,
        store: &dyn TensorStore,
        prior: Option<&PriorMerge>,
    ) -> Result<MergeOutcome> {
        let start = Instant::now();
        let mode = self.validated_mode(request)?;
        info!("Starting merge with calc mode: {} - {}", mode.name(), mode.description());

        let result = self.run(mode, request, store, prior, start);
        if let Err(e) = &result {
            warn!("Merge {}: {}", MergeState::Failed, e);
            self.cache.clear();
        }
        result
    }

    fn validated_mode(&self, request: &MergeRequest) -> Result<&dyn CalcMode> {
        let mode = self.registry.get(&request.calc_mode)?;
        request.validate()?;
        let checkpoints = request.checkpoints();
        let required = mode.input_models();
        let present = checkpoints.slots().iter().filter(|c| !c.is_empty()).count();
        let usable = checkpoints.slots()[..required.min(4)]
            .iter()
            .all(|c| !c.is_empty());
        if !usable || present < required {
            return Err(MergeError::NotEnoughModels {
                expected: required,
                actual: present,
            });
        }
        Ok(mode)
    }

    fn plan<S: AsRef<str>>(
        &self,
        mode: &dyn CalcMode,
        request: &MergeRequest,
        checkpoints: &Checkpoints,
        keys: &[S],
    ) -> Result<Vec<Task>> {
        let filter = request.key_filter()?;
        let resolved = resolve(&request.targets, keys)?;
        for weights in resolved.values() {
            mode.validate(weights)?;
        }
        debug!("Resolved weights for {} of {} keys", resolved.len(), keys.len());

        let primary = checkpoints.primary();
        let tasks = keys
            .iter()
            .map(AsRef::as_ref)
            .map(|key| {
                let merged = !is_skipped_key(key) && filter.as_ref().map_or(true, |f| f.allows(key));
                match resolved.get(key) {
                    Some(weights) if merged => {
                        Task::new(key, mode.create_recipe(key, checkpoints, weights))
                    }
                    _ => Task::passthrough(key, primary),
                }
            })
            .collect();
        Ok(tasks)
    }

    fn run(
        &self,
        mode: &dyn CalcMode,
        request: &MergeRequest,
        store: &dyn TensorStore,
        prior: Option<&PriorMerge>,
        start: Instant,
    ) -> Result<MergeOutcome> {
        let checkpoints = request.checkpoints();
        let primary = checkpoints.primary().clone();

        info!("Merge {}", MergeState::Resolving);
        let opened = store.open(&checkpoints.distinct())?;
        let keys = opened.keys(&primary)?;
        info!("Found {} tensors in '{}'", keys.len(), primary);
        let tasks = self.plan(mode, request, &checkpoints, &keys)?;

        let mut stats = MergeStats {
            passthrough: tasks.iter().filter(|t| t.is_passthrough(&primary)).count(),
            ..Default::default()
        };

        info!("Merge {}: {} tasks", MergeState::Scheduled, tasks.len());
        let signature = MergeSignature::new(tasks);

        let mut tensors: HashMap<String, Tensor> = HashMap::with_capacity(keys.len());
        let mut pending: Vec<Task> = Vec::with_capacity(signature.len());
        match prior {
            Some(prior) => {
                let shared = signature.intersection(&prior.signature);
                info!("Merge {}: {} tasks unchanged", MergeState::Reusing, shared.len());
                for task in signature.tasks() {
                    let reusable = shared.contains(task);
                    match prior.tensors.get(task.key()) {
                        Some(tensor) if reusable => {
                            tensors.insert(task.key().to_string(), tensor.clone());
                        }
                        _ => pending.push(task.clone()),
                    }
                }
                stats.reused = tensors.len();
            }
            None => pending.extend(signature.tasks().iter().cloned()),
        }

        info!("Merge {}: {} tasks", MergeState::Evaluating, pending.len());
        stats.evaluated = pending.len();
        let ctx = EvalContext {
            checkpoints: opened.as_ref(),
            cache: Some(self.cache.as_ref()).filter(|c| c.is_enabled()),
            device: self.config.device,
            dtype: self.config.dtype,
        };
        let evaluated = self
            .executor
            .run(pending, |task| evaluate_task(&task, &ctx, &primary))?;
        drop(opened);

        for item in evaluated {
            if item.fell_back {
                stats.fallbacks += 1;
            }
            tensors.insert(item.key.to_string(), item.tensor);
        }

        if tensors.len() != keys.len() || !keys.iter().all(|k| tensors.contains_key(k)) {
            return Err(MergeError::Internal(format!(
                "merged {} tensors for {} primary keys",
                tensors.len(),
                keys.len()
            )));
        }

        stats.cache = self.cache.stats();
        stats.elapsed = start.elapsed();
        info!(
            "Merge {}: {} reused, {} evaluated, {} passthrough, {} fallbacks in {:.2?}",
            MergeState::Done,
            stats.reused,
            stats.evaluated,
            stats.passthrough,
            stats.fallbacks,
            stats.elapsed
        );
        Ok(MergeOutcome {
            tensors,
            signature,
            stats,
        })
    }
}

impl fmt::Debug for Merger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Merger")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .finish()
    }
}

fn evaluate_task(task: &Task, ctx: &EvalContext<'_>, primary: &CheckpointId) -> Result<Evaluated> {
    match evaluate(task.root(), ctx) {
        Ok(tensor) => Ok(Evaluated {
            key: task.key.clone(),
            tensor,
            fell_back: false,
        }),
        Err(e) if e.is_secondary_missing_key(primary.as_str()) => {
            warn!("{}; using '{}' from '{}'", e, task.key(), primary);
            let tensor = evaluate(&Node::load(task.key.clone(), primary), ctx)?;
            Ok(Evaluated {
                key: task.key.clone(),
                tensor,
                fell_back: true,
            })
        }
        Err(e) => Err(e),
    }
}
