//! End-to-end merges over in-memory and on-disk checkpoints.

use std::collections::HashMap;

use kitbash_merge::{
    save_safetensors, Dtype, MemoryStore, MergeError, MergeRequest, Merger, MergerConfig,
    PriorMergeStore, SafetensorsStore, Target, Tensor, WeightSet,
};

fn t(shape: &[usize], data: Vec<f32>) -> Tensor {
    Tensor::from_vec(shape, data, Dtype::F32).unwrap()
}

fn weights(alpha: f32) -> WeightSet {
    WeightSet {
        alpha: Some(alpha),
        ..Default::default()
    }
}

fn merger() -> Merger {
    Merger::new(MergerConfig {
        threads: 2,
        dtype: Dtype::F32,
        ..Default::default()
    })
}

fn two_models() -> MemoryStore {
    MemoryStore::new()
        .with_tensor("a", "model.w1", t(&[2], vec![1.0, 2.0]))
        .with_tensor("a", "model.w2", t(&[2], vec![0.0, 0.0]))
        .with_tensor("a", "model.w3", t(&[1], vec![10.0]))
        .with_tensor("b", "model.w1", t(&[2], vec![3.0, 4.0]))
        .with_tensor("b", "model.w2", t(&[2], vec![4.0, 4.0]))
        .with_tensor("b", "model.w3", t(&[1], vec![14.0]))
}

fn values(outcome: &kitbash_merge::MergeOutcome, key: &str) -> Vec<f32> {
    outcome.tensors[key].to_vec_f32()
}

#[test]
fn test_weight_sum_blend() {
    let request = MergeRequest::new("Weight-Sum", ["a", "b"]).with_target(Target::new("*", weights(0.25)));
    let outcome = merger().merge(&request, &two_models(), None).unwrap();

    assert_eq!(outcome.tensors.len(), 3);
    assert_eq!(values(&outcome, "model.w1"), vec![1.5, 2.5]);
    assert_eq!(values(&outcome, "model.w2"), vec![1.0, 1.0]);
    assert_eq!(values(&outcome, "model.w3"), vec![11.0]);
    assert_eq!(outcome.stats.evaluated, 3);
    assert_eq!(outcome.stats.reused, 0);
}

#[test]
fn test_outputs_use_working_dtype() {
    let request = MergeRequest::new("Weight-Sum", ["a", "b"]).with_target(Target::new("*", weights(0.25)));
    let outcome = Merger::new(MergerConfig::default())
        .merge(&request, &two_models(), None)
        .unwrap();

    assert!(outcome.tensors.values().all(|t| t.dtype() == Dtype::F16));
    assert_eq!(values(&outcome, "model.w1"), vec![1.5, 2.5]);
}

#[test]
fn test_narrowest_target_wins() {
    let request = MergeRequest::new("Weight-Sum", ["a", "b"])
        .with_target(Target::new("model.w1", weights(1.0)))
        .with_target(Target::new("model.*", weights(0.0)));
    let outcome = merger().merge(&request, &two_models(), None).unwrap();

    assert_eq!(values(&outcome, "model.w1"), vec![3.0, 4.0]);
    assert_eq!(values(&outcome, "model.w2"), vec![0.0, 0.0]);
}

#[test]
fn test_missing_secondary_key_falls_back_to_primary() {
    let store = two_models().with_tensor("a", "only_in_a", t(&[1], vec![7.0]));
    let request = MergeRequest::new("Weight-Sum", ["a", "b"]).with_target(Target::new("*", weights(0.5)));
    let outcome = merger().merge(&request, &store, None).unwrap();

    assert_eq!(outcome.tensors.len(), 4);
    assert_eq!(values(&outcome, "only_in_a"), vec![7.0]);
    assert_eq!(outcome.stats.fallbacks, 1);
}

#[test]
fn test_output_keys_follow_primary() {
    let store = two_models().with_tensor("b", "only_in_b", t(&[1], vec![1.0]));
    let request = MergeRequest::new("Weight-Sum", ["a", "b"]).with_target(Target::new("*", weights(0.5)));
    let outcome = merger().merge(&request, &store, None).unwrap();

    assert!(!outcome.tensors.contains_key("only_in_b"));
    assert_eq!(outcome.tensors.len(), 3);
}

#[test]
fn test_prior_merge_reuse() {
    let merger = merger();
    let store = two_models();
    let mut prior = PriorMergeStore::new();

    let request = MergeRequest::new("Weight-Sum", ["a", "b"]).with_target(Target::new("*", weights(0.25)));
    let first = merger.merge(&request, &store, prior.get()).unwrap();
    prior.record(&first);

    let second = merger.merge(&request, &store, prior.get()).unwrap();
    assert_eq!(second.stats.reused, 3);
    assert_eq!(second.stats.evaluated, 0);
    assert_eq!(values(&second, "model.w1"), vec![1.5, 2.5]);
    prior.record(&second);

    let changed = request.with_target(Target::new("model.w1", weights(0.5)));
    let third = merger.merge(&changed, &store, prior.get()).unwrap();
    assert_eq!(third.stats.reused, 2);
    assert_eq!(third.stats.evaluated, 1);
    assert_eq!(values(&third, "model.w1"), vec![2.0, 3.0]);
}

#[test]
fn test_failure_clears_cache() {
    let merger = merger();
    let store = two_models()
        .with_tensor("c", "model.w1", t(&[2], vec![1.0, 1.0]))
        .with_tensor("c", "model.w2", t(&[2], vec![1.0, 1.0]))
        .with_tensor("c", "model.w3", t(&[1], vec![1.0]));

    let request =
        MergeRequest::new("Add Difference", ["a", "b", "c"]).with_target(Target::new("*", weights(1.0)));
    let outcome = merger.merge(&request, &store, None).unwrap();
    assert_eq!(values(&outcome, "model.w1"), vec![3.0, 5.0]);
    assert!(!merger.cache().is_empty());

    let broken = store.with_tensor("c", "model.w1", t(&[3], vec![1.0, 1.0, 1.0]));
    let request =
        MergeRequest::new("Train Difference", ["a", "b", "c"]).with_target(Target::new("*", weights(1.0)));
    let err = merger.merge(&request, &broken, None).unwrap_err();
    assert!(matches!(err, MergeError::ShapeMismatch { .. }));
    assert!(merger.cache().is_empty());
}

#[test]
fn test_cache_serves_repeated_subexpressions() {
    let merger = merger();
    let store = two_models()
        .with_tensor("c", "model.w1", t(&[2], vec![1.0, 1.0]))
        .with_tensor("c", "model.w2", t(&[2], vec![1.0, 1.0]))
        .with_tensor("c", "model.w3", t(&[1], vec![1.0]));

    let first = MergeRequest::new("Add Difference", ["a", "b", "c"]).with_target(Target::new("*", weights(1.0)));
    merger.merge(&first, &store, None).unwrap();

    let second = MergeRequest::new("Add Difference", ["a", "b", "c"]).with_target(Target::new("*", weights(0.5)));
    let outcome = merger.merge(&second, &store, None).unwrap();
    assert!(outcome.stats.cache.hits >= 3);
    assert_eq!(values(&outcome, "model.w1"), vec![2.0, 3.5]);
}

#[test]
fn test_seeded_dare_is_reproducible() {
    let store = MemoryStore::new()
        .with_tensor("a", "w", t(&[64], vec![0.0; 64]))
        .with_tensor("b", "w", t(&[64], (0..64).map(|i| i as f32).collect()));
    let request = MergeRequest::new("Power-up (DARE)", ["a", "b"]).with_target(Target::new(
        "*",
        WeightSet {
            alpha: Some(0.5),
            beta: Some(1.0),
            seed: Some(7),
            ..Default::default()
        },
    ));

    let first = merger().merge(&request, &store, None).unwrap();
    let second = merger().merge(&request, &store, None).unwrap();
    assert_eq!(values(&first, "w"), values(&second, "w"));
    assert!(values(&first, "w").iter().all(|v| *v == 0.0 || v.fract() == 0.0));
}

#[test]
fn test_filter_and_skip_keys_pass_through() {
    let store = two_models()
        .with_tensor("a", "betas", t(&[1], vec![0.1]))
        .with_tensor("b", "betas", t(&[1], vec![0.9]));
    let request = MergeRequest::new("Weight-Sum", ["a", "b"])
        .with_target(Target::new("*", weights(0.5)))
        .with_filter(["include", "model.w1"]);
    let outcome = merger().merge(&request, &store, None).unwrap();

    assert_eq!(values(&outcome, "model.w1"), vec![2.0, 3.0]);
    assert_eq!(values(&outcome, "model.w2"), vec![0.0, 0.0]);
    assert_eq!(values(&outcome, "betas"), vec![0.1]);
    assert_eq!(outcome.stats.passthrough, 3);
}

#[test]
fn test_request_errors() {
    let m = merger();
    let err = m
        .merge(&MergeRequest::new("Nope", ["a", "b"]), &two_models(), None)
        .unwrap_err();
    assert!(matches!(err, MergeError::UnknownCalcMode(_)));

    let err = m
        .merge(&MergeRequest::new("Extract", ["a", "b"]), &two_models(), None)
        .unwrap_err();
    assert!(matches!(err, MergeError::NotEnoughModels { .. }));

    let err = m
        .merge(&MergeRequest::new("Weight-Sum", ["a", "missing"]), &two_models(), None)
        .unwrap_err();
    assert!(matches!(err, MergeError::CheckpointNotFound(_)));
}

#[test]
fn test_merge_from_safetensors() {
    let dir = tempfile::tempdir().unwrap();
    let order = vec!["w".to_string()];
    let a: HashMap<String, Tensor> = [("w".to_string(), t(&[2], vec![1.0, 2.0]))].into();
    let b: HashMap<String, Tensor> = [("w".to_string(), t(&[2], vec![3.0, 4.0]))].into();
    save_safetensors(dir.path().join("a.safetensors"), &order, &a).unwrap();
    save_safetensors(dir.path().join("b.safetensors"), &order, &b).unwrap();

    let store = SafetensorsStore::new(dir.path());
    let request = MergeRequest::new("Weight-Sum", ["a", "b"]).with_target(Target::new("*", weights(0.25)));
    let outcome = merger().merge(&request, &store, None).unwrap();
    assert_eq!(values(&outcome, "w"), vec![1.5, 2.5]);

    let out = dir.path().join("merged.safetensors");
    save_safetensors(&out, &order, &outcome.tensors).unwrap();
    assert!(out.is_file());
}
