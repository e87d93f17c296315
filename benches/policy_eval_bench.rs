// SPDX-License-Identifier: MIT OR Apache-2.0
//! Benchmarks for `PolicyEngine::evaluate()` (§4.8) with varying intent
//! counts and allowlist sizes.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use serde_json::json;

use gate_core::{IntentRecord, NetworkAllowRule, PolicyCaps, PolicyConfig};
use gate_policy::{Context, NetworkRequest, PolicyEngine, Stage};

fn make_policy(allow_rules: usize) -> PolicyConfig {
    let allow = (0..allow_rules)
        .map(|i| NetworkAllowRule {
            domains: Some(vec![format!("api{i}.example.com")]),
            methods: Some(vec!["POST".to_string()]),
            paths: Some(vec!["/v1/*".to_string()]),
        })
        .collect();
    PolicyConfig {
        version: "bench".to_string(),
        allow,
        caps: PolicyCaps { max_amount: Some(1_000.0) },
        require_approval_labels: vec!["external_email".to_string()],
        time_window: None,
    }
}

fn make_intents(n: usize) -> Vec<IntentRecord> {
    (0..n)
        .map(|i| IntentRecord {
            index: i as u64,
            kind: "file.write".to_string(),
            timestamp: None,
            payload: json!({"path": format!("/w/file-{i}.txt"), "content": "x", "amount": 10}),
            metadata: Some(json!({"id": format!("intent-{i}")})),
        })
        .collect()
}

fn make_network(n: usize) -> Vec<NetworkRequest> {
    (0..n)
        .map(|i| NetworkRequest { url: format!("https://api{i}.example.com/v1/resource"), method: "POST".to_string() })
        .collect()
}

fn bench_evaluate_by_intent_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("policy_evaluate_by_intent_count");
    let engine = PolicyEngine::new(make_policy(20));
    let ctx = Context { stage: Stage::Commit, now: chrono::Utc::now() };

    for count in [10, 100, 1_000] {
        let intents = make_intents(count);
        let network = make_network(10);
        group.bench_with_input(BenchmarkId::from_parameter(count), &intents, |b, intents| {
            b.iter(|| engine.evaluate(black_box(&ctx), black_box(intents), black_box(&network)));
        });
    }

    group.finish();
}

fn bench_evaluate_by_allowlist_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("policy_evaluate_by_allowlist_size");
    let intents = make_intents(50);
    let network = make_network(50);
    let ctx = Context { stage: Stage::Commit, now: chrono::Utc::now() };

    for rules in [10, 100, 500] {
        let engine = PolicyEngine::new(make_policy(rules));
        group.bench_with_input(BenchmarkId::from_parameter(rules), &engine, |b, engine| {
            b.iter(|| engine.evaluate(black_box(&ctx), black_box(&intents), black_box(&network)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_evaluate_by_intent_count, bench_evaluate_by_allowlist_size);
criterion_main!(benches);
