// SPDX-License-Identifier: MIT OR Apache-2.0
//! gate-orchestrator
#![deny(unsafe_code)]
//!
//! The bundle lifecycle state machine (§4.10): Ingest, Plan, Approve, Commit,
//! and Revert. Wires together the Trace Bundle Engine, the Policy Engine, the
//! Intent Journal, and the Gate Store into the single entry point the daemon
//! and CLI both call through.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Cursor;
use std::sync::Arc;

use gate_core::{ApprovalRecord, BundleId, BundleState, IntentRecord, ReceiptRecord};
use gate_driver_core::{DriverRegistry, Receipt};
use gate_error::{ErrorCode, GateError};
use gate_journal::{ClockFn, Journal};
use gate_policy::{Context, Evaluation, NetworkRequest, PolicyEngine, Stage};
use gate_rollback_registry::{RequestCtx, RollbackRegistry};
use gate_store::{BundleSummary, GateStore};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

/// An intent as surfaced by Plan: its stable ID, driver type, the labels
/// (declared plus inferred) that drove policy evaluation, and — for
/// `http.post` intents — a summary of whether a rollback rule governs it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlannedIntent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_summary: Option<RollbackSummary>,
}

/// §8 S2: whether an `http.post` intent's commit-time request matches a
/// [`gate_rollback_registry`] rule, and if so, how that rule would reverse
/// it. Computed from the rule alone (no network call), so it is available
/// at Plan time, before the intent has ever been committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RollbackSummary {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_id: Option<bool>,
}

/// The result of a Plan call: every intent annotated, plus the policy read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanResult {
    pub bundle_id: BundleId,
    pub intents: Vec<PlannedIntent>,
    pub evaluation: Evaluation,
}

/// The receipts produced by a successful Commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommitOutcome {
    pub bundle_id: BundleId,
    pub receipts: Vec<ReceiptRecord>,
}

/// Commit failed partway through: carries the error plus every receipt
/// already durably recorded (§4.10 — previously committed intents remain).
#[derive(Debug)]
pub struct CommitError {
    pub error: GateError,
    pub partial_receipts: Vec<ReceiptRecord>,
}

impl std::fmt::Display for CommitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "commit failed after {} receipt(s): {}", self.partial_receipts.len(), self.error)
    }
}

impl std::error::Error for CommitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// The outcome of reverting a single previously-committed intent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RevertOutcome {
    pub intent_id: String,
    pub ok: bool,
    pub error: Option<String>,
}

/// The combined state of a bundle, as derived from its approval and receipt
/// rows, for callers that just want a status without re-running Plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BundleStatus {
    pub id: BundleId,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub state: BundleState,
    pub approval: Option<ApprovalRecord>,
}

/// Drives every bundle through Ingest → Plan → Approve → Commit → Revert,
/// holding one process-wide [`Journal`], [`GateStore`], [`DriverRegistry`],
/// and [`PolicyEngine`]. Cheap to clone: everything it owns is already
/// cheaply cloneable or wrapped in `Arc`.
#[derive(Clone)]
pub struct Orchestrator {
    journal: Arc<Journal>,
    store: GateStore,
    registry: Arc<DriverRegistry>,
    policy: Arc<PolicyEngine>,
    rollback_registry: Arc<RollbackRegistry>,
    clock: ClockFn,
    locks: Arc<Mutex<HashMap<BundleId, Arc<Mutex<()>>>>>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        journal: Arc<Journal>,
        store: GateStore,
        registry: Arc<DriverRegistry>,
        policy: Arc<PolicyEngine>,
        rollback_registry: Arc<RollbackRegistry>,
        clock: ClockFn,
    ) -> Self {
        Self {
            journal,
            store,
            registry,
            policy,
            rollback_registry,
            clock,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn lock_for(&self, bundle_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(bundle_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// §4.10 Ingest: validate and store a bundle, rejecting duplicate intent
    /// IDs up front so Plan/Commit never have to notice the collision later.
    pub async fn ingest(&self, bundle_bytes: Vec<u8>) -> Result<BundleId, GateError> {
        let bundle = gate_bundle::open_reader(Cursor::new(bundle_bytes.as_slice()))?;
        let intents = bundle.intents()?;

        let mut seen = HashSet::new();
        for intent in &intents {
            let id = intent.stable_id();
            if !seen.insert(id.clone()) {
                return Err(GateError::duplicate_intent_id(id));
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = (self.clock)();
        self.store.persist_bundle(&id, &bundle_bytes, bundle.manifest.metadata.clone(), now).await?;
        tracing::info!(bundle_id = %id, intent_count = intents.len(), "ingested bundle");
        Ok(id)
    }

    /// Every persisted bundle, most recently ingested first.
    pub async fn list_bundles(&self) -> Result<Vec<BundleSummary>, GateError> {
        self.store.list_bundles().await
    }

    async fn load_bundle(&self, bundle_id: &str) -> Result<gate_bundle::Bundle, GateError> {
        let bytes = self
            .store
            .get_bundle(&bundle_id.to_string())
            .await?
            .ok_or_else(|| bundle_not_found(bundle_id))?;
        gate_bundle::open_reader(Cursor::new(bytes))
    }

    /// The bundle's derived lifecycle state plus its current approval, if any.
    pub async fn status(&self, bundle_id: &str) -> Result<BundleStatus, GateError> {
        let summaries = self.store.list_bundles().await?;
        let summary = summaries
            .into_iter()
            .find(|s| s.id == bundle_id)
            .ok_or_else(|| bundle_not_found(bundle_id))?;
        let approval = self.store.get_approval(&bundle_id.to_string()).await?;
        let receipts = self.store.list_receipts(&bundle_id.to_string()).await?;
        Ok(BundleStatus {
            id: bundle_id.to_string(),
            created_at: summary.created_at,
            state: BundleState::derive(approval.is_some(), !receipts.is_empty()),
            approval,
        })
    }

    /// §4.10 Plan: a read-only, side-effect-free policy evaluation against
    /// the bundle's intents and network log, with stable IDs and inferred
    /// labels attached so callers can match evaluation entries to intents.
    pub async fn plan(&self, bundle_id: &str) -> Result<PlanResult, GateError> {
        let lock = self.lock_for(bundle_id).await;
        let _guard = lock.lock().await;

        let bundle = self.load_bundle(bundle_id).await?;
        let intents = bundle.intents()?;
        let network = extract_network_requests(&bundle.network_har().unwrap_or(serde_json::Value::Null));

        let labeled = apply_default_labels(&intents);
        let ctx = Context { stage: Stage::Plan, now: (self.clock)() };
        let evaluation = self.policy.evaluate(&ctx, &labeled, &network);
        let planned = labeled.iter().map(|intent| plan_intent(intent, &self.rollback_registry)).collect();

        Ok(PlanResult { bundle_id: bundle_id.to_string(), intents: planned, evaluation })
    }

    /// §4.10 Approve: record that `actor` has signed off on the bundle under
    /// the orchestrator's currently loaded policy version. Does not itself
    /// check whether approval was actually required.
    pub async fn approve(&self, bundle_id: &str, actor: String) -> Result<ApprovalRecord, GateError> {
        let lock = self.lock_for(bundle_id).await;
        let _guard = lock.lock().await;

        if self.store.get_bundle(&bundle_id.to_string()).await?.is_none() {
            return Err(bundle_not_found(bundle_id));
        }

        let record = ApprovalRecord {
            bundle_id: bundle_id.to_string(),
            actor,
            policy_version: self.policy.config().version.clone(),
            approved_at: (self.clock)(),
        };
        self.store.record_approval(&record).await?;
        Ok(record)
    }

    /// §4.10 Commit: re-evaluate policy, require a current-version approval
    /// if one is needed, then drive each intent through the journal in
    /// bundle order. Aborts on the first failure and returns every receipt
    /// already durably recorded alongside the error; already-committed
    /// intents are never retried or undone.
    pub async fn commit(&self, bundle_id: &str) -> Result<CommitOutcome, CommitError> {
        let lock = self.lock_for(bundle_id).await;
        let _guard = lock.lock().await;

        macro_rules! try_or_abort {
            ($result:expr, $receipts:expr) => {
                match $result {
                    Ok(value) => value,
                    Err(error) => return Err(CommitError { error: error.into(), partial_receipts: $receipts }),
                }
            };
        }

        let existing = try_or_abort!(self.store.list_receipts(&bundle_id.to_string()).await, Vec::new());
        if !existing.is_empty() {
            let error = GateError::new(ErrorCode::CommitFailed, "bundle already committed")
                .with_context("kind", "AlreadyCommitted")
                .with_context("bundleId", bundle_id);
            return Err(CommitError { error, partial_receipts: Vec::new() });
        }

        let bundle = try_or_abort!(self.load_bundle(bundle_id).await, Vec::new());
        let intents = try_or_abort!(bundle.intents(), Vec::new());
        let network = extract_network_requests(&bundle.network_har().unwrap_or(serde_json::Value::Null));

        let labeled = apply_default_labels(&intents);
        let ctx = Context { stage: Stage::Commit, now: (self.clock)() };
        let evaluation = self.policy.evaluate(&ctx, &labeled, &network);
        if !evaluation.bundle.allowed {
            let error = GateError::policy_denied(evaluation.bundle.reasons);
            return Err(CommitError { error, partial_receipts: Vec::new() });
        }

        if evaluation.bundle.requires_approval {
            let approval = try_or_abort!(self.store.get_approval(&bundle_id.to_string()).await, Vec::new());
            let current_version = &self.policy.config().version;
            let approved = matches!(&approval, Some(a) if &a.policy_version == current_version);
            if !approved {
                return Err(CommitError { error: GateError::approval_required(), partial_receipts: Vec::new() });
            }
        }

        let mut receipts = Vec::new();
        for intent in &intents {
            let intent_id = intent.stable_id();
            let driver = try_or_abort!(self.registry.resolve(&intent.kind), receipts.clone());
            let idempotency_key = format!("{bundle_id}:{intent_id}");

            let entry = try_or_abort!(
                self.journal
                    .append(&intent.kind, &idempotency_key, intent.payload.clone(), intent.metadata.clone(), driver.as_ref())
                    .await,
                receipts.clone()
            );

            let record = ReceiptRecord {
                bundle_id: bundle_id.to_string(),
                intent_id,
                intent_type: intent.kind.clone(),
                receipt: entry.receipt.clone().unwrap_or(serde_json::Value::Null),
                recorded_at: (self.clock)(),
            };
            try_or_abort!(self.store.save_receipt(&record).await, receipts.clone());
            receipts.push(record);
        }

        Ok(CommitOutcome { bundle_id: bundle_id.to_string(), receipts })
    }

    /// §4.10 Revert: best-effort compensation of every already-committed
    /// intent, via `Driver::revert` using only the persisted receipt. A
    /// failure to revert one intent does not stop the others.
    pub async fn revert(&self, bundle_id: &str) -> Result<Vec<RevertOutcome>, GateError> {
        let lock = self.lock_for(bundle_id).await;
        let _guard = lock.lock().await;

        let bundle = self.load_bundle(bundle_id).await?;
        let receipts = self.store.list_receipts(&bundle_id.to_string()).await?;
        if receipts.is_empty() {
            return Err(GateError::new(ErrorCode::CommitFailed, "bundle has no receipts to revert")
                .with_context("kind", "NothingToRevert")
                .with_context("bundleId", bundle_id));
        }

        let intents = bundle.intents()?;
        let by_id: HashMap<String, &IntentRecord> =
            intents.iter().map(|intent| (intent.stable_id(), intent)).collect();

        let mut outcomes = Vec::with_capacity(receipts.len());
        for receipt in &receipts {
            let Some(intent) = by_id.get(receipt.intent_id.as_str()) else {
                outcomes.push(RevertOutcome {
                    intent_id: receipt.intent_id.clone(),
                    ok: false,
                    error: Some("intent not found in bundle".to_string()),
                });
                continue;
            };

            let driver = match self.registry.resolve(&intent.kind) {
                Ok(d) => d,
                Err(e) => {
                    outcomes.push(RevertOutcome {
                        intent_id: receipt.intent_id.clone(),
                        ok: false,
                        error: Some(e.message().to_string()),
                    });
                    continue;
                }
            };

            let idempotency_key = format!("{bundle_id}:{}", receipt.intent_id);
            let gate_receipt = Receipt::new(receipt.receipt.clone());
            match driver.revert(&idempotency_key, &intent.payload, &gate_receipt).await {
                Ok(()) => outcomes.push(RevertOutcome { intent_id: receipt.intent_id.clone(), ok: true, error: None }),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        bundle_id,
                        intent_id = %receipt.intent_id,
                        "revert failed for intent"
                    );
                    outcomes.push(RevertOutcome {
                        intent_id: receipt.intent_id.clone(),
                        ok: false,
                        error: Some(e.message().to_string()),
                    });
                }
            }
        }

        Ok(outcomes)
    }
}

fn bundle_not_found(bundle_id: &str) -> GateError {
    GateError::bundle_invalid("bundle not found")
        .with_context("kind", "BundleNotFound")
        .with_context("bundleId", bundle_id)
}

/// The default label a driver type implies even when the intent declares no
/// labels of its own, so a bare `email.send`/`http.post`/`llm.call` intent
/// still surfaces in policy evaluation as reaching outside the sandbox (§4.10
/// names `email.send ⇒ external_email` as its example).
fn default_label_for(kind: &str) -> Option<&'static str> {
    match kind {
        "email.send" => Some("external_email"),
        "http.post" => Some("external_http"),
        "llm.call" => Some("external_llm"),
        _ => None,
    }
}

/// Apply each intent's type-default label (if any, and not already present)
/// *before* policy evaluation, per §4.10 — the default must participate in
/// the `requireApprovalLabels` check, not just in Plan's display output.
/// Returns clones with the default folded into `metadata.labels`; the
/// intents used to drive drivers/journal entries are never touched.
fn apply_default_labels(intents: &[IntentRecord]) -> Vec<IntentRecord> {
    intents.iter().map(with_default_label).collect()
}

fn with_default_label(intent: &IntentRecord) -> IntentRecord {
    let Some(default) = default_label_for(&intent.kind) else {
        return intent.clone();
    };
    let mut labels = intent.labels();
    if labels.iter().any(|l| l == default) {
        return intent.clone();
    }
    labels.push(default.to_string());

    let mut metadata = intent.metadata.as_ref().and_then(serde_json::Value::as_object).cloned().unwrap_or_default();
    metadata.insert("labels".to_string(), serde_json::json!(labels));

    let mut augmented = intent.clone();
    augmented.metadata = Some(serde_json::Value::Object(metadata));
    augmented
}

fn plan_intent(intent: &IntentRecord, registry: &RollbackRegistry) -> PlannedIntent {
    PlannedIntent {
        id: intent.stable_id(),
        kind: intent.kind.clone(),
        labels: intent.labels(),
        rollback_summary: rollback_summary_for(intent, registry),
    }
}

/// §8 S2: for an `http.post` intent, match its commit-time request (host,
/// method, path, headers, body — all derivable from the payload alone,
/// no network I/O) against the rollback registry and summarize the result.
/// `None` for every other intent kind; `Some(RollbackSummary{available:
/// false, ..})` for an `http.post` intent with no matching rule.
fn rollback_summary_for(intent: &IntentRecord, registry: &RollbackRegistry) -> Option<RollbackSummary> {
    if intent.kind != "http.post" {
        return None;
    }

    let url = intent.payload.get("url").and_then(serde_json::Value::as_str).unwrap_or_default();
    let host = url_host(url);
    let path = url_path(url);
    let headers: BTreeMap<String, String> = intent
        .payload
        .get("headers")
        .and_then(serde_json::Value::as_object)
        .map(|obj| obj.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default();
    let body = intent.payload.get("body");

    let ctx = RequestCtx { host: &host, method: "POST", path: &path, headers, body };

    Some(match registry.find_rule(&ctx) {
        Some(rule) => RollbackSummary {
            available: true,
            rule: Some(rule.name.clone()),
            method: Some(rule.rollback.method.clone()),
            path_template: Some(rule.rollback.path_template.clone()),
            requires_id: Some(rule.rollback.path_template.contains("{id}")),
        },
        None => RollbackSummary { available: false, rule: None, method: None, path_template: None, requires_id: None },
    })
}

fn url_host(url: &str) -> String {
    reqwest::Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string)).unwrap_or_default()
}

fn url_path(url: &str) -> String {
    reqwest::Url::parse(url).ok().map(|u| u.path().to_string()).unwrap_or_default()
}

/// Best-effort extraction of `{method, url}` pairs from a HAR document's
/// `log.entries[].request`. Malformed or absent HAR input yields no
/// requests rather than an error — the network log is an observed artifact,
/// not something Plan/Commit can reject a bundle over.
fn extract_network_requests(har: &serde_json::Value) -> Vec<NetworkRequest> {
    har.get("log")
        .and_then(|log| log.get("entries"))
        .and_then(serde_json::Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let request = entry.get("request")?;
                    let url = request.get("url")?.as_str()?.to_string();
                    let method = request.get("method").and_then(serde_json::Value::as_str).unwrap_or("GET").to_string();
                    Some(NetworkRequest { url, method })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gate_core::{HttpRollbackRule, PolicyCaps, PolicyConfig, RollbackAction, RollbackCommitMatch};
    use serde_json::json;
    use std::sync::Arc as StdArc;

    fn fixed_clock() -> ClockFn {
        StdArc::new(|| chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&chrono::Utc))
    }

    fn base_policy() -> PolicyConfig {
        PolicyConfig {
            version: "v1".to_string(),
            allow: Vec::new(),
            caps: PolicyCaps::default(),
            require_approval_labels: Vec::new(),
            time_window: None,
        }
    }

    async fn build_orchestrator(policy: PolicyConfig) -> (Orchestrator, tempfile::TempDir) {
        build_orchestrator_with_registry(policy, RollbackRegistry::empty()).await
    }

    async fn build_orchestrator_with_registry(
        policy: PolicyConfig,
        rollback_registry: RollbackRegistry,
    ) -> (Orchestrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = GateStore::open(&dir.path().join("gate.sqlite"), dir.path().join("bundles")).await.unwrap();
        let journal = Journal::open(&dir.path().join("journal.jsonl"), fixed_clock()).unwrap();

        let mut registry = DriverRegistry::new();
        registry.register(StdArc::new(gate_driver_file::FileWriteDriver));
        registry.register(StdArc::new(gate_driver_http::HttpPostDriver::with_registry(rollback_registry.clone())));

        let orchestrator = Orchestrator::new(
            StdArc::new(journal),
            store,
            StdArc::new(registry),
            StdArc::new(PolicyEngine::new(policy)),
            StdArc::new(rollback_registry),
            fixed_clock(),
        );
        (orchestrator, dir)
    }

    fn bundle_bytes(intents: Vec<IntentRecord>) -> Vec<u8> {
        let input = gate_bundle::BundleInput { intents, ..Default::default() };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.tgz");
        gate_bundle::create(&path, input).unwrap();
        std::fs::read(&path).unwrap()
    }

    fn file_write_intent(index: u64, path: &std::path::Path) -> IntentRecord {
        IntentRecord {
            index,
            kind: "file.write".to_string(),
            timestamp: None,
            payload: json!({"path": path.to_string_lossy(), "content": "hello"}),
            metadata: Some(json!({"id": format!("intent-{index}")})),
        }
    }

    fn http_post_intent(index: u64, url: &str) -> IntentRecord {
        IntentRecord {
            index,
            kind: "http.post".to_string(),
            timestamp: None,
            payload: json!({"url": url, "body": {"kind": "message"}}),
            metadata: Some(json!({"id": format!("intent-{index}")})),
        }
    }

    fn message_create_rule(host: &str) -> HttpRollbackRule {
        HttpRollbackRule {
            name: "message-create".to_string(),
            host_pattern: host.to_string(),
            commit: RollbackCommitMatch {
                method: "POST".to_string(),
                path_pattern: "/messages".to_string(),
                id_from: vec![gate_core::IdFromRule("json:$.messageId".to_string())],
            },
            rollback: RollbackAction {
                method: "DELETE".to_string(),
                path_template: "/messages/{id}".to_string(),
                headers: None,
            },
            matchers: None,
        }
    }

    #[tokio::test]
    async fn ingest_then_list_round_trips_a_bundle() {
        let (orchestrator, dir) = build_orchestrator(base_policy()).await;
        let id = orchestrator
            .ingest(bundle_bytes(vec![file_write_intent(0, &dir.path().join("a.txt"))]))
            .await
            .unwrap();
        let bundles = orchestrator.list_bundles().await.unwrap();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].id, id);
    }

    #[tokio::test]
    async fn ingest_rejects_duplicate_intent_ids() {
        let (orchestrator, dir) = build_orchestrator(base_policy()).await;
        let mut dup = file_write_intent(1, &dir.path().join("b.txt"));
        dup.metadata = file_write_intent(0, &dir.path().join("a.txt")).metadata;
        let err = orchestrator
            .ingest(bundle_bytes(vec![file_write_intent(0, &dir.path().join("a.txt")), dup]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), gate_error::ErrorCode::DuplicateIntentId);
    }

    #[tokio::test]
    async fn plan_reports_allowed_bundle_with_no_policy_restrictions() {
        let (orchestrator, dir) = build_orchestrator(base_policy()).await;
        let id = orchestrator
            .ingest(bundle_bytes(vec![file_write_intent(0, &dir.path().join("a.txt"))]))
            .await
            .unwrap();
        let plan = orchestrator.plan(&id).await.unwrap();
        assert!(plan.evaluation.bundle.allowed);
        assert!(!plan.evaluation.bundle.requires_approval);
        assert_eq!(plan.intents.len(), 1);
    }

    #[tokio::test]
    async fn commit_without_required_approval_succeeds_when_not_required() {
        let (orchestrator, dir) = build_orchestrator(base_policy()).await;
        let id = orchestrator
            .ingest(bundle_bytes(vec![file_write_intent(0, &dir.path().join("a.txt"))]))
            .await
            .unwrap();
        let outcome = orchestrator.commit(&id).await.unwrap();
        assert_eq!(outcome.receipts.len(), 1);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "hello");
    }

    #[tokio::test]
    async fn commit_requires_approval_when_label_demands_it() {
        let mut policy = base_policy();
        policy.require_approval_labels = vec!["external_fs".to_string()];
        let (orchestrator, dir) = build_orchestrator(policy).await;

        let mut intent = file_write_intent(0, &dir.path().join("a.txt"));
        intent.payload["labels"] = json!(["external_fs"]);
        let id = orchestrator.ingest(bundle_bytes(vec![intent])).await.unwrap();

        let err = orchestrator.commit(&id).await.unwrap_err();
        assert_eq!(err.error.code(), gate_error::ErrorCode::ApprovalRequired);
        assert!(err.partial_receipts.is_empty());

        orchestrator.approve(&id, "alice".to_string()).await.unwrap();
        let outcome = orchestrator.commit(&id).await.unwrap();
        assert_eq!(outcome.receipts.len(), 1);
    }

    #[tokio::test]
    async fn commit_twice_is_rejected_as_already_committed() {
        let (orchestrator, dir) = build_orchestrator(base_policy()).await;
        let id = orchestrator
            .ingest(bundle_bytes(vec![file_write_intent(0, &dir.path().join("a.txt"))]))
            .await
            .unwrap();
        orchestrator.commit(&id).await.unwrap();
        let err = orchestrator.commit(&id).await.unwrap_err();
        assert_eq!(err.error.code(), gate_error::ErrorCode::CommitFailed);
    }

    #[tokio::test]
    async fn status_reflects_approval_and_commit_transitions() {
        let (orchestrator, dir) = build_orchestrator(base_policy()).await;
        let id = orchestrator
            .ingest(bundle_bytes(vec![file_write_intent(0, &dir.path().join("a.txt"))]))
            .await
            .unwrap();
        assert_eq!(orchestrator.status(&id).await.unwrap().state, BundleState::Pending);

        orchestrator.approve(&id, "alice".to_string()).await.unwrap();
        assert_eq!(orchestrator.status(&id).await.unwrap().state, BundleState::Approved);

        orchestrator.commit(&id).await.unwrap();
        assert_eq!(orchestrator.status(&id).await.unwrap().state, BundleState::Committed);
    }

    #[tokio::test]
    async fn plan_and_commit_on_unknown_bundle_is_bundle_not_found() {
        let (orchestrator, _dir) = build_orchestrator(base_policy()).await;
        let err = orchestrator.plan("missing").await.unwrap_err();
        assert_eq!(err.code(), gate_error::ErrorCode::BundleInvalid);
    }

    #[tokio::test]
    async fn revert_runs_best_effort_over_every_receipt() {
        let (orchestrator, dir) = build_orchestrator(base_policy()).await;
        let id = orchestrator
            .ingest(bundle_bytes(vec![
                file_write_intent(0, &dir.path().join("a.txt")),
                file_write_intent(1, &dir.path().join("b.txt")),
            ]))
            .await
            .unwrap();
        orchestrator.commit(&id).await.unwrap();

        let outcomes = orchestrator.revert(&id).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.ok));
    }

    #[tokio::test]
    async fn email_send_defaults_to_external_email_label_for_policy_purposes() {
        let mut policy = base_policy();
        policy.require_approval_labels = vec!["external_email".to_string()];
        let (orchestrator, _dir) = build_orchestrator(policy).await;

        let intent = IntentRecord {
            index: 0,
            kind: "email.send".to_string(),
            timestamp: None,
            payload: json!({"to": "someone@example.com"}),
            metadata: Some(json!({"id": "intent-0"})),
        };
        let id = orchestrator.ingest(bundle_bytes(vec![intent])).await.unwrap();

        let plan = orchestrator.plan(&id).await.unwrap();
        assert!(plan.evaluation.bundle.requires_approval);
        assert!(plan.intents[0].labels.iter().any(|l| l == "external_email"));

        let err = orchestrator.commit(&id).await.unwrap_err();
        assert_eq!(err.error.code(), gate_error::ErrorCode::ApprovalRequired);
    }

    #[tokio::test]
    async fn plan_surfaces_rollback_summary_for_a_registry_matched_http_post_intent() {
        let server = wiremock::MockServer::start().await;
        let host = url_host(&server.uri());
        let registry = RollbackRegistry::from_rules(vec![message_create_rule(&host)]);
        let (orchestrator, _dir) = build_orchestrator_with_registry(base_policy(), registry).await;

        let url = format!("{}/messages", server.uri());
        let id = orchestrator.ingest(bundle_bytes(vec![http_post_intent(0, &url)])).await.unwrap();

        let plan = orchestrator.plan(&id).await.unwrap();
        let summary = plan.intents[0].rollback_summary.clone().expect("rollback summary present");
        assert!(summary.available);
        assert_eq!(summary.rule.as_deref(), Some("message-create"));
        assert_eq!(summary.method.as_deref(), Some("DELETE"));
        assert_eq!(summary.path_template.as_deref(), Some("/messages/{id}"));
        assert_eq!(summary.requires_id, Some(true));
    }

    #[tokio::test]
    async fn plan_reports_unavailable_rollback_summary_when_no_rule_matches() {
        let (orchestrator, _dir) = build_orchestrator(base_policy()).await;
        let id = orchestrator
            .ingest(bundle_bytes(vec![http_post_intent(0, "https://example.com/unmatched")]))
            .await
            .unwrap();

        let plan = orchestrator.plan(&id).await.unwrap();
        let summary = plan.intents[0].rollback_summary.clone().expect("rollback summary present");
        assert!(!summary.available);
        assert!(summary.rule.is_none());
    }

    #[tokio::test]
    async fn plan_omits_rollback_summary_for_non_http_intents() {
        let (orchestrator, dir) = build_orchestrator(base_policy()).await;
        let id = orchestrator
            .ingest(bundle_bytes(vec![file_write_intent(0, &dir.path().join("a.txt"))]))
            .await
            .unwrap();
        let plan = orchestrator.plan(&id).await.unwrap();
        assert!(plan.intents[0].rollback_summary.is_none());
    }
}
