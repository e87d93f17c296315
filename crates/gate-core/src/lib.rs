// SPDX-License-Identifier: MIT OR Apache-2.0
//! gate-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable data model for the transaction gate: bundle manifests, intent
//! and journal records, approvals, receipts, and policy configuration. If
//! you only take one dependency from this workspace, take this one.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Manifest schema version embedded in every bundle.
///
/// # Examples
///
/// ```
/// assert_eq!(gate_core::MANIFEST_VERSION, "deterministic-agent-lab/trace-bundle@1");
/// ```
pub const MANIFEST_VERSION: &str = "deterministic-agent-lab/trace-bundle@1";

/// Opaque, orchestrator-assigned bundle identifier.
pub type BundleId = String;

/// The fixed component names a bundle manifest must enumerate.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ManifestFiles {
    /// Relative path to the recorded environment snapshot.
    pub env: String,
    /// Relative path to the recorded clock/seed state.
    pub clock: String,
    /// Relative path to the HTTP Archive (HAR) of network traffic.
    pub network: String,
    /// Relative path to the filesystem diff (base archive + changed files).
    #[serde(rename = "fsDiff")]
    pub fs_diff: String,
    /// Relative path to the captured stdout/stderr and policy snapshot.
    pub logs: String,
    /// Relative path to the ordered prompt/response recordings.
    pub prompts: String,
    /// Relative path to the ordered intent log.
    pub intents: String,
}

/// The manifest at the root of every bundle.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Manifest {
    /// Must equal [`MANIFEST_VERSION`] for bundles this core understands.
    pub version: String,
    /// Bundle creation timestamp, RFC3339.
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    /// Free-text description of the recorded run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Caller-supplied metadata, opaque to this core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Relative paths for each required component.
    pub files: ManifestFiles,
    /// Per-component content hashes, checked by `validate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashes: Option<BTreeMap<String, String>>,
}

/// A single entry in a bundle's ordered intent sequence.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IntentRecord {
    /// Position of this intent within the bundle's `intents` sequence.
    pub index: u64,
    /// Intent kind, e.g. `"file.write"`, `"http.post"`, `"llm.call"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Timestamp the recorder observed this intent, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Driver-specific payload.
    pub payload: Value,
    /// Caller-supplied metadata (labels, ids, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl IntentRecord {
    /// The stable intent ID: `metadata.id` if present and string-typed,
    /// else `payload.id` under the same condition, else `"<type>:####"`
    /// using this intent's zero-padded 4-digit position.
    #[must_use]
    pub fn stable_id(&self) -> String {
        string_field(self.metadata.as_ref(), "id")
            .or_else(|| string_field(Some(&self.payload), "id"))
            .unwrap_or_else(|| format!("{}:{:04}", self.kind, self.index))
    }

    /// String-typed labels collected from both `payload.labels` and
    /// `metadata.labels`, in that order, deduplicated but not sorted.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        let mut out = Vec::new();
        for source in [Some(&self.payload), self.metadata.as_ref()] {
            if let Some(Value::Array(items)) = source.and_then(|v| v.get("labels")) {
                for item in items {
                    if let Some(s) = item.as_str() {
                        if !out.iter().any(|existing: &String| existing == s) {
                            out.push(s.to_string());
                        }
                    }
                }
            }
        }
        out
    }
}

fn string_field(value: Option<&Value>, key: &str) -> Option<String> {
    value?
        .as_object()?
        .get(key)?
        .as_str()
        .map(str::to_string)
}

/// Append-only journal status for a single entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum JournalStatus {
    /// The driver's `commit` phase succeeded and a receipt was recorded.
    Committed,
    /// `prepare` or `commit` failed and any side effect was rolled back.
    #[serde(rename = "rolledback")]
    RolledBack,
}

/// A single append-only journal entry.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    /// Monotonic sequence number, zero-padded to 12 decimal digits.
    pub id: String,
    /// Driver kind this entry targets.
    pub intent_type: String,
    /// Idempotency key collapsing retried appends to one committed entry.
    pub idempotency_key: String,
    /// The payload passed to the driver.
    pub payload: Value,
    /// The driver's receipt, present only on committed entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<Value>,
    /// RFC3339 timestamp this entry was appended.
    pub timestamp: DateTime<Utc>,
    /// Terminal status of this entry.
    pub status: JournalStatus,
    /// Caller-supplied metadata carried through from the intent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Error detail, present only on rolled-back entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Zero-pad a monotonic journal sequence number to 12 decimal digits.
#[must_use]
pub fn format_journal_id(seq: u64) -> String {
    format!("{seq:012}")
}

/// An approval recorded against a bundle. Replaces any prior approval for
/// the same `bundle_id`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    /// The approved bundle.
    pub bundle_id: BundleId,
    /// Who approved the bundle.
    pub actor: String,
    /// The policy version in effect at approval time.
    pub policy_version: String,
    /// RFC3339 approval timestamp.
    pub approved_at: DateTime<Utc>,
}

/// A committed intent's receipt, keyed by `(bundle_id, intent_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptRecord {
    /// The bundle this receipt belongs to.
    pub bundle_id: BundleId,
    /// The intent's stable ID within the bundle.
    pub intent_id: String,
    /// The intent's kind, carried for convenience.
    pub intent_type: String,
    /// Opaque receipt payload returned by the driver.
    pub receipt: Value,
    /// RFC3339 timestamp this receipt was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// A single network allowlist rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct NetworkAllowRule {
    /// Allowed domains (case-insensitive exact match).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domains: Option<Vec<String>>,
    /// Allowed methods (exact match). Any method allowed if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
    /// Allowed path patterns using the shared wildcard language.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<String>>,
}

/// Amount caps enforced by the policy engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyCaps {
    /// Maximum allowed value for a numeric `amount` field on any intent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<f64>,
}

/// Minutes-of-day approval window, evaluated in `timezone`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TimeWindow {
    /// Inclusive start of the allowed window, in minutes since midnight.
    pub start: u32,
    /// Inclusive end of the allowed window, in minutes since midnight.
    pub end: u32,
    /// IANA timezone name the window is evaluated in.
    pub timezone: String,
}

/// The structured policy configuration evaluated by the Policy Engine.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    /// Policy version string, compared against the version on an approval.
    pub version: String,
    /// Network allowlist rules.
    #[serde(default)]
    pub allow: Vec<NetworkAllowRule>,
    /// Amount caps.
    #[serde(default)]
    pub caps: PolicyCaps,
    /// Labels that, if present on an intent, require approval.
    #[serde(default)]
    pub require_approval_labels: Vec<String>,
    /// Optional business-hours-style approval window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
}

/// How to extract a compensating-request ID from an HTTP response.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct IdFromRule(pub String);

impl IdFromRule {
    /// The `kind` half of a `kind:locator` entry (`header` or `json`).
    #[must_use]
    pub fn kind(&self) -> &str {
        self.0.split_once(':').map_or(self.0.as_str(), |(k, _)| k)
    }

    /// The `locator` half of a `kind:locator` entry.
    #[must_use]
    pub fn locator(&self) -> &str {
        self.0.split_once(':').map_or("", |(_, l)| l)
    }
}

/// The commit-side match criteria for a rollback rule.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RollbackCommitMatch {
    /// HTTP method the commit request must use. Defaults to `POST`.
    #[serde(default = "default_post_method")]
    pub method: String,
    /// Wildcard pattern matched against the commit request path.
    pub path_pattern: String,
    /// Ordered list of `kind:locator` id extraction rules.
    #[serde(default)]
    pub id_from: Vec<IdFromRule>,
}

fn default_post_method() -> String {
    "POST".to_string()
}

/// The compensating request a rollback rule constructs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RollbackAction {
    /// HTTP method for the compensating request (`DELETE` or `POST`).
    pub method: String,
    /// Path template, may contain `{id}` and other named placeholders.
    pub path_template: String,
    /// Extra headers for the compensating request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
}

/// A single `matchers.json` condition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JsonMatcher {
    /// JSON-path-like expression, e.g. `$.kind`.
    pub path: String,
    /// If present, the value at `path` must equal this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<Value>,
    /// If `true`, the value at `path` must merely exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
}

/// Additional match constraints beyond host/method/path.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RollbackMatchers {
    /// Request headers that must equal (case-insensitively) the given value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    /// JSON body conditions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json: Option<Vec<JsonMatcher>>,
}

/// A declarative rule mapping a commit-time HTTP request to a compensating
/// rollback request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpRollbackRule {
    /// Unique rule name, surfaced in plan/receipt output.
    pub name: String,
    /// Wildcard pattern matched against the request host.
    pub host_pattern: String,
    /// Commit-side match criteria.
    pub commit: RollbackCommitMatch,
    /// The compensating request to construct.
    pub rollback: RollbackAction,
    /// Extra match constraints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matchers: Option<RollbackMatchers>,
}

/// Derived lifecycle state of a bundle. Never stored directly — computed
/// from whether receipts or an approval exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BundleState {
    /// No approval and no receipts exist yet.
    Pending,
    /// An approval exists but no receipts have been committed.
    Approved,
    /// At least one receipt exists for this bundle.
    Committed,
}

impl BundleState {
    /// Derive state from whether an approval and any receipts exist.
    #[must_use]
    pub fn derive(has_approval: bool, has_receipts: bool) -> Self {
        if has_receipts {
            Self::Committed
        } else if has_approval {
            Self::Approved
        } else {
            Self::Pending
        }
    }
}

/// The driver kind an intent dispatches to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    /// A local filesystem write.
    FileWrite,
    /// An outbound HTTP POST.
    HttpPost,
    /// An LLM provider call.
    LlmCall,
    /// A caller-registered custom driver, named by string.
    Custom(String),
}

impl IntentKind {
    /// Parse an intent's `type` string into a driver kind.
    #[must_use]
    pub fn from_type(kind: &str) -> Self {
        match kind {
            "file.write" => Self::FileWrite,
            "http.post" => Self::HttpPost,
            "llm.call" => Self::LlmCall,
            other => Self::Custom(other.to_string()),
        }
    }

    /// The canonical string form used as an intent `type` and registry key.
    #[must_use]
    pub fn as_type_str(&self) -> &str {
        match self {
            Self::FileWrite => "file.write",
            Self::HttpPost => "http.post",
            Self::LlmCall => "llm.call",
            Self::Custom(name) => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_id_prefers_metadata_id() {
        let intent = IntentRecord {
            index: 3,
            kind: "test.mock".into(),
            timestamp: None,
            payload: serde_json::json!({"id": "payload-id"}),
            metadata: Some(serde_json::json!({"id": "meta-id"})),
        };
        assert_eq!(intent.stable_id(), "meta-id");
    }

    #[test]
    fn stable_id_falls_back_to_payload_id() {
        let intent = IntentRecord {
            index: 3,
            kind: "test.mock".into(),
            timestamp: None,
            payload: serde_json::json!({"id": "payload-id"}),
            metadata: None,
        };
        assert_eq!(intent.stable_id(), "payload-id");
    }

    #[test]
    fn stable_id_falls_back_to_type_and_index() {
        let intent = IntentRecord {
            index: 7,
            kind: "email.send".into(),
            timestamp: None,
            payload: serde_json::json!({}),
            metadata: None,
        };
        assert_eq!(intent.stable_id(), "email.send:0007");
    }

    #[test]
    fn labels_merge_payload_and_metadata_without_duplicates() {
        let intent = IntentRecord {
            index: 0,
            kind: "email.send".into(),
            timestamp: None,
            payload: serde_json::json!({"labels": ["a", "b"]}),
            metadata: Some(serde_json::json!({"labels": ["b", "c"]})),
        };
        assert_eq!(intent.labels(), vec!["a", "b", "c"]);
    }

    #[test]
    fn format_journal_id_zero_pads_to_12_digits() {
        assert_eq!(format_journal_id(7), "000000000007");
        assert_eq!(format_journal_id(123456789012), "123456789012");
    }

    #[test]
    fn bundle_state_derivation_matches_precedence() {
        assert_eq!(BundleState::derive(false, false), BundleState::Pending);
        assert_eq!(BundleState::derive(true, false), BundleState::Approved);
        assert_eq!(BundleState::derive(false, true), BundleState::Committed);
        assert_eq!(BundleState::derive(true, true), BundleState::Committed);
    }

    #[test]
    fn intent_kind_round_trips_known_and_custom() {
        assert_eq!(IntentKind::from_type("file.write"), IntentKind::FileWrite);
        assert_eq!(
            IntentKind::from_type("my.custom"),
            IntentKind::Custom("my.custom".into())
        );
        assert_eq!(IntentKind::FileWrite.as_type_str(), "file.write");
        assert_eq!(IntentKind::Custom("x".into()).as_type_str(), "x");
    }

    #[test]
    fn id_from_rule_splits_kind_and_locator() {
        let rule = IdFromRule("json:$.messageId".to_string());
        assert_eq!(rule.kind(), "json");
        assert_eq!(rule.locator(), "$.messageId");
    }

    #[test]
    fn manifest_round_trips_through_json() {
        let manifest = Manifest {
            version: MANIFEST_VERSION.to_string(),
            created_at: Utc::now(),
            description: None,
            metadata: None,
            files: ManifestFiles {
                env: "env.json".into(),
                clock: "clock.json".into(),
                network: "network.har".into(),
                fs_diff: "fs-diff".into(),
                logs: "logs".into(),
                prompts: "prompts".into(),
                intents: "intents.jsonl".into(),
            },
            hashes: None,
        };
        let json = serde_json::to_string(&manifest).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.version, MANIFEST_VERSION);
        assert_eq!(back.files.fs_diff, "fs-diff");
    }
}
