// SPDX-License-Identifier: MIT OR Apache-2.0
//! gate-policy
#![deny(unsafe_code)]
//!
//! The Policy Engine (§4.8): evaluates amount caps, approval-label
//! requirements, approval time windows, and network allowlisting against a
//! bundle's intents and its observed network log, producing one
//! deterministic, side-effect-free [`Evaluation`].

use chrono::{DateTime, Timelike, Utc};
use gate_core::{IntentRecord, NetworkAllowRule, PolicyConfig};
use serde::{Deserialize, Serialize};

/// Which pass an [`Evaluation`] is for. Both stages run the identical rule
/// set; the distinction exists for callers to re-check at commit time what
/// was already checked at plan time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Plan,
    Commit,
}

/// Evaluation context: which stage, and the clock time rules are judged
/// against (only the time-window rule reads `now`).
#[derive(Debug, Clone)]
pub struct Context {
    pub stage: Stage,
    pub now: DateTime<Utc>,
}

/// One outbound network call, observed or proposed, to check against the
/// allowlist.
#[derive(Debug, Clone)]
pub struct NetworkRequest {
    pub url: String,
    pub method: String,
}

/// Per-intent evaluation result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IntentEvaluation {
    pub index: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub allowed: bool,
    pub requires_approval: bool,
    pub reasons: Vec<String>,
    pub approval_reasons: Vec<String>,
}

/// Per-network-entry evaluation result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEvaluation {
    pub url: String,
    pub method: String,
    pub allowed: bool,
    pub reasons: Vec<String>,
}

/// The bundle-level rollup of every intent and network evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BundleEvaluation {
    pub allowed: bool,
    pub requires_approval: bool,
    pub reasons: Vec<String>,
}

/// The full result of one `evaluate` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Evaluation {
    pub bundle: BundleEvaluation,
    pub intents: Vec<IntentEvaluation>,
    pub network: Vec<NetworkEvaluation>,
}

/// Evaluates a loaded [`PolicyConfig`] against a bundle's intents and
/// network log. Holds no mutable state; `evaluate` is pure.
pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    #[must_use]
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    #[must_use]
    pub fn evaluate(
        &self,
        ctx: &Context,
        intents: &[IntentRecord],
        network: &[NetworkRequest],
    ) -> Evaluation {
        let intent_evals: Vec<IntentEvaluation> =
            intents.iter().map(|intent| self.evaluate_intent(ctx, intent)).collect();
        let network_evals: Vec<NetworkEvaluation> =
            network.iter().map(|req| self.evaluate_network(req)).collect();

        let mut bundle_reasons: Vec<String> = intent_evals
            .iter()
            .filter(|e| !e.allowed)
            .flat_map(|e| e.reasons.iter().cloned())
            .chain(network_evals.iter().filter(|e| !e.allowed).flat_map(|e| e.reasons.iter().cloned()))
            .collect();
        bundle_reasons.sort();
        bundle_reasons.dedup();

        let bundle_allowed =
            intent_evals.iter().all(|e| e.allowed) && network_evals.iter().all(|e| e.allowed);
        let bundle_requires_approval = intent_evals.iter().any(|e| e.requires_approval);

        Evaluation {
            bundle: BundleEvaluation {
                allowed: bundle_allowed,
                requires_approval: bundle_requires_approval,
                reasons: bundle_reasons,
            },
            intents: intent_evals,
            network: network_evals,
        }
    }

    fn evaluate_intent(&self, ctx: &Context, intent: &IntentRecord) -> IntentEvaluation {
        let mut allowed = true;
        let mut reasons = Vec::new();
        let mut requires_approval = false;
        let mut approval_reasons = Vec::new();

        if let Some(max_amount) = self.config.caps.max_amount {
            if let Some(amount) = intent.payload.get("amount").and_then(|v| v.as_f64()) {
                if amount > max_amount {
                    allowed = false;
                    reasons.push(format!("amount {amount} exceeds cap {max_amount}"));
                }
            }
        }

        for label in intent.labels() {
            if self.config.require_approval_labels.iter().any(|l| l == &label) {
                requires_approval = true;
                approval_reasons.push(format!("label `{label}` requires approval"));
            }
        }

        if let Some(window) = &self.config.time_window {
            match minutes_of_day(ctx.now, &window.timezone) {
                Some(minutes) if minutes < window.start || minutes > window.end => {
                    requires_approval = true;
                    approval_reasons.push("outside approved time window".to_string());
                }
                Some(_) => {}
                None => {
                    requires_approval = true;
                    approval_reasons.push(format!("unknown timezone `{}`", window.timezone));
                }
            }
        }

        IntentEvaluation {
            index: intent.index,
            kind: intent.kind.clone(),
            allowed,
            requires_approval,
            reasons,
            approval_reasons,
        }
    }

    fn evaluate_network(&self, req: &NetworkRequest) -> NetworkEvaluation {
        let (host, path) = split_host_path(&req.url);
        let allowed = self.config.allow.is_empty()
            || self.config.allow.iter().any(|rule| network_rule_matches(rule, &host, &req.method, &path));

        let reasons = if allowed {
            Vec::new()
        } else {
            vec![format!("no allow rule matches {} {}", req.method, req.url)]
        };

        NetworkEvaluation { url: req.url.clone(), method: req.method.clone(), allowed, reasons }
    }
}

fn network_rule_matches(rule: &NetworkAllowRule, host: &str, method: &str, path: &str) -> bool {
    let host_ok = rule.domains.as_ref().is_none_or(|domains| domains.iter().any(|d| d.eq_ignore_ascii_case(host)));
    if !host_ok {
        return false;
    }
    let method_ok = rule.methods.as_ref().is_none_or(|methods| methods.iter().any(|m| m.eq_ignore_ascii_case(method)));
    if !method_ok {
        return false;
    }
    rule.paths.as_ref().is_none_or(|paths| paths.iter().any(|p| wildcard_match(p, path)))
}

/// The shared wildcard language, identical to `gate_rollback_registry`'s
/// `wildcard_match` (§4.6/§4.8). Duplicated rather than depended on: each
/// driver/policy crate here stays a small, independently-buildable unit,
/// matching the teacher's one-crate-per-concern layering, and the function
/// is eight lines.
fn wildcard_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return value.starts_with(prefix);
    }
    pattern.eq_ignore_ascii_case(value)
}

/// Splits `scheme://host[:port]/path` into `(host, path)` without pulling in
/// a full URL-parsing dependency; §4.8 only needs these two fields.
fn split_host_path(url: &str) -> (String, String) {
    let without_scheme = url.splitn(2, "://").nth(1).unwrap_or(url);
    let mut parts = without_scheme.splitn(2, '/');
    let authority = parts.next().unwrap_or_default();
    let path = parts.next().map(|p| format!("/{p}")).unwrap_or_else(|| "/".to_string());
    let host = authority.split(':').next().unwrap_or_default().to_string();
    (host, path)
}

fn minutes_of_day(now: DateTime<Utc>, tz_name: &str) -> Option<u32> {
    let tz: chrono_tz::Tz = tz_name.parse().ok()?;
    let local = now.with_timezone(&tz);
    Some(local.hour() * 60 + local.minute())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gate_core::{PolicyCaps, TimeWindow};
    use serde_json::json;

    fn intent(index: u64, payload: serde_json::Value) -> IntentRecord {
        IntentRecord { index, kind: "http.post".to_string(), timestamp: None, payload, metadata: None }
    }

    fn base_config() -> PolicyConfig {
        PolicyConfig {
            version: "v1".to_string(),
            allow: Vec::new(),
            caps: PolicyCaps::default(),
            require_approval_labels: Vec::new(),
            time_window: None,
        }
    }

    fn ctx_at(iso: &str) -> Context {
        Context {
            stage: Stage::Commit,
            now: DateTime::parse_from_rfc3339(iso).unwrap().with_timezone(&Utc),
        }
    }

    #[test]
    fn amount_over_cap_blocks_the_intent() {
        let mut config = base_config();
        config.caps.max_amount = Some(100.0);
        let engine = PolicyEngine::new(config);
        let eval = engine.evaluate(&ctx_at("2026-01-01T12:00:00Z"), &[intent(0, json!({"amount": 150}))], &[]);
        assert!(!eval.intents[0].allowed);
        assert!(!eval.bundle.allowed);
        assert!(eval.bundle.reasons[0].contains("150"));
        assert!(eval.bundle.reasons[0].contains("100"));
    }

    #[test]
    fn amount_under_cap_is_allowed() {
        let mut config = base_config();
        config.caps.max_amount = Some(100.0);
        let engine = PolicyEngine::new(config);
        let eval = engine.evaluate(&ctx_at("2026-01-01T12:00:00Z"), &[intent(0, json!({"amount": 50}))], &[]);
        assert!(eval.intents[0].allowed);
        assert!(eval.bundle.allowed);
    }

    #[test]
    fn matching_label_requires_approval() {
        let mut config = base_config();
        config.require_approval_labels = vec!["finance".to_string()];
        let engine = PolicyEngine::new(config);
        let eval = engine.evaluate(
            &ctx_at("2026-01-01T12:00:00Z"),
            &[intent(0, json!({"labels": ["finance"]}))],
            &[],
        );
        assert!(eval.intents[0].requires_approval);
        assert!(eval.bundle.requires_approval);
        assert!(eval.intents[0].allowed);
    }

    #[test]
    fn time_window_outside_requires_approval_not_block() {
        let mut config = base_config();
        config.time_window =
            Some(TimeWindow { start: 9 * 60, end: 17 * 60, timezone: "UTC".to_string() });
        let engine = PolicyEngine::new(config);
        let eval = engine.evaluate(&ctx_at("2026-01-01T22:00:00Z"), &[intent(0, json!({}))], &[]);
        assert!(eval.intents[0].requires_approval);
        assert!(eval.intents[0].allowed);
    }

    #[test]
    fn time_window_inside_does_not_require_approval() {
        let mut config = base_config();
        config.time_window =
            Some(TimeWindow { start: 9 * 60, end: 17 * 60, timezone: "UTC".to_string() });
        let engine = PolicyEngine::new(config);
        let eval = engine.evaluate(&ctx_at("2026-01-01T12:00:00Z"), &[intent(0, json!({}))], &[]);
        assert!(!eval.intents[0].requires_approval);
    }

    #[test]
    fn empty_allowlist_allows_everything() {
        let engine = PolicyEngine::new(base_config());
        let eval = engine.evaluate(
            &ctx_at("2026-01-01T12:00:00Z"),
            &[],
            &[NetworkRequest { url: "https://example.com/anything".to_string(), method: "GET".to_string() }],
        );
        assert!(eval.network[0].allowed);
    }

    #[test]
    fn network_rule_blocks_unmatched_host() {
        let mut config = base_config();
        config.allow = vec![NetworkAllowRule {
            domains: Some(vec!["api.example.com".to_string()]),
            methods: None,
            paths: None,
        }];
        let engine = PolicyEngine::new(config);
        let eval = engine.evaluate(
            &ctx_at("2026-01-01T12:00:00Z"),
            &[],
            &[NetworkRequest { url: "https://other.com/x".to_string(), method: "GET".to_string() }],
        );
        assert!(!eval.network[0].allowed);
        assert!(!eval.bundle.allowed);
    }

    #[test]
    fn network_rule_wildcard_path_matches() {
        let mut config = base_config();
        config.allow = vec![NetworkAllowRule {
            domains: Some(vec!["api.example.com".to_string()]),
            methods: Some(vec!["POST".to_string()]),
            paths: Some(vec!["/v1/*".to_string()]),
        }];
        let engine = PolicyEngine::new(config);
        let eval = engine.evaluate(
            &ctx_at("2026-01-01T12:00:00Z"),
            &[],
            &[NetworkRequest { url: "https://api.example.com/v1/widgets".to_string(), method: "POST".to_string() }],
        );
        assert!(eval.network[0].allowed);
    }

    #[test]
    fn bundle_reasons_are_sorted_and_deduplicated() {
        let mut config = base_config();
        config.caps.max_amount = Some(10.0);
        let engine = PolicyEngine::new(config);
        let eval = engine.evaluate(
            &ctx_at("2026-01-01T12:00:00Z"),
            &[intent(0, json!({"amount": 20})), intent(1, json!({"amount": 20}))],
            &[],
        );
        assert_eq!(eval.bundle.reasons.len(), 1);
    }
}
