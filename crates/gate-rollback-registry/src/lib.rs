// SPDX-License-Identifier: MIT OR Apache-2.0
//! gate-rollback-registry
#![deny(unsafe_code)]
//!
//! The declarative HTTP Rollback Rule Registry (§4.6): loads a sibling
//! YAML/JSON file of [`HttpRollbackRule`]s, matches a commit-time request
//! against them, and resolves a compensating request from the response.

use std::collections::BTreeMap;
use std::path::Path;

use gate_core::HttpRollbackRule;
use gate_error::{ErrorCode, GateError};
use serde_json::Value;

/// The commit-time request a rule is matched against.
#[derive(Debug, Clone, Default)]
pub struct RequestCtx<'a> {
    pub host: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub headers: BTreeMap<String, String>,
    pub body: Option<&'a Value>,
}

/// A loaded set of rollback rules, consulted in file order.
#[derive(Debug, Clone, Default)]
pub struct RollbackRegistry {
    rules: Vec<HttpRollbackRule>,
}

impl RollbackRegistry {
    /// An empty registry: no rule ever matches.
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Build a registry directly from a rule list, e.g. for tests.
    #[must_use]
    pub fn from_rules(rules: Vec<HttpRollbackRule>) -> Self {
        Self { rules }
    }

    /// Load a registry from `path` (YAML or JSON, by extension). A missing
    /// file yields an empty registry rather than an error.
    pub fn load(path: &Path) -> Result<Self, GateError> {
        if !path.exists() {
            return Ok(Self::empty());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            GateError::new(ErrorCode::SchemaViolation, "failed to read rollback registry file")
                .with_source(e)
        })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let rules: Vec<HttpRollbackRule> = if is_json {
            serde_json::from_str(&content).map_err(|e| {
                GateError::new(ErrorCode::SchemaViolation, "rollback registry JSON is malformed")
                    .with_source(e)
            })?
        } else {
            serde_yaml::from_str(&content).map_err(|e| {
                GateError::new(ErrorCode::SchemaViolation, "rollback registry YAML is malformed")
                    .with_source(e)
            })?
        };

        Ok(Self { rules })
    }

    /// The first rule whose `hostPattern`/method/`pathPattern`/matchers all
    /// agree with `ctx`.
    #[must_use]
    pub fn find_rule(&self, ctx: &RequestCtx<'_>) -> Option<&HttpRollbackRule> {
        self.rules.iter().find(|rule| rule_matches(rule, ctx))
    }

    /// All loaded rules, in file order.
    #[must_use]
    pub fn rules(&self) -> &[HttpRollbackRule] {
        &self.rules
    }
}

fn rule_matches(rule: &HttpRollbackRule, ctx: &RequestCtx<'_>) -> bool {
    if !wildcard_match(&rule.host_pattern, ctx.host) {
        return false;
    }
    if !ctx.method.eq_ignore_ascii_case(&rule.commit.method) {
        return false;
    }
    if !wildcard_match(&rule.commit.path_pattern, ctx.path) {
        return false;
    }
    if let Some(matchers) = &rule.matchers {
        if let Some(expected_headers) = &matchers.headers {
            for (key, expected) in expected_headers {
                let actual = ctx
                    .headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map(|(_, v)| v);
                if !actual.is_some_and(|v| v.eq_ignore_ascii_case(expected)) {
                    return false;
                }
            }
        }
        if let Some(json_matchers) = &matchers.json {
            for matcher in json_matchers {
                let value = ctx.body.and_then(|body| json_path_get(body, &matcher.path));
                if let Some(exists) = matcher.exists {
                    if value.is_some() != exists {
                        return false;
                    }
                }
                if let Some(expected) = &matcher.equals {
                    if value != Some(expected) {
                        return false;
                    }
                }
            }
        }
    }
    true
}

/// Resolve a compensating request path for `rule` from the commit response.
/// Iterates `idFrom` entries in order; the first that yields a scalar value
/// wins. Returns `None` (rollback becomes manual) if `pathTemplate` requires
/// `{id}` and no entry resolved one.
#[must_use]
pub fn resolve(
    rule: &HttpRollbackRule,
    response_headers: &BTreeMap<String, String>,
    response_body: Option<&Value>,
) -> Option<String> {
    let mut id: Option<String> = None;
    for entry in &rule.commit.id_from {
        let found = match entry.kind() {
            "header" => response_headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(entry.locator()))
                .map(|(_, v)| v.clone()),
            "json" => response_body
                .and_then(|body| json_path_get(body, entry.locator()))
                .and_then(scalar_to_string),
            _ => None,
        };
        if let Some(value) = found {
            id = Some(value);
            break;
        }
    }

    let requires_id = rule.rollback.path_template.contains("{id}");
    if requires_id && id.is_none() {
        return None;
    }

    let mut path = rule.rollback.path_template.clone();
    if let Some(id) = &id {
        path = path.replace("{id}", id);
    }
    Some(path)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Evaluate a minimal JSON-path-like expression (`$.field.nested`) against
/// `value`. Only dotted object field access is supported; that is all §4.6
/// and §4.8 require.
#[must_use]
pub fn json_path_get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let trimmed = path.strip_prefix("$.").unwrap_or(path.trim_start_matches('$'));
    if trimmed.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in trimmed.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// The shared wildcard language used by both the rollback registry and the
/// policy engine's network-allow rules: a literal match, a `prefix*` match,
/// or a bare `*` matching anything.
#[must_use]
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return value.starts_with(prefix);
    }
    pattern.eq_ignore_ascii_case(value)
}
