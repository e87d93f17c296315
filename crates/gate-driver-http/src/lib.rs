// SPDX-License-Identifier: MIT OR Apache-2.0
//! gate-driver-http
#![deny(unsafe_code)]
//!
//! The HTTP-POST Driver (§4.5): issues an idempotent POST, derives
//! compensating-request metadata from the response (preferring a matched
//! [`gate_rollback_registry`] rule over ad-hoc `Location`/`id` conventions),
//! and replays that metadata as a `DELETE`/`POST` during `revert`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use gate_driver_core::{Driver, Prepared, Receipt};
use gate_error::{ErrorCode, GateError};
use gate_rollback_registry::{RequestCtx, RollbackRegistry};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// `payload` shape for an `http.post` intent.
#[derive(Debug, Clone, Deserialize)]
struct HttpPostPayload {
    url: String,
    #[serde(default)]
    body: Value,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

/// State captured by `prepare`: the composed request, and which registry
/// rule (if any) will govern rollback derivation at commit time.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HttpPostPrepared {
    headers: BTreeMap<String, String>,
    body_json: Option<Value>,
    matched_rule: Option<String>,
}

/// Rollback metadata embedded in the committed [`Receipt`], self-sufficient
/// for `revert` per the Receipt contract (no access to `Prepared` at that
/// point).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RollbackMetadata {
    method: String,
    url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    headers: Option<BTreeMap<String, String>>,
}

/// The HTTP-POST Driver.
pub struct HttpPostDriver {
    client: Client,
    registry: RollbackRegistry,
}

impl HttpPostDriver {
    /// Build a driver with no rollback registry: every commit falls back to
    /// the `Location`/`id`/`rollback.{method,path}` conventions.
    #[must_use]
    pub fn new() -> Self {
        Self::with_registry(RollbackRegistry::empty())
    }

    /// Build a driver that consults `registry` for rule-governed rollback.
    #[must_use]
    pub fn with_registry(registry: RollbackRegistry) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds"),
            registry,
        }
    }
}

impl Default for HttpPostDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_payload(payload: &Value) -> Result<HttpPostPayload, GateError> {
    serde_json::from_value(payload.clone()).map_err(|e| {
        GateError::new(ErrorCode::PrepareFailed, "http.post payload does not match schema")
            .with_source(e)
    })
}

fn host_of(url: &str) -> String {
    reqwest::Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string)).unwrap_or_default()
}

fn path_of(url: &str) -> String {
    reqwest::Url::parse(url).ok().map(|u| u.path().to_string()).unwrap_or_default()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn http_error(stage: &'static str, e: impl std::fmt::Display) -> GateError {
    GateError::new(ErrorCode::HttpError, "http request failed")
        .with_context("stage", stage)
        .with_context("detail", e.to_string())
}

#[async_trait]
impl Driver for HttpPostDriver {
    fn name(&self) -> &str {
        "http.post"
    }

    async fn validate(&self, payload: &Value) -> Result<(), GateError> {
        let parsed = parse_payload(payload)?;
        if parsed.url.trim().is_empty() {
            return Err(GateError::new(ErrorCode::PrepareFailed, "empty url"));
        }
        Ok(())
    }

    async fn prepare(&self, idempotency_key: &str, payload: &Value) -> Result<Prepared, GateError> {
        let parsed = parse_payload(payload)?;

        let mut headers = parsed.headers.clone();
        if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
            headers.insert("content-type".to_string(), "application/json".to_string());
        }
        if !headers.keys().any(|k| k.eq_ignore_ascii_case("idempotency-key")) {
            headers.insert("idempotency-key".to_string(), idempotency_key.to_string());
        }

        let body_json = if parsed.body.is_string() {
            serde_json::from_str(parsed.body.as_str().unwrap_or_default()).ok()
        } else if parsed.body.is_null() {
            None
        } else {
            Some(parsed.body.clone())
        };

        let ctx = RequestCtx {
            host: &host_of(&parsed.url),
            method: "POST",
            path: &path_of(&parsed.url),
            headers: headers.clone(),
            body: body_json.as_ref(),
        };
        let matched_rule = self.registry.find_rule(&ctx).map(|r| r.name.clone());

        Ok(Prepared::new(
            serde_json::to_value(HttpPostPrepared { headers, body_json, matched_rule })
                .expect("serializable"),
        ))
    }

    async fn commit(
        &self,
        _idempotency_key: &str,
        payload: &Value,
        prepared: &Prepared,
    ) -> Result<Receipt, GateError> {
        let parsed = parse_payload(payload)?;
        let prepared: HttpPostPrepared = serde_json::from_value(prepared.value().clone())
            .map_err(|e| http_error("prepared-decode", e))?;

        let mut builder = self.client.post(&parsed.url);
        for (k, v) in &prepared.headers {
            builder = builder.header(k, v);
        }
        let body_bytes = match &prepared.body_json {
            Some(v) => serde_json::to_vec(v).map_err(|e| http_error("encode-body", e))?,
            None if parsed.body.is_string() => {
                parsed.body.as_str().unwrap_or_default().as_bytes().to_vec()
            }
            None => Vec::new(),
        };
        builder = builder.body(body_bytes);

        let response = builder.send().await.map_err(|e| http_error("send", e))?;
        let status = response.status().as_u16();
        let response_headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let response_bytes = response.bytes().await.map_err(|e| http_error("read-body", e))?;
        let response_hash = sha256_hex(&response_bytes);
        let response_json: Option<Value> = serde_json::from_slice(&response_bytes).ok();

        let metadata = derive_rollback_metadata(
            &self.registry,
            prepared.matched_rule.as_deref(),
            &parsed.url,
            &response_headers,
            response_json.as_ref(),
        );

        let mut receipt = serde_json::json!({
            "status": status,
            "idempotencyKey": prepared
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("idempotency-key"))
                .map(|(_, v)| v.clone()),
            "responseHash": response_hash,
        });
        if let Some(metadata) = &metadata {
            receipt["metadata"] = serde_json::to_value(metadata).expect("serializable");
        }
        Ok(Receipt::new(receipt))
    }

    async fn rollback(
        &self,
        _idempotency_key: &str,
        _payload: &Value,
        _prepared: &Prepared,
    ) -> Result<(), GateError> {
        // `prepare` for http.post performs no external side effect of its own
        // (the POST itself only happens in `commit`), so there is nothing to
        // compensate if `commit` never ran or failed before a response came
        // back.
        Ok(())
    }

    async fn revert(
        &self,
        idempotency_key: &str,
        _payload: &Value,
        receipt: &Receipt,
    ) -> Result<(), GateError> {
        let metadata = receipt.value().get("metadata").cloned();
        let metadata: Option<RollbackMetadata> =
            metadata.and_then(|v| serde_json::from_value(v).ok());

        let Some(metadata) = metadata else {
            return Err(GateError::new(ErrorCode::NonReversible, "no derivable rollback metadata")
                .with_context("idempotencyKey", idempotency_key));
        };

        let method = Method::from_bytes(metadata.method.as_bytes())
            .map_err(|e| http_error("parse-method", e))?;
        let mut builder = self.client.request(method, &metadata.url);
        if let Some(headers) = &metadata.headers {
            for (k, v) in headers {
                builder = builder.header(k, v);
            }
        }
        builder = builder.header("idempotency-key", format!("{idempotency_key}-rollback"));

        let response = builder.send().await.map_err(|e| http_error("rollback-send", e))?;
        if !response.status().is_success() {
            return Err(GateError::new(ErrorCode::HttpError, "compensating request failed")
                .with_context("status", response.status().as_u16()));
        }
        Ok(())
    }
}

/// Derive the `rollback` field persisted on a commit [`Receipt`], in
/// priority order: (i) a matched registry rule, (ii) a `Location` response
/// header, (iii) a JSON `id` field in the response body joined under the
/// request's own path, (iv) an explicit `rollback.{method,path}` pair in the
/// response body. `None` means the intent is non-reversible.
fn derive_rollback_metadata(
    registry: &RollbackRegistry,
    matched_rule: Option<&str>,
    request_url: &str,
    response_headers: &BTreeMap<String, String>,
    response_json: Option<&Value>,
) -> Option<RollbackMetadata> {
    if let Some(rule_name) = matched_rule {
        if let Some(rule) = registry.rules().iter().find(|r| r.name == rule_name) {
            if let Some(path) = gate_rollback_registry::resolve(rule, response_headers, response_json)
            {
                let base = base_url(request_url);
                return Some(RollbackMetadata {
                    method: rule.rollback.method.clone(),
                    url: format!("{base}{path}"),
                    headers: rule.rollback.headers.clone(),
                });
            }
        }
    }

    if let Some(location) = response_headers.iter().find(|(k, _)| k.eq_ignore_ascii_case("location"))
    {
        return Some(RollbackMetadata {
            method: "DELETE".to_string(),
            url: resolve_location(request_url, location.1),
            headers: None,
        });
    }

    if let Some(body) = response_json {
        if let Some(id) = body.get("id").and_then(|v| v.as_str().map(str::to_string).or_else(|| {
            v.as_i64().map(|n| n.to_string())
        })) {
            return Some(RollbackMetadata {
                method: "DELETE".to_string(),
                url: format!("{}/{}", base_url(request_url), id),
                headers: None,
            });
        }
        if let Some(rollback) = body.get("rollback") {
            let method = rollback.get("method").and_then(Value::as_str).unwrap_or("DELETE");
            if let Some(path) = rollback.get("path").and_then(Value::as_str) {
                return Some(RollbackMetadata {
                    method: method.to_string(),
                    url: format!("{}{}", base_url(request_url), path),
                    headers: None,
                });
            }
        }
    }

    None
}

fn base_url(request_url: &str) -> String {
    match reqwest::Url::parse(request_url) {
        Ok(u) => format!(
            "{}://{}{}",
            u.scheme(),
            u.host_str().unwrap_or_default(),
            u.port().map(|p| format!(":{p}")).unwrap_or_default(),
        ),
        Err(_) => String::new(),
    }
}

fn resolve_location(request_url: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        location.to_string()
    } else {
        format!("{}{}", base_url(request_url), location)
    }
}
