// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the transaction gate.
//!
//! This crate provides [`GateConfig`] — the daemon/CLI's runtime settings —
//! together with helpers for loading from TOML files, applying environment
//! overrides, merging overlays, and producing advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use gate_core::PolicyConfig;
use gate_error::{ErrorCode, GateError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },

    /// Two configs could not be merged because of conflicting constraints.
    #[error("merge conflict: {reason}")]
    MergeConflict {
        /// Description of the conflict.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A deprecated field was used in the configuration.
    DeprecatedField {
        /// Name of the deprecated field.
        field: String,
        /// Suggested replacement, if any.
        suggestion: Option<String>,
    },
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// The configured listen address is not loopback, which widens the
    /// daemon's exposure beyond a single operator's machine.
    NonLoopbackListen {
        /// The configured `host:port`.
        addr: String,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::DeprecatedField { field, suggestion } => {
                write!(f, "deprecated field '{field}'")?;
                if let Some(s) = suggestion {
                    write!(f, " — use '{s}' instead")?;
                }
                Ok(())
            }
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::NonLoopbackListen { addr } => {
                write!(f, "listen address '{addr}' is not loopback")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level runtime configuration for the transaction gate.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct GateConfig {
    /// Directory under which `bundles/`, `gate.db`, and `journal.jsonl` live.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,

    /// Path to the policy YAML/JSON document evaluated by the orchestrator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_path: Option<String>,

    /// `tracing_subscriber::EnvFilter` directive string (e.g. `"info"`,
    /// `"gate_orchestrator=debug,info"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,

    /// `host:port` the daemon binds to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            data_dir: Some(".gate/data".to_string()),
            policy_path: None,
            log: Some("info".to_string()),
            listen: Some("127.0.0.1:8787".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`GateConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`GateConfig::default()`].
///
/// Environment variable overrides are applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<GateConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => GateConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into a [`GateConfig`].
pub fn parse_toml(content: &str) -> Result<GateConfig, ConfigError> {
    toml::from_str::<GateConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides.
///
/// Recognised variables:
/// - `GATE_DATA_DIR`
/// - `GATE_POLICY`
/// - `GATE_LOG`
/// - `GATE_LISTEN`
pub fn apply_env_overrides(config: &mut GateConfig) {
    if let Ok(val) = std::env::var("GATE_DATA_DIR") {
        config.data_dir = Some(val);
    }
    if let Ok(val) = std::env::var("GATE_POLICY") {
        config.policy_path = Some(val);
    }
    if let Ok(val) = std::env::var("GATE_LOG") {
        config.log = Some(val);
    }
    if let Ok(val) = std::env::var("GATE_LISTEN") {
        config.listen = Some(val);
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (an empty `listen` value, a `policy_path` that does not
/// exist) are returned as a [`ConfigError::ValidationError`]; soft issues
/// come back as warnings.
pub fn validate_config(config: &GateConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if let Some(ref listen) = config.listen {
        if listen.trim().is_empty() {
            errors.push("listen must not be empty".into());
        } else if listen.rsplit_once(':').is_none() {
            errors.push(format!("listen '{listen}' must be a host:port pair"));
        } else if !listen.starts_with("127.0.0.1") && !listen.starts_with("localhost") {
            warnings.push(ConfigWarning::NonLoopbackListen { addr: listen.clone() });
        }
    }

    if let Some(ref policy_path) = config.policy_path {
        if !Path::new(policy_path).exists() {
            errors.push(format!("policy_path '{policy_path}' does not exist"));
        }
    }

    if config.policy_path.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "policy_path".into(),
            hint: "every bundle evaluates against an empty allowlist with no approval labels"
                .into(),
        });
    }
    if config.data_dir.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "data_dir".into(),
            hint: "falls back to the default .gate/data directory".into(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Merge two configurations. Values in `overlay` take precedence over `base`.
pub fn merge_configs(base: GateConfig, overlay: GateConfig) -> GateConfig {
    GateConfig {
        data_dir: overlay.data_dir.or(base.data_dir),
        policy_path: overlay.policy_path.or(base.policy_path),
        log: overlay.log.or(base.log),
        listen: overlay.listen.or(base.listen),
    }
}

// ---------------------------------------------------------------------------
// Policy document loading
// ---------------------------------------------------------------------------

/// Resolve `GATE_POLICY` to a concrete policy document path: if it names a
/// directory, look for `policy.yaml` then `policy.json` inside it; if it
/// names a file, use it directly.
fn resolve_policy_file(path: &Path) -> Result<std::path::PathBuf, GateError> {
    if path.is_dir() {
        for candidate in ["policy.yaml", "policy.yml", "policy.json"] {
            let candidate_path = path.join(candidate);
            if candidate_path.is_file() {
                return Ok(candidate_path);
            }
        }
        return Err(GateError::new(
            ErrorCode::SchemaViolation,
            "policy directory contains no policy.yaml or policy.json",
        )
        .with_context("policyPath", path.display().to_string()));
    }
    Ok(path.to_path_buf())
}

/// Load the [`PolicyConfig`] the orchestrator evaluates bundles against,
/// from the path named by `GATE_POLICY` (a directory or a direct file,
/// YAML or JSON by extension).
pub fn load_policy_config(path: &Path) -> Result<PolicyConfig, GateError> {
    let file = resolve_policy_file(path)?;
    let content = std::fs::read_to_string(&file).map_err(|e| {
        GateError::new(ErrorCode::SchemaViolation, "failed to read policy file").with_source(e)
    })?;

    let is_json = file
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(&content).map_err(|e| {
            GateError::new(ErrorCode::SchemaViolation, "policy JSON is malformed").with_source(e)
        })
    } else {
        serde_yaml::from_str(&content).map_err(|e| {
            GateError::new(ErrorCode::SchemaViolation, "policy YAML is malformed").with_source(e)
        })
    }
}

/// The sibling rollback-registry document path for a resolved policy path
/// (§4.6 — "loaded from a sibling file under the policy directory"). Checked
/// in order; a missing path is left to [`gate_rollback_registry::RollbackRegistry::load`],
/// which treats an absent file as an empty registry.
#[must_use]
pub fn rollback_registry_path(policy_path: &Path) -> std::path::PathBuf {
    let dir = if policy_path.is_dir() { policy_path } else { policy_path.parent().unwrap_or(policy_path) };
    for candidate in ["rollback-registry.yaml", "rollback-registry.yml", "rollback-registry.json"] {
        let candidate_path = dir.join(candidate);
        if candidate_path.is_file() {
            return candidate_path;
        }
    }
    dir.join("rollback-registry.yaml")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
