// SPDX-License-Identifier: MIT OR Apache-2.0
//! gate-error
#![deny(unsafe_code)]
//!
//! One crate-wide error type used by every layer of the transaction gate
//! instead of ad hoc `String` errors. Each [`GateError`] carries a stable
//! machine-readable [`ErrorCode`], a human message, an optional source error,
//! and structured context so HTTP/CLI surfaces can emit machine-readable
//! payloads without re-parsing the message.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Grouping of [`ErrorCode`] variants by subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Policy,
    Journal,
    Driver,
    Replay,
    Io,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Policy => "policy",
            Self::Journal => "journal",
            Self::Driver => "driver",
            Self::Replay => "replay",
            Self::Io => "io",
        };
        f.write_str(s)
    }
}

/// Stable, machine-readable error codes per §7 of the taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BundleInvalid,
    SchemaViolation,
    ManifestMalformed,
    DuplicateIntentId,
    PolicyDenied,
    ApprovalRequired,
    JournalParseError,
    JournalIoError,
    DriverUnregistered,
    PrepareFailed,
    CommitFailed,
    RollbackFailed,
    NonReversible,
    ReplayDiff,
    ReplayExitNonZero,
    HttpError,
    TimedOut,
    Cancelled,
}

/// All known error codes, for exhaustive enumeration in tests and docs.
pub const ALL_CODES: &[ErrorCode] = &[
    ErrorCode::BundleInvalid,
    ErrorCode::SchemaViolation,
    ErrorCode::ManifestMalformed,
    ErrorCode::DuplicateIntentId,
    ErrorCode::PolicyDenied,
    ErrorCode::ApprovalRequired,
    ErrorCode::JournalParseError,
    ErrorCode::JournalIoError,
    ErrorCode::DriverUnregistered,
    ErrorCode::PrepareFailed,
    ErrorCode::CommitFailed,
    ErrorCode::RollbackFailed,
    ErrorCode::NonReversible,
    ErrorCode::ReplayDiff,
    ErrorCode::ReplayExitNonZero,
    ErrorCode::HttpError,
    ErrorCode::TimedOut,
    ErrorCode::Cancelled,
];

impl ErrorCode {
    /// The subsystem this code belongs to.
    #[must_use]
    pub fn category(self) -> ErrorCategory {
        match self {
            Self::BundleInvalid
            | Self::SchemaViolation
            | Self::ManifestMalformed
            | Self::DuplicateIntentId => ErrorCategory::Validation,
            Self::PolicyDenied | Self::ApprovalRequired => ErrorCategory::Policy,
            Self::JournalParseError | Self::JournalIoError => ErrorCategory::Journal,
            Self::DriverUnregistered
            | Self::PrepareFailed
            | Self::CommitFailed
            | Self::RollbackFailed
            | Self::NonReversible => ErrorCategory::Driver,
            Self::ReplayDiff | Self::ReplayExitNonZero => ErrorCategory::Replay,
            Self::HttpError | Self::TimedOut | Self::Cancelled => ErrorCategory::Io,
        }
    }

    /// Stable `SCREAMING_SNAKE_CASE` string form, as used in HTTP/CLI output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BundleInvalid => "BUNDLE_INVALID",
            Self::SchemaViolation => "SCHEMA_VIOLATION",
            Self::ManifestMalformed => "MANIFEST_MALFORMED",
            Self::DuplicateIntentId => "DUPLICATE_INTENT_ID",
            Self::PolicyDenied => "POLICY_DENIED",
            Self::ApprovalRequired => "APPROVAL_REQUIRED",
            Self::JournalParseError => "JOURNAL_PARSE_ERROR",
            Self::JournalIoError => "JOURNAL_IO_ERROR",
            Self::DriverUnregistered => "DRIVER_UNREGISTERED",
            Self::PrepareFailed => "PREPARE_FAILED",
            Self::CommitFailed => "COMMIT_FAILED",
            Self::RollbackFailed => "ROLLBACK_FAILED",
            Self::NonReversible => "NON_REVERSIBLE",
            Self::ReplayDiff => "REPLAY_DIFF",
            Self::ReplayExitNonZero => "REPLAY_EXIT_NON_ZERO",
            Self::HttpError => "HTTP_ERROR",
            Self::TimedOut => "TIMED_OUT",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The crate-wide error type. Carries a [`ErrorCode`], a human message, an
/// optional boxed source error, and a context map for structured fields
/// (offending intent ID, component name, reasons list, ...).
pub struct GateError {
    code: ErrorCode,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    context: BTreeMap<String, Value>,
}

impl GateError {
    /// Construct a new error with `code` and a human-readable `message`.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a structured context field. Values that fail to serialize are
    /// silently dropped rather than panicking.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach a source error for `source()`/`Debug` purposes.
    #[must_use]
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn context(&self) -> &BTreeMap<String, Value> {
        &self.context
    }

    /// Sorted, deduplicated list of strings found under the `"reasons"`
    /// context key, if present and shaped as an array of strings.
    #[must_use]
    pub fn reasons(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .context
            .get("reasons")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        out.sort();
        out.dedup();
        out
    }
}

impl fmt::Debug for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("GateError");
        dbg.field("code", &self.code.as_str());
        dbg.field("message", &self.message);
        if let Some(src) = &self.source {
            dbg.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            dbg.field("context", &self.context);
        }
        dbg.finish()
    }
}

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            write!(f, " {}", Value::Object(self.context.clone().into_iter().collect()))?;
        }
        Ok(())
    }
}

impl std::error::Error for GateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Serialization-friendly projection of a [`GateError`] for HTTP/CLI payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateErrorDto {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub context: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub source_message: Option<String>,
}

impl From<&GateError> for GateErrorDto {
    fn from(e: &GateError) -> Self {
        Self {
            code: e.code,
            message: e.message.clone(),
            context: e.context.clone(),
            source_message: e.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<GateError> for GateErrorDto {
    fn from(e: GateError) -> Self {
        Self::from(&e)
    }
}

/// Convenience constructors for the most frequently raised codes.
impl GateError {
    #[must_use]
    pub fn bundle_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BundleInvalid, message)
    }

    #[must_use]
    pub fn policy_denied(reasons: Vec<String>) -> Self {
        let mut reasons = reasons;
        reasons.sort();
        reasons.dedup();
        Self::new(ErrorCode::PolicyDenied, "policy denied the bundle")
            .with_context("reasons", reasons)
    }

    #[must_use]
    pub fn approval_required() -> Self {
        Self::new(
            ErrorCode::ApprovalRequired,
            "bundle requires approval before it can be committed",
        )
    }

    #[must_use]
    pub fn duplicate_intent_id(id: impl Into<String>) -> Self {
        Self::new(ErrorCode::DuplicateIntentId, "duplicate intent id in bundle")
            .with_context("intentId", id.into())
    }

    #[must_use]
    pub fn non_reversible(intent_id: impl Into<String>) -> Self {
        Self::new(ErrorCode::NonReversible, "intent has no derivable rollback")
            .with_context("intentId", intent_id.into())
    }
}
