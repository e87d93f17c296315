// SPDX-License-Identifier: MIT OR Apache-2.0
//! gate-driver-core
#![deny(unsafe_code)]
//!
//! The abstract two-phase-commit contract the Intent Journal drives, plus a
//! name-keyed registry of driver instances. Every concrete driver crate
//! (`gate-driver-file`, `gate-driver-http`, `gate-driver-llm`, and any
//! caller-registered custom driver) implements [`Driver`] against this one
//! trait so the journal never has to know what kind of side effect it is
//! sequencing.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use gate_error::GateError;
use serde_json::Value;

/// Compensating state captured during `prepare`, opaque to the journal.
/// Concrete drivers stash whatever they need to undo their `commit` here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prepared(pub Value);

impl Prepared {
    /// Wrap an arbitrary serializable value as prepared state.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// The empty prepared state, for drivers with nothing to capture.
    #[must_use]
    pub fn empty() -> Self {
        Self(Value::Null)
    }

    /// Borrow the underlying JSON value.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.0
    }
}

/// Opaque evidence that a driver committed, sufficient to drive rollback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Receipt(pub Value);

impl Receipt {
    /// Wrap an arbitrary serializable value as a receipt.
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Borrow the underlying JSON value.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Consume the receipt, returning the underlying JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.0
    }
}

/// The uniform two-phase contract every side-effecting driver implements.
///
/// `plan` and `validate` are read-only pre-checks: failures here are never
/// persisted to the journal. `prepare` is the only phase allowed to capture
/// compensating state; drivers must not mutate external state during
/// `prepare` unless that mutation is itself recorded in the returned
/// [`Prepared`]. `commit` performs the side effect and returns a [`Receipt`].
/// `rollback` undoes a committed (or partially prepared) side effect using
/// only the `Prepared` state, best-effort.
#[async_trait]
pub trait Driver: Send + Sync {
    /// The driver name, used as the registry key and as an intent's `type`.
    fn name(&self) -> &str;

    /// Read-only pre-check before any state is captured. Default: no-op.
    async fn plan(&self, _payload: &Value) -> Result<(), GateError> {
        Ok(())
    }

    /// Read-only schema/semantic validation. Default: no-op.
    async fn validate(&self, _payload: &Value) -> Result<(), GateError> {
        Ok(())
    }

    /// Capture whatever compensating state `rollback` will need, before any
    /// external side effect happens. `idempotency_key` is the journal's key
    /// for this intent, available here so drivers that stamp an
    /// `Idempotency-Key` header (or equivalent) can do so during `prepare`.
    async fn prepare(&self, idempotency_key: &str, payload: &Value) -> Result<Prepared, GateError>;

    /// Perform the side effect and return opaque evidence of it.
    async fn commit(
        &self,
        idempotency_key: &str,
        payload: &Value,
        prepared: &Prepared,
    ) -> Result<Receipt, GateError>;

    /// Best-effort compensation using only the captured `Prepared` state.
    /// Invoked by the Intent Journal itself when `commit` fails right after a
    /// successful `prepare` (§4.3) — `prepared` is always the value this same
    /// call's `prepare` just returned.
    async fn rollback(
        &self,
        idempotency_key: &str,
        payload: &Value,
        prepared: &Prepared,
    ) -> Result<(), GateError>;

    /// Compensate an already-committed intent using only its persisted
    /// [`Receipt`] (§4.10 Revert). Unlike `rollback`, this runs long after
    /// `prepare`'s captured state is gone — the receipt itself must carry
    /// whatever `revert` needs. Default: no-op, for drivers whose receipt
    /// shape (as specified) does not carry enough to compensate after the
    /// fact; such intents are effectively non-reversible once committed.
    async fn revert(
        &self,
        _idempotency_key: &str,
        _payload: &Value,
        _receipt: &Receipt,
    ) -> Result<(), GateError> {
        Ok(())
    }
}

/// A name-keyed collection of driver instances, consulted by the journal and
/// the orchestrator to dispatch an intent's `type` to its implementation.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `driver` under its own [`Driver::name`]. A later registration
    /// for the same name replaces the earlier one.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    /// Look up a driver by intent type string.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(name).cloned()
    }

    /// Resolve a driver or return a [`gate_error::ErrorCode::DriverUnregistered`] error.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Driver>, GateError> {
        self.get(name).ok_or_else(|| {
            GateError::new(
                gate_error::ErrorCode::DriverUnregistered,
                "no driver registered for intent type",
            )
            .with_context("intentType", name)
        })
    }

    /// Names of every registered driver, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.drivers.keys().map(String::as_str).collect()
    }
}
