// SPDX-License-Identifier: MIT OR Apache-2.0
//! gate-driver-llm
#![deny(unsafe_code)]
//!
//! The LLM-Call Driver (§4.7) and its mode-bound Prompt Store: in `Record`
//! mode, call through to a caller-supplied [`LlmProvider`] and persist the
//! exchange as a `NNNN.json` recording; in `Replay` mode, never touch the
//! provider, just consume recordings in ascending index order. `rollback`
//! is always a no-op — replay is deterministic because record is never
//! reapplied.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gate_driver_core::{Driver, Prepared, Receipt};
use gate_error::{ErrorCode, GateError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

/// Injected clock, so recorded timestamps are reproducible in tests.
pub type ClockFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[must_use]
pub fn system_clock() -> ClockFn {
    Arc::new(Utc::now)
}

/// `payload` shape for an `llm.call` intent.
#[derive(Debug, Clone, Deserialize)]
struct LlmCallPayload {
    provider: String,
    model: String,
    prompt: PromptPayload,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct PromptPayload {
    messages: Vec<Message>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct Message {
    role: String,
    content: String,
}

/// A single recorded or replayed token with the timestamp it was emitted at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenEvent {
    pub value: String,
    pub timestamp: DateTime<Utc>,
}

/// The on-disk shape of one `NNNN.json` recording file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Recording {
    provider: String,
    model: String,
    completion: String,
    tokens: Vec<TokenEvent>,
    #[serde(rename = "recordedAt")]
    recorded_at: DateTime<Utc>,
    #[serde(rename = "recordingPath")]
    recording_path: String,
}

/// The seam a caller plugs a real provider client into; the driver itself
/// never knows which vendor API it's talking to.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(
        &self,
        provider: &str,
        model: &str,
        prompt: &Value,
        params: Option<&Value>,
    ) -> Result<String, GateError>;
}

/// Drive mode for the Prompt Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Record,
    Replay,
}

/// Mode-bound store of `NNNN.json` recordings under one directory.
pub struct PromptStore {
    dir: PathBuf,
    mode: StoreMode,
    clock: ClockFn,
    replay_queue: Mutex<VecDeque<PathBuf>>,
}

impl PromptStore {
    /// Open a store rooted at `dir`. In [`StoreMode::Replay`], eagerly lists
    /// and sorts existing `NNNN.json` files into the consumption queue.
    pub fn open(dir: impl Into<PathBuf>, mode: StoreMode, clock: ClockFn) -> Result<Self, GateError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;

        let mut files: Vec<PathBuf> = Vec::new();
        for entry in std::fs::read_dir(&dir).map_err(|e| io_error(&dir, e))? {
            let entry = entry.map_err(|e| io_error(&dir, e))?;
            let path = entry.path();
            if is_recording_name(&path) {
                files.push(path);
            }
        }
        files.sort();

        Ok(Self { dir, mode, clock, replay_queue: Mutex::new(files.into()) })
    }

    #[must_use]
    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    async fn next_index(&self) -> Result<u32, GateError> {
        let mut max_seen: u32 = 0;
        for entry in std::fs::read_dir(&self.dir).map_err(|e| io_error(&self.dir, e))? {
            let entry = entry.map_err(|e| io_error(&self.dir, e))?;
            let path = entry.path();
            if let Some(n) = recording_index(&path) {
                max_seen = max_seen.max(n);
            }
        }
        Ok(max_seen + 1)
    }

    async fn record(
        &self,
        provider: &dyn LlmProvider,
        payload: &LlmCallPayload,
    ) -> Result<Recording, GateError> {
        let prompt_value = serde_json::to_value(&payload.prompt).expect("serializable");
        let completion =
            provider.complete(&payload.provider, &payload.model, &prompt_value, payload.params.as_ref()).await?;

        let timestamp = (self.clock)();
        let tokens: Vec<TokenEvent> = completion
            .chars()
            .map(|ch| TokenEvent { value: ch.to_string(), timestamp })
            .collect();

        let index = self.next_index().await?;
        let file_name = format!("{index:04}.json");
        let recording_path = self.dir.join(&file_name);
        let recorded_at = (self.clock)();

        let recording = Recording {
            provider: payload.provider.clone(),
            model: payload.model.clone(),
            completion,
            tokens,
            recorded_at,
            recording_path: recording_path.to_string_lossy().into_owned(),
        };

        let bytes = serde_json::to_vec_pretty(&recording).expect("serializable");
        std::fs::write(&recording_path, bytes).map_err(|e| io_error(&recording_path, e))?;
        Ok(recording)
    }

    async fn replay(&self) -> Result<Recording, GateError> {
        let mut queue = self.replay_queue.lock().await;
        let path = queue.pop_front().ok_or_else(|| {
            GateError::new(ErrorCode::CommitFailed, "no recorded llm.call remains to replay")
                .with_context("kind", "NoRecordingAvailable")
        })?;
        let bytes = std::fs::read(&path).map_err(|e| io_error(&path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            GateError::new(ErrorCode::CommitFailed, "recorded llm.call file is malformed")
                .with_context("path", path.to_string_lossy().into_owned())
                .with_source(e)
        })
    }
}

fn is_recording_name(path: &Path) -> bool {
    recording_index(path).is_some()
}

fn recording_index(path: &Path) -> Option<u32> {
    let name = path.file_stem()?.to_str()?;
    let ext_ok = path.extension().and_then(|e| e.to_str()) == Some("json");
    if !ext_ok || name.len() != 4 || !name.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

fn io_error(path: &Path, e: std::io::Error) -> GateError {
    GateError::new(ErrorCode::CommitFailed, "prompt store I/O failed")
        .with_context("kind", "IoError")
        .with_context("path", path.to_string_lossy().into_owned())
        .with_source(e)
}

fn parse_payload(payload: &Value) -> Result<LlmCallPayload, GateError> {
    serde_json::from_value(payload.clone()).map_err(|e| {
        GateError::new(ErrorCode::PrepareFailed, "llm.call payload does not match schema")
            .with_source(e)
    })
}

/// The LLM-Call Driver.
pub struct LlmCallDriver {
    store: PromptStore,
    provider: Arc<dyn LlmProvider>,
}

impl LlmCallDriver {
    #[must_use]
    pub fn new(store: PromptStore, provider: Arc<dyn LlmProvider>) -> Self {
        Self { store, provider }
    }
}

#[async_trait]
impl Driver for LlmCallDriver {
    fn name(&self) -> &str {
        "llm.call"
    }

    async fn validate(&self, payload: &Value) -> Result<(), GateError> {
        parse_payload(payload)?;
        Ok(())
    }

    async fn prepare(&self, _idempotency_key: &str, payload: &Value) -> Result<Prepared, GateError> {
        parse_payload(payload)?;
        Ok(Prepared::empty())
    }

    async fn commit(
        &self,
        _idempotency_key: &str,
        payload: &Value,
        _prepared: &Prepared,
    ) -> Result<Receipt, GateError> {
        let parsed = parse_payload(payload)?;

        let (recording, source) = match self.store.mode() {
            StoreMode::Record => (self.store.record(self.provider.as_ref(), &parsed).await?, "record"),
            StoreMode::Replay => (self.store.replay().await?, "replay"),
        };

        Ok(Receipt::new(serde_json::json!({
            "provider": recording.provider,
            "model": recording.model,
            "completion": recording.completion,
            "tokens": recording.tokens,
            "recordedAt": recording.recorded_at,
            "source": source,
            "recordingPath": recording.recording_path,
        })))
    }

    async fn rollback(
        &self,
        _idempotency_key: &str,
        _payload: &Value,
        _prepared: &Prepared,
    ) -> Result<(), GateError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixed_clock() -> ClockFn {
        Arc::new(|| DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc))
    }

    struct StubProvider {
        calls: AtomicUsize,
        reply: String,
    }

    #[async_trait]
    impl LlmProvider for StubProvider {
        async fn complete(
            &self,
            _provider: &str,
            _model: &str,
            _prompt: &Value,
            _params: Option<&Value>,
        ) -> Result<String, GateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    fn sample_payload() -> Value {
        json!({
            "provider": "acme",
            "model": "acme-large",
            "prompt": {"messages": [{"role": "user", "content": "hi"}]},
        })
    }

    #[tokio::test]
    async fn record_mode_calls_provider_and_writes_recording() {
        let dir = tempfile::tempdir().unwrap();
        let store = PromptStore::open(dir.path(), StoreMode::Record, fixed_clock()).unwrap();
        let provider = Arc::new(StubProvider { calls: AtomicUsize::new(0), reply: "hi!".to_string() });
        let driver = LlmCallDriver::new(store, provider.clone());

        let payload = sample_payload();
        let prepared = driver.prepare("key-1", &payload).await.unwrap();
        let receipt = driver.commit("key-1", &payload, &prepared).await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(receipt.value().get("completion").unwrap(), "hi!");
        assert_eq!(receipt.value().get("source").unwrap(), "record");
        assert_eq!(receipt.value().get("tokens").unwrap().as_array().unwrap().len(), 3);
        assert!(dir.path().join("0001.json").exists());
    }

    #[tokio::test]
    async fn replay_mode_never_calls_provider() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = PromptStore::open(dir.path(), StoreMode::Record, fixed_clock()).unwrap();
            let provider =
                Arc::new(StubProvider { calls: AtomicUsize::new(0), reply: "recorded".to_string() });
            let driver = LlmCallDriver::new(store, provider);
            let payload = sample_payload();
            let prepared = driver.prepare("key-1", &payload).await.unwrap();
            driver.commit("key-1", &payload, &prepared).await.unwrap();
        }

        let store = PromptStore::open(dir.path(), StoreMode::Replay, fixed_clock()).unwrap();
        let provider = Arc::new(StubProvider { calls: AtomicUsize::new(0), reply: "unused".to_string() });
        let driver = LlmCallDriver::new(store, provider.clone());
        let payload = sample_payload();
        let prepared = driver.prepare("key-1", &payload).await.unwrap();
        let receipt = driver.commit("key-1", &payload, &prepared).await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert_eq!(receipt.value().get("completion").unwrap(), "recorded");
        assert_eq!(receipt.value().get("source").unwrap(), "replay");
    }

    #[tokio::test]
    async fn replay_consumes_recordings_in_ascending_index_order() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = PromptStore::open(dir.path(), StoreMode::Record, fixed_clock()).unwrap();
            let provider = Arc::new(StubProvider { calls: AtomicUsize::new(0), reply: "a".to_string() });
            let driver = LlmCallDriver::new(store, provider);
            let payload = sample_payload();
            let prepared = driver.prepare("key-1", &payload).await.unwrap();
            driver.commit("key-1", &payload, &prepared).await.unwrap();
        }
        {
            let store = PromptStore::open(dir.path(), StoreMode::Record, fixed_clock()).unwrap();
            let provider = Arc::new(StubProvider { calls: AtomicUsize::new(0), reply: "b".to_string() });
            let driver = LlmCallDriver::new(store, provider);
            let payload = sample_payload();
            let prepared = driver.prepare("key-2", &payload).await.unwrap();
            driver.commit("key-2", &payload, &prepared).await.unwrap();
        }

        let store = PromptStore::open(dir.path(), StoreMode::Replay, fixed_clock()).unwrap();
        let provider = Arc::new(StubProvider { calls: AtomicUsize::new(0), reply: "unused".to_string() });
        let driver = LlmCallDriver::new(store, provider);
        let payload = sample_payload();

        let prepared = driver.prepare("key-1", &payload).await.unwrap();
        let first = driver.commit("key-1", &payload, &prepared).await.unwrap();
        assert_eq!(first.value().get("completion").unwrap(), "a");

        let prepared = driver.prepare("key-2", &payload).await.unwrap();
        let second = driver.commit("key-2", &payload, &prepared).await.unwrap();
        assert_eq!(second.value().get("completion").unwrap(), "b");
    }

    #[tokio::test]
    async fn replay_exhaustion_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = PromptStore::open(dir.path(), StoreMode::Replay, fixed_clock()).unwrap();
        let provider = Arc::new(StubProvider { calls: AtomicUsize::new(0), reply: "unused".to_string() });
        let driver = LlmCallDriver::new(store, provider);
        let payload = sample_payload();
        let prepared = driver.prepare("key-1", &payload).await.unwrap();
        let err = driver.commit("key-1", &payload, &prepared).await.unwrap_err();
        assert_eq!(err.context().get("kind").unwrap(), "NoRecordingAvailable");
    }
}
