// SPDX-License-Identifier: MIT OR Apache-2.0
//! gate-journal
#![deny(unsafe_code)]
//!
//! The append-only intent journal: one JSONL file, one writer, a monotonic
//! 12-digit ID sequence, and an idempotency index that collapses retried
//! `append` calls to a single committed entry. Reopening a journal file
//! replays its entries and continues numbering where the previous process
//! left off.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gate_core::{format_journal_id, JournalEntry, JournalStatus};
use gate_driver_core::Driver;
use gate_error::{ErrorCode, GateError};
use serde_json::Value;
use tokio::sync::Mutex;

/// A clock function injected at construction so tests can supply constant or
/// stepped time instead of `Utc::now()`.
pub type ClockFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The default clock: wall-clock `Utc::now()`.
#[must_use]
pub fn system_clock() -> ClockFn {
    Arc::new(Utc::now)
}

struct JournalState {
    entries: Vec<JournalEntry>,
    committed_index: HashMap<String, usize>,
    next_seq: u64,
    file: File,
}

/// An append-only journal bound to a single file path, single writer,
/// serialized through an internal async mutex.
pub struct Journal {
    path: PathBuf,
    state: Mutex<JournalState>,
    clock: ClockFn,
    #[allow(dead_code)]
    lock_file: File,
}

fn journal_io_error(message: &str, e: std::io::Error) -> GateError {
    GateError::new(ErrorCode::JournalIoError, message).with_source(e)
}

fn parse_error(message: &str, e: serde_json::Error) -> GateError {
    GateError::new(ErrorCode::JournalParseError, message).with_source(e)
}

impl Journal {
    /// Open (creating if absent) the journal file at `path`, replay its
    /// entries, and take an exclusive cross-process advisory lock on a
    /// sibling `.lock` file for the lifetime of this handle.
    pub fn open(path: &Path, clock: ClockFn) -> Result<Self, GateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| journal_io_error("failed to create journal directory", e))?;
        }

        let lock_path = lock_path_for(path);
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| journal_io_error("failed to open journal lock file", e))?;
        fs2::FileExt::try_lock_exclusive(&lock_file)
            .map_err(|e| journal_io_error("journal is already open by another writer", e))?;

        let entries = if path.exists() {
            read_entries(path)?
        } else {
            Vec::new()
        };

        let mut committed_index = HashMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            if entry.status == JournalStatus::Committed {
                committed_index.insert(entry.idempotency_key.clone(), idx);
            }
        }

        let next_seq = entries
            .last()
            .and_then(|e| e.id.parse::<u64>().ok())
            .map_or(1, |id| id + 1);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| journal_io_error("failed to open journal file for appending", e))?;

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(JournalState {
                entries,
                committed_index,
                next_seq,
                file,
            }),
            clock,
            lock_file,
        })
    }

    /// The journal file path this instance is bound to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every entry currently held in memory, in append order.
    pub async fn entries(&self) -> Vec<JournalEntry> {
        self.state.lock().await.entries.clone()
    }

    /// The committed entry for `idempotency_key`, if one exists.
    pub async fn find_committed(&self, idempotency_key: &str) -> Option<JournalEntry> {
        let state = self.state.lock().await;
        state
            .committed_index
            .get(idempotency_key)
            .map(|&idx| state.entries[idx].clone())
    }

    /// Drive `payload` through `driver`'s two-phase contract and append the
    /// resulting entry.
    ///
    /// At-most-once: if a committed entry already exists for
    /// `idempotency_key`, it is returned unchanged and `driver` is never
    /// invoked.
    pub async fn append(
        &self,
        intent_type: &str,
        idempotency_key: &str,
        payload: Value,
        metadata: Option<Value>,
        driver: &dyn Driver,
    ) -> Result<JournalEntry, GateError> {
        let mut state = self.state.lock().await;

        if let Some(&idx) = state.committed_index.get(idempotency_key) {
            return Ok(state.entries[idx].clone());
        }

        driver.plan(&payload).await?;
        driver.validate(&payload).await?;

        let prepared = match driver.prepare(idempotency_key, &payload).await {
            Ok(p) => p,
            Err(e) => {
                let entry = self.build_entry(
                    &mut state,
                    intent_type,
                    idempotency_key,
                    payload,
                    metadata,
                    None,
                    JournalStatus::RolledBack,
                    Some(error_detail(&e)),
                );
                self.persist(&mut state, &entry)?;
                return Err(e);
            }
        };

        match driver.commit(idempotency_key, &payload, &prepared).await {
            Ok(receipt) => {
                let entry = self.build_entry(
                    &mut state,
                    intent_type,
                    idempotency_key,
                    payload,
                    metadata,
                    Some(receipt.into_value()),
                    JournalStatus::Committed,
                    None,
                );
                self.persist(&mut state, &entry)?;
                let idx = state.entries.len() - 1;
                state.committed_index.insert(idempotency_key.to_string(), idx);
                Ok(entry)
            }
            Err(e) => {
                if let Err(rollback_err) = driver.rollback(idempotency_key, &payload, &prepared).await {
                    tracing::warn!(
                        error = %rollback_err,
                        intent_type,
                        idempotency_key,
                        "rollback after failed commit also failed"
                    );
                }
                let entry = self.build_entry(
                    &mut state,
                    intent_type,
                    idempotency_key,
                    payload,
                    metadata,
                    None,
                    JournalStatus::RolledBack,
                    Some(error_detail(&e)),
                );
                self.persist(&mut state, &entry)?;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_entry(
        &self,
        state: &mut JournalState,
        intent_type: &str,
        idempotency_key: &str,
        payload: Value,
        metadata: Option<Value>,
        receipt: Option<Value>,
        status: JournalStatus,
        error: Option<Value>,
    ) -> JournalEntry {
        let seq = state.next_seq;
        state.next_seq += 1;
        JournalEntry {
            id: format_journal_id(seq),
            intent_type: intent_type.to_string(),
            idempotency_key: idempotency_key.to_string(),
            payload,
            receipt,
            timestamp: (self.clock)(),
            status,
            metadata,
            error,
        }
    }

    fn persist(&self, state: &mut JournalState, entry: &JournalEntry) -> Result<(), GateError> {
        let mut line =
            serde_json::to_vec(entry).map_err(|e| parse_error("failed to serialize journal entry", e))?;
        line.push(b'\n');
        state
            .file
            .write_all(&line)
            .map_err(|e| journal_io_error("failed to append journal entry", e))?;
        state
            .file
            .sync_all()
            .map_err(|e| journal_io_error("failed to fsync journal entry", e))?;
        state.entries.push(entry.clone());
        Ok(())
    }
}

fn error_detail(e: &GateError) -> Value {
    serde_json::json!({
        "code": e.code().as_str(),
        "message": e.message(),
    })
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Parse every complete, newline-terminated line in `path` as a
/// [`JournalEntry`]. A trailing line with no terminating `\n` (a partial
/// write) is dropped rather than admitted, per the strict newline-framed
/// parsing policy.
fn read_entries(path: &Path) -> Result<Vec<JournalEntry>, GateError> {
    let file = File::open(path).map_err(|e| journal_io_error("failed to open journal file", e))?;
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| journal_io_error("failed to read journal file", e))?;
        if read == 0 {
            break;
        }
        if !line.ends_with('\n') {
            // Partial trailing write from a crash mid-append; not admitted.
            break;
        }
        let trimmed = line.trim_end_matches('\n');
        if trimmed.is_empty() {
            continue;
        }
        let entry: JournalEntry = serde_json::from_str(trimmed)
            .map_err(|e| parse_error("journal file contains a malformed entry", e))?;
        entries.push(entry);
    }
    Ok(entries)
}
