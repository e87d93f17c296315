// SPDX-License-Identifier: MIT OR Apache-2.0
//! gate-replay
#![deny(unsafe_code)]
//!
//! The Replay Verifier (§4.11): reconstructs the filesystem a recorded run
//! started from, hands it and the run's network log to a caller-supplied
//! [`Collaborator`] (the sandbox runner and allowlist proxy are out of
//! scope here — see §1), and compares the collaborator's stdout/stderr
//! byte-for-byte against what was recorded.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gate_bundle::Bundle;
use gate_error::{ErrorCode, GateError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A filesystem tree reconstructed from a bundle's `fsDiff` component.
/// Lives under a temporary directory that is removed when dropped.
pub struct ReconstructedFs {
    root: PathBuf,
    _dir: tempfile::TempDir,
}

impl ReconstructedFs {
    /// The root of the reconstructed tree.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Reconstruct `fsDiff.base + fsDiff.files - fsDiff.deleted` into a fresh
/// temporary directory: extract `base.tar`, overwrite with each diff file,
/// then remove every deleted path.
pub fn reconstruct_filesystem(bundle: &Bundle) -> Result<ReconstructedFs, GateError> {
    let dir = tempfile::tempdir().map_err(|e| io_error("create reconstruction dir", e))?;
    let root = dir.path().to_path_buf();

    if let Some(base_tar) = bundle.entry("fs-diff/base.tar") {
        let mut archive = tar::Archive::new(base_tar);
        archive.unpack(&root).map_err(|e| io_error("unpack fs-diff/base.tar", e))?;
    }

    let files_prefix = "diff/files/";
    for (relpath, bytes) in bundle.entries_under("fs-diff") {
        let Some(relpath) = relpath.strip_prefix(files_prefix) else {
            continue;
        };
        let dest = root.join(relpath);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_error("create diff parent dir", e))?;
        }
        write_atomic(&dest, bytes).map_err(|e| io_error("write diff file", e))?;
    }

    if let Some(deleted_bytes) = bundle.entry("fs-diff/diff/deleted.json") {
        let deleted: Vec<String> = serde_json::from_slice(deleted_bytes).map_err(|e| {
            GateError::new(ErrorCode::BundleInvalid, "fs-diff/diff/deleted.json is not a JSON string array")
                .with_source(e)
        })?;
        for relpath in deleted {
            let target = root.join(&relpath);
            if target.is_file() {
                std::fs::remove_file(&target).map_err(|e| io_error("remove deleted file", e))?;
            }
        }
    }

    Ok(ReconstructedFs { root, _dir: dir })
}

fn write_atomic(dest: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = dest.with_extension("gate-replay-tmp");
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, dest)
}

fn io_error(stage: &'static str, e: std::io::Error) -> GateError {
    GateError::new(ErrorCode::BundleInvalid, "replay filesystem reconstruction failed")
        .with_context("stage", stage)
        .with_source(e)
}

/// The captured result of running the recorded agent against a
/// reconstructed filesystem and replayed network log.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// The external sandbox runner and allowlist proxy this crate plugs into.
/// Both are out of scope (§1); this trait is the seam a caller implements
/// against a real sandbox/proxy pair.
#[async_trait]
pub trait Collaborator: Send + Sync {
    /// Start the allowlist proxy in replay mode against the recorded HAR.
    async fn start_proxy(&self, network_har: &Value) -> Result<(), GateError>;

    /// Launch the recorded agent against `root`, seeded with the recorded
    /// clock, and return its captured output.
    async fn run_agent(&self, root: &Path, clock_seed: &Value, start_time: DateTime<Utc>) -> Result<ProcessOutput, GateError>;

    /// Stop the allowlist proxy. Called even if `run_agent` failed.
    async fn stop_proxy(&self) -> Result<(), GateError>;
}

/// Which stream a [`FirstDiff`] was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    Stdout,
    Stderr,
}

/// The first line at which recorded and replayed output diverge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirstDiff {
    pub kind: DiffKind,
    pub line: usize,
    pub expected: String,
    pub actual: String,
}

/// The outcome of one replay run (§4.11).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResult {
    pub success: bool,
    pub stdout_matches: bool,
    pub stderr_matches: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_diff: Option<FirstDiff>,
    pub exit_code: i32,
}

/// Run the full replay verification: reconstruct the filesystem, drive the
/// collaborator, and diff its output against the recorded logs.
pub async fn replay(bundle: &Bundle, collaborator: &dyn Collaborator) -> Result<ReplayResult, GateError> {
    let fs = reconstruct_filesystem(bundle)?;
    let network_har = bundle.network_har()?;
    let clock_seed: Value = bundle
        .entry("clock.json")
        .map(|bytes| serde_json::from_slice(bytes))
        .transpose()
        .map_err(|e| GateError::new(ErrorCode::BundleInvalid, "clock.json is not valid JSON").with_source(e))?
        .unwrap_or(Value::Null);
    let start_time = clock_seed
        .get("startedAt")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    collaborator.start_proxy(&network_har).await?;
    let output = collaborator.run_agent(fs.root(), &clock_seed, start_time).await;
    collaborator.stop_proxy().await?;
    let output = output?;

    let recorded_stdout = bundle.entry("logs/stdout.log").unwrap_or(&[]);
    let recorded_stderr = bundle.entry("logs/stderr.log").unwrap_or(&[]);

    let stdout_diff = first_diff(DiffKind::Stdout, recorded_stdout, &output.stdout);
    let stderr_diff = first_diff(DiffKind::Stderr, recorded_stderr, &output.stderr);

    let stdout_matches = stdout_diff.is_none();
    let stderr_matches = stderr_diff.is_none();
    let first_diff = stdout_diff.or(stderr_diff);

    Ok(ReplayResult {
        success: stdout_matches && stderr_matches,
        stdout_matches,
        stderr_matches,
        first_diff,
        exit_code: output.exit_code,
    })
}

/// Line-by-line comparison of recorded vs. replayed byte streams, returning
/// the first line at which they diverge, if any. Treats a `b""` haystack
/// and a nonempty `b""` needle of equal length as equal (for length-zero
/// streams both sides agree trivially).
fn first_diff(kind: DiffKind, expected: &[u8], actual: &[u8]) -> Option<FirstDiff> {
    if expected == actual {
        return None;
    }
    let expected_lines: Vec<&[u8]> = expected.split(|&b| b == b'\n').collect();
    let actual_lines: Vec<&[u8]> = actual.split(|&b| b == b'\n').collect();

    let max_lines = expected_lines.len().max(actual_lines.len());
    for line in 0..max_lines {
        let e = expected_lines.get(line).copied().unwrap_or(&[]);
        let a = actual_lines.get(line).copied().unwrap_or(&[]);
        if e != a {
            return Some(FirstDiff {
                kind,
                line,
                expected: String::from_utf8_lossy(e).into_owned(),
                actual: String::from_utf8_lossy(a).into_owned(),
            });
        }
    }
    None
}

/// A stub [`Collaborator`] useful for tests that don't exercise a real
/// sandbox: returns fixed output and never touches the network.
#[derive(Debug, Clone, Default)]
pub struct FixedOutputCollaborator {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

#[async_trait]
impl Collaborator for FixedOutputCollaborator {
    async fn start_proxy(&self, _network_har: &Value) -> Result<(), GateError> {
        Ok(())
    }

    async fn run_agent(&self, _root: &Path, _clock_seed: &Value, _start_time: DateTime<Utc>) -> Result<ProcessOutput, GateError> {
        Ok(ProcessOutput { stdout: self.stdout.clone(), stderr: self.stderr.clone(), exit_code: self.exit_code })
    }

    async fn stop_proxy(&self) -> Result<(), GateError> {
        Ok(())
    }
}
