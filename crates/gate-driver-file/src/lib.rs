// SPDX-License-Identifier: MIT OR Apache-2.0
//! gate-driver-file
#![deny(unsafe_code)]
//!
//! The File-Write Driver: captures the prior content, mode, and hash of a
//! path before overwriting it, so that `rollback` can restore exactly what
//! was there (or remove the file, if it didn't exist before).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use gate_driver_core::{Driver, Prepared, Receipt};
use gate_error::{ErrorCode, GateError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

const BASE64: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::STANDARD;

/// `payload` shape for a `file.write` intent.
#[derive(Debug, Clone, Deserialize)]
struct FileWritePayload {
    path: String,
    content: String,
    #[serde(default)]
    mode: Option<u32>,
}

/// State captured by `prepare`, sufficient for `rollback` to undo a write.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileWritePrepared {
    path: String,
    existed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prior_content_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prior_mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prior_hash: Option<String>,
}

/// The File-Write Driver.
pub struct FileWriteDriver;

impl Default for FileWriteDriver {
    fn default() -> Self {
        Self
    }
}

fn parse_payload(payload: &Value) -> Result<FileWritePayload, GateError> {
    serde_json::from_value(payload.clone()).map_err(|e| {
        GateError::new(ErrorCode::PrepareFailed, "file.write payload does not match schema")
            .with_context("kind", "PathInvalid")
            .with_source(e)
    })
}

fn resolve_path(raw: &str) -> Result<PathBuf, GateError> {
    if raw.trim().is_empty() {
        return Err(
            GateError::new(ErrorCode::PrepareFailed, "empty file path").with_context("kind", "PathInvalid")
        );
    }
    Ok(PathBuf::from(raw))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl Driver for FileWriteDriver {
    fn name(&self) -> &str {
        "file.write"
    }

    async fn validate(&self, payload: &Value) -> Result<(), GateError> {
        parse_payload(payload)?;
        Ok(())
    }

    async fn prepare(&self, _idempotency_key: &str, payload: &Value) -> Result<Prepared, GateError> {
        let parsed = parse_payload(payload)?;
        let path = resolve_path(&parsed.path)?;

        if path.exists() {
            if !path.is_file() {
                return Err(GateError::new(ErrorCode::PrepareFailed, "path exists but is not a file")
                    .with_context("kind", "NotAFile")
                    .with_context("path", parsed.path.clone()));
            }
            let bytes = std::fs::read(&path).map_err(|e| io_error(&parsed.path, e))?;
            let metadata = std::fs::metadata(&path).map_err(|e| io_error(&parsed.path, e))?;
            let prepared = FileWritePrepared {
                path: parsed.path.clone(),
                existed: true,
                prior_content_b64: Some(BASE64.encode(&bytes)),
                prior_mode: Some(file_mode(&metadata)),
                prior_hash: Some(sha256_hex(&bytes)),
            };
            Ok(Prepared::new(serde_json::to_value(prepared).expect("serializable")))
        } else {
            let prepared = FileWritePrepared {
                path: parsed.path.clone(),
                existed: false,
                prior_content_b64: None,
                prior_mode: None,
                prior_hash: None,
            };
            Ok(Prepared::new(serde_json::to_value(prepared).expect("serializable")))
        }
    }

    async fn commit(
        &self,
        _idempotency_key: &str,
        payload: &Value,
        prepared: &Prepared,
    ) -> Result<Receipt, GateError> {
        let parsed = parse_payload(payload)?;
        let path = resolve_path(&parsed.path)?;
        let prepared: FileWritePrepared = serde_json::from_value(prepared.value().clone())
            .map_err(|e| commit_error(&parsed.path, e.to_string()))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| io_error(&parsed.path, e))?;
            }
        }

        let new_bytes = parsed.content.as_bytes();
        write_atomic(&path, new_bytes).map_err(|e| io_error(&parsed.path, e))?;
        if let Some(mode) = parsed.mode {
            apply_mode(&path, mode).map_err(|e| io_error(&parsed.path, e))?;
        }

        let new_hash = sha256_hex(new_bytes);
        Ok(Receipt::new(serde_json::json!({
            "path": parsed.path,
            "sha256": new_hash,
            "previousHash": prepared.prior_hash,
        })))
    }

    async fn rollback(
        &self,
        _idempotency_key: &str,
        _payload: &Value,
        prepared: &Prepared,
    ) -> Result<(), GateError> {
        let prepared: FileWritePrepared = serde_json::from_value(prepared.value().clone())
            .map_err(|e| commit_error("<unknown>", e.to_string()))?;
        let path = PathBuf::from(&prepared.path);

        if prepared.existed {
            let bytes = prepared
                .prior_content_b64
                .as_deref()
                .map(|b64| BASE64.decode(b64))
                .transpose()
                .map_err(|e| {
                    GateError::new(ErrorCode::RollbackFailed, "prior content is not valid base64")
                        .with_source(e)
                })?
                .unwrap_or_default();
            write_atomic(&path, &bytes).map_err(|e| io_error(&prepared.path, e))?;
            if let Some(mode) = prepared.prior_mode {
                apply_mode(&path, mode).map_err(|e| io_error(&prepared.path, e))?;
            }
        } else if path.exists() {
            std::fs::remove_file(&path).map_err(|e| io_error(&prepared.path, e))?;
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(
        ".{}.gate-tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("write")
    ));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn io_error(path: &str, e: std::io::Error) -> GateError {
    GateError::new(ErrorCode::CommitFailed, "file I/O failed")
        .with_context("kind", "IoError")
        .with_context("path", path)
        .with_source(e)
}

fn commit_error(path: &str, message: String) -> GateError {
    GateError::new(ErrorCode::CommitFailed, "prepared state is malformed")
        .with_context("path", path)
        .with_context("detail", message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn writing_a_new_file_then_rolling_back_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        let driver = FileWriteDriver;
        let payload = json!({"path": path.to_str().unwrap(), "content": "new-content"});

        let prepared = driver.prepare("key-1", &payload).await.unwrap();
        let receipt = driver.commit("key-1", &payload, &prepared).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new-content");
        assert!(receipt.value().get("previousHash").unwrap().is_null());

        driver.rollback("key-1", &payload, &prepared).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn writing_over_existing_file_then_rolling_back_restores_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "baseline").unwrap();

        let driver = FileWriteDriver;
        let payload = json!({"path": path.to_str().unwrap(), "content": "new-content"});

        let prepared = driver.prepare("key-1", &payload).await.unwrap();
        driver.commit("key-1", &payload, &prepared).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new-content");

        driver.rollback("key-1", &payload, &prepared).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "baseline");
    }

    #[tokio::test]
    async fn commit_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/note.txt");
        let driver = FileWriteDriver;
        let payload = json!({"path": path.to_str().unwrap(), "content": "x"});

        let prepared = driver.prepare("key-1", &payload).await.unwrap();
        driver.commit("key-1", &payload, &prepared).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn receipt_previous_hash_matches_baseline_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "baseline").unwrap();

        let driver = FileWriteDriver;
        let payload = json!({"path": path.to_str().unwrap(), "content": "new-content"});
        let prepared = driver.prepare("key-1", &payload).await.unwrap();
        let receipt = driver.commit("key-1", &payload, &prepared).await.unwrap();

        assert_eq!(
            receipt.value().get("previousHash").unwrap().as_str().unwrap(),
            sha256_hex(b"baseline")
        );
    }

    #[tokio::test]
    async fn not_a_file_is_rejected_during_prepare() {
        let dir = tempfile::tempdir().unwrap();
        let driver = FileWriteDriver;
        let payload = json!({"path": dir.path().to_str().unwrap(), "content": "x"});
        let err = driver.prepare("key-1", &payload).await.unwrap_err();
        assert_eq!(err.context().get("kind").unwrap(), "NotAFile");
    }

    #[tokio::test]
    async fn empty_path_is_path_invalid() {
        let driver = FileWriteDriver;
        let payload = json!({"path": "", "content": "x"});
        let err = driver.prepare("key-1", &payload).await.unwrap_err();
        assert_eq!(err.context().get("kind").unwrap(), "PathInvalid");
    }
}
