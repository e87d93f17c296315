// SPDX-License-Identifier: MIT OR Apache-2.0
//! gate-store
#![deny(unsafe_code)]
//!
//! The Gate Store (§4.9): a small SQLite-backed persistence layer for
//! bundle blobs, approvals, and receipts. Every write is a single durable
//! transaction against a WAL-mode database, so a crash mid-commit leaves
//! either a fully written row or none.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use gate_core::{ApprovalRecord, BundleId, ReceiptRecord};
use gate_error::{ErrorCode, GateError};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

/// A persisted bundle's storage-level record (distinct from its manifest).
#[derive(Debug, Clone, PartialEq)]
pub struct BundleSummary {
    pub id: BundleId,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<Value>,
}

/// The SQLite-backed store. Cheap to clone: wraps a pooled connection.
#[derive(Clone)]
pub struct GateStore {
    pool: SqlitePool,
    bundle_dir: PathBuf,
}

impl GateStore {
    /// Open (creating if absent) the SQLite database at `db_path`, and
    /// ensure `bundle_dir` exists for blob storage.
    pub async fn open(db_path: &Path, bundle_dir: impl Into<PathBuf>) -> Result<Self, GateError> {
        let bundle_dir = bundle_dir.into();
        tokio::fs::create_dir_all(&bundle_dir).await.map_err(|e| io_error("create bundle dir", e))?;
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| io_error("create db dir", e))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().connect_with(options).await.map_err(db_error("connect"))?;

        let store = Self { pool, bundle_dir };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), GateError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bundles (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                created_at TEXT NOT NULL,
                metadata TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_error("create bundles table"))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS approvals (
                bundle_id TEXT PRIMARY KEY,
                actor TEXT NOT NULL,
                policy_version TEXT NOT NULL,
                approved_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_error("create approvals table"))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS receipts (
                bundle_id TEXT NOT NULL,
                intent_id TEXT NOT NULL,
                intent_type TEXT NOT NULL,
                receipt TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (bundle_id, intent_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_error("create receipts table"))?;

        Ok(())
    }

    /// Write `bytes` to `bundles/<id>.tgz` under the bundle directory and
    /// record the bundle row, replacing any prior row for the same `id`.
    pub async fn persist_bundle(
        &self,
        id: &BundleId,
        bytes: &[u8],
        metadata: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<(), GateError> {
        let path = self.bundle_path(id);
        tokio::fs::write(&path, bytes).await.map_err(|e| io_error("write bundle blob", e))?;

        let metadata_text = metadata.as_ref().map(|m| m.to_string());
        sqlx::query(
            r#"
            INSERT INTO bundles (id, path, created_at, metadata)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET path = excluded.path, metadata = excluded.metadata
            "#,
        )
        .bind(id)
        .bind(path.to_string_lossy().into_owned())
        .bind(now.to_rfc3339())
        .bind(metadata_text)
        .execute(&self.pool)
        .await
        .map_err(db_error("persist bundle"))?;
        Ok(())
    }

    /// Read back a previously persisted bundle's bytes.
    pub async fn get_bundle(&self, id: &BundleId) -> Result<Option<Vec<u8>>, GateError> {
        let row = sqlx::query("SELECT path FROM bundles WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get bundle"))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let path: String = row.try_get("path").map_err(db_error("decode bundle row"))?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| io_error("read bundle blob", e))?;
        Ok(Some(bytes))
    }

    /// All persisted bundle summaries, most recently created first.
    pub async fn list_bundles(&self) -> Result<Vec<BundleSummary>, GateError> {
        let rows = sqlx::query("SELECT id, path, created_at, metadata FROM bundles ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list bundles"))?;

        rows.into_iter().map(row_to_bundle_summary).collect()
    }

    /// Upsert an approval record by `bundleId`.
    pub async fn record_approval(&self, record: &ApprovalRecord) -> Result<(), GateError> {
        sqlx::query(
            r#"
            INSERT INTO approvals (bundle_id, actor, policy_version, approved_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(bundle_id) DO UPDATE SET
                actor = excluded.actor,
                policy_version = excluded.policy_version,
                approved_at = excluded.approved_at
            "#,
        )
        .bind(&record.bundle_id)
        .bind(&record.actor)
        .bind(&record.policy_version)
        .bind(record.approved_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_error("record approval"))?;
        Ok(())
    }

    /// The current approval record for `bundle_id`, if one has been recorded.
    pub async fn get_approval(&self, bundle_id: &BundleId) -> Result<Option<ApprovalRecord>, GateError> {
        let row = sqlx::query(
            "SELECT bundle_id, actor, policy_version, approved_at FROM approvals WHERE bundle_id = ?1",
        )
        .bind(bundle_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("get approval"))?;
        row.map(row_to_approval_record).transpose()
    }

    /// Upsert a committed-intent receipt by `(bundleId, intentId)`.
    pub async fn save_receipt(&self, record: &ReceiptRecord) -> Result<(), GateError> {
        sqlx::query(
            r#"
            INSERT INTO receipts (bundle_id, intent_id, intent_type, receipt, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(bundle_id, intent_id) DO UPDATE SET
                intent_type = excluded.intent_type,
                receipt = excluded.receipt,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(&record.bundle_id)
        .bind(&record.intent_id)
        .bind(&record.intent_type)
        .bind(record.receipt.to_string())
        .bind(record.recorded_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_error("save receipt"))?;
        Ok(())
    }

    /// Receipts for `bundle_id`, sorted by intent ID.
    pub async fn list_receipts(&self, bundle_id: &BundleId) -> Result<Vec<ReceiptRecord>, GateError> {
        let rows = sqlx::query(
            "SELECT bundle_id, intent_id, intent_type, receipt, recorded_at FROM receipts \
             WHERE bundle_id = ?1 ORDER BY intent_id ASC",
        )
        .bind(bundle_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list receipts"))?;

        rows.into_iter().map(row_to_receipt_record).collect()
    }

    fn bundle_path(&self, id: &BundleId) -> PathBuf {
        self.bundle_dir.join(format!("{id}.tgz"))
    }
}

fn row_to_bundle_summary(row: sqlx::sqlite::SqliteRow) -> Result<BundleSummary, GateError> {
    let id: String = row.try_get("id").map_err(db_error("decode bundle row"))?;
    let path: String = row.try_get("path").map_err(db_error("decode bundle row"))?;
    let created_at: String = row.try_get("created_at").map_err(db_error("decode bundle row"))?;
    let metadata: Option<String> = row.try_get("metadata").map_err(db_error("decode bundle row"))?;

    Ok(BundleSummary {
        id,
        path: PathBuf::from(path),
        created_at: parse_rfc3339(&created_at)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
    })
}

fn row_to_approval_record(row: sqlx::sqlite::SqliteRow) -> Result<ApprovalRecord, GateError> {
    let bundle_id: String = row.try_get("bundle_id").map_err(db_error("decode approval row"))?;
    let actor: String = row.try_get("actor").map_err(db_error("decode approval row"))?;
    let policy_version: String = row.try_get("policy_version").map_err(db_error("decode approval row"))?;
    let approved_at: String = row.try_get("approved_at").map_err(db_error("decode approval row"))?;

    Ok(ApprovalRecord {
        bundle_id,
        actor,
        policy_version,
        approved_at: parse_rfc3339(&approved_at)?,
    })
}

fn row_to_receipt_record(row: sqlx::sqlite::SqliteRow) -> Result<ReceiptRecord, GateError> {
    let bundle_id: String = row.try_get("bundle_id").map_err(db_error("decode receipt row"))?;
    let intent_id: String = row.try_get("intent_id").map_err(db_error("decode receipt row"))?;
    let intent_type: String = row.try_get("intent_type").map_err(db_error("decode receipt row"))?;
    let receipt: String = row.try_get("receipt").map_err(db_error("decode receipt row"))?;
    let recorded_at: String = row.try_get("recorded_at").map_err(db_error("decode receipt row"))?;

    Ok(ReceiptRecord {
        bundle_id,
        intent_id,
        intent_type,
        receipt: serde_json::from_str(&receipt).map_err(|e| {
            GateError::new(ErrorCode::JournalParseError, "stored receipt is not valid JSON").with_source(e)
        })?,
        recorded_at: parse_rfc3339(&recorded_at)?,
    })
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, GateError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            GateError::new(ErrorCode::JournalParseError, "stored timestamp is not valid RFC3339")
                .with_source(e)
        })
}

fn io_error(stage: &'static str, e: std::io::Error) -> GateError {
    GateError::new(ErrorCode::JournalIoError, "gate store I/O failed")
        .with_context("stage", stage)
        .with_source(e)
}

fn db_error(stage: &'static str) -> impl FnOnce(sqlx::Error) -> GateError {
    move |e| {
        GateError::new(ErrorCode::JournalIoError, "gate store database operation failed")
            .with_context("stage", stage)
            .with_source(e)
    }
}
