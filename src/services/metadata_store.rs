//! Metadata store for upload records, backed by SQLite.
//!
//! Records are stored one row per upload in a single table whose name is
//! configurable. Path lists are kept as JSON text columns.

use crate::models::upload::{UploadRecord, UploadRecordPatch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool, types::Json};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("table name `{0}` is not a valid identifier")]
    InvalidTableName(String),
    #[error("record `{0}` already exists")]
    AlreadyExists(Uuid),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Document store holding one `UploadRecord` per upload.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn insert(&self, record: &UploadRecord) -> MetadataResult<()>;

    async fn get_by_id(&self, id: Uuid) -> MetadataResult<Option<UploadRecord>>;

    /// Every record, oldest first.
    async fn list_all(&self) -> MetadataResult<Vec<UploadRecord>>;

    /// Returns whether a record was removed.
    async fn delete_by_id(&self, id: Uuid) -> MetadataResult<bool>;

    /// Apply `patch` to an existing record, returning the updated record.
    async fn update(
        &self,
        id: Uuid,
        patch: UploadRecordPatch,
    ) -> MetadataResult<Option<UploadRecord>>;

    /// Lightweight connectivity check.
    async fn ping(&self) -> MetadataResult<()>;
}

#[derive(FromRow)]
struct UploadRow {
    id: Uuid,
    image_path: Json<Vec<String>>,
    storage_keys: Json<Vec<String>>,
    uploaded_at: DateTime<Utc>,
}

impl From<UploadRow> for UploadRecord {
    fn from(row: UploadRow) -> Self {
        Self {
            id: row.id,
            image_path: row.image_path.0,
            storage_keys: row.storage_keys.0,
            uploaded_at: row.uploaded_at,
        }
    }
}

#[derive(Clone)]
pub struct SqliteMetadataStore {
    db: Arc<SqlitePool>,
    table: String,
}

impl SqliteMetadataStore {
    /// Wrap `db`, storing records in `table`.
    ///
    /// The table name is interpolated into SQL, so it must be a plain
    /// identifier (`[A-Za-z_][A-Za-z0-9_]*`).
    pub fn new(db: Arc<SqlitePool>, table: impl Into<String>) -> MetadataResult<Self> {
        let table = table.into();
        if !is_identifier(&table) {
            return Err(MetadataError::InvalidTableName(table));
        }
        Ok(Self { db, table })
    }

    /// Create the records table if it does not exist yet.
    pub async fn ensure_schema(&self) -> MetadataResult<()> {
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BLOB PRIMARY KEY NOT NULL,
                    image_path TEXT NOT NULL,
                    storage_keys TEXT NOT NULL DEFAULT '[]',
                    uploaded_at TEXT NOT NULL
                )",
                self.table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_uploaded_at ON {0} (uploaded_at)",
                self.table
            ),
        ];

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn insert(&self, record: &UploadRecord) -> MetadataResult<()> {
        let sql = format!(
            "INSERT INTO {} (id, image_path, storage_keys, uploaded_at) VALUES (?, ?, ?, ?)",
            self.table
        );
        sqlx::query(&sql)
            .bind(record.id)
            .bind(Json(&record.image_path))
            .bind(Json(&record.storage_keys))
            .bind(record.uploaded_at)
            .execute(&*self.db)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    MetadataError::AlreadyExists(record.id)
                } else {
                    MetadataError::Sqlx(err)
                }
            })?;
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> MetadataResult<Option<UploadRecord>> {
        let sql = format!(
            "SELECT id, image_path, storage_keys, uploaded_at FROM {} WHERE id = ?",
            self.table
        );
        let row = sqlx::query_as::<_, UploadRow>(&sql)
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;
        Ok(row.map(UploadRecord::from))
    }

    async fn list_all(&self) -> MetadataResult<Vec<UploadRecord>> {
        let sql = format!(
            "SELECT id, image_path, storage_keys, uploaded_at FROM {} ORDER BY uploaded_at ASC",
            self.table
        );
        let rows = sqlx::query_as::<_, UploadRow>(&sql)
            .fetch_all(&*self.db)
            .await?;
        Ok(rows.into_iter().map(UploadRecord::from).collect())
    }

    async fn delete_by_id(&self, id: Uuid) -> MetadataResult<bool> {
        let sql = format!("DELETE FROM {} WHERE id = ?", self.table);
        let result = sqlx::query(&sql).bind(id).execute(&*self.db).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update(
        &self,
        id: Uuid,
        patch: UploadRecordPatch,
    ) -> MetadataResult<Option<UploadRecord>> {
        let mut tx = self.db.begin().await?;

        let select = format!(
            "SELECT id, image_path, storage_keys, uploaded_at FROM {} WHERE id = ?",
            self.table
        );
        let Some(row) = sqlx::query_as::<_, UploadRow>(&select)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(None);
        };

        let mut record = UploadRecord::from(row);
        patch.apply(&mut record);

        let update = format!(
            "UPDATE {} SET image_path = ?, storage_keys = ? WHERE id = ?",
            self.table
        );
        sqlx::query(&update)
            .bind(Json(&record.image_path))
            .bind(Json(&record.storage_keys))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(record))
    }

    async fn ping(&self) -> MetadataResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
