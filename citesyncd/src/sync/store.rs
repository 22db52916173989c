use std::{fs, path::Path, path::PathBuf};

use citesync_core::{EntityKind, MutationType};
use serde_json::Value;
use sqlx::{
    Row, SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
};
use thiserror::Error;
use time::OffsetDateTime;

use super::queue::MutationQueueItem;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid entity kind: {0}")]
    InvalidEntityKind(String),
    #[error("invalid mutation type: {0}")]
    InvalidMutationType(String),
}

/// Client-side copy of a list, citation or project.
///
/// `offline` stays true until the entity has a confirmed server identity,
/// `synced` is true once the backend acknowledged its current state.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRecord {
    pub kind: EntityKind,
    pub id: String,
    pub parent_id: Option<String>,
    pub data: Value,
    pub offline: bool,
    pub synced: bool,
}

#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Single-connection in-memory database; every pooled connection to
    /// `sqlite::memory:` would otherwise see its own empty schema.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, StoreError> {
        Self::open(&default_db_path()?).await
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Inserts or overwrites a record. Existing records keep their position.
    pub async fn put_record(&self, record: &LocalRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO records (kind, id, parent_id, data, offline, synced, position, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, (SELECT COALESCE(MAX(position), 0) + 1 FROM records), ?7)
             ON CONFLICT(kind, id) DO UPDATE SET
                parent_id = excluded.parent_id,
                data = excluded.data,
                offline = excluded.offline,
                synced = excluded.synced,
                updated_at = excluded.updated_at",
        )
        .bind(record.kind.as_str())
        .bind(&record.id)
        .bind(&record.parent_id)
        .bind(serde_json::to_string(&record.data)?)
        .bind(record.offline)
        .bind(record.synced)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_record(
        &self,
        kind: EntityKind,
        id: &str,
    ) -> Result<Option<LocalRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT kind, id, parent_id, data, offline, synced FROM records WHERE kind = ?1 AND id = ?2",
        )
        .bind(kind.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// Records of one kind in insertion order, optionally limited to a parent.
    pub async fn list_records(
        &self,
        kind: EntityKind,
        parent_id: Option<&str>,
    ) -> Result<Vec<LocalRecord>, StoreError> {
        let rows = match parent_id {
            Some(parent_id) => {
                sqlx::query(
                    "SELECT kind, id, parent_id, data, offline, synced FROM records
                     WHERE kind = ?1 AND parent_id = ?2
                     ORDER BY position ASC",
                )
                .bind(kind.as_str())
                .bind(parent_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT kind, id, parent_id, data, offline, synced FROM records
                     WHERE kind = ?1
                     ORDER BY position ASC",
                )
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(record_from_row).collect()
    }

    pub async fn delete_record(&self, kind: EntityKind, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM records WHERE kind = ?1 AND id = ?2")
            .bind(kind.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Clears `offline` after a confirmed mutation. `synced` is only set when
    /// nothing newer for the entity is still queued.
    pub async fn mark_confirmed(
        &self,
        kind: EntityKind,
        id: &str,
        synced: bool,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE records SET synced = ?3, offline = 0, updated_at = ?4 WHERE kind = ?1 AND id = ?2",
        )
        .bind(kind.as_str())
        .bind(id)
        .bind(synced)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Confirms the create mutation `mutation_id` and moves its record from
    /// the temporary id to `record.id`, all in one transaction.
    ///
    /// The mapping is stored even when the temporary record is gone (deleted
    /// optimistically) so queued dependents still resolve. Children that point
    /// at the temporary id are re-parented. Returns whether a local record was
    /// replaced.
    pub async fn reconcile_created(
        &self,
        mutation_id: &str,
        temp_id: &str,
        record: &LocalRecord,
    ) -> Result<bool, StoreError> {
        let now = now_unix();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM mutation_queue WHERE id = ?1")
            .bind(mutation_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO id_map (temp_id, kind, permanent_id, mapped_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(temp_id) DO UPDATE SET
                permanent_id = excluded.permanent_id,
                mapped_at = excluded.mapped_at",
        )
        .bind(temp_id)
        .bind(record.kind.as_str())
        .bind(&record.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE records SET parent_id = ?1 WHERE parent_id = ?2")
            .bind(&record.id)
            .bind(temp_id)
            .execute(&mut *tx)
            .await?;

        let position: Option<i64> =
            sqlx::query_scalar("SELECT position FROM records WHERE kind = ?1 AND id = ?2")
                .bind(record.kind.as_str())
                .bind(temp_id)
                .fetch_optional(&mut *tx)
                .await?;

        let replaced = if let Some(position) = position {
            sqlx::query("DELETE FROM records WHERE kind = ?1 AND id = ?2")
                .bind(record.kind.as_str())
                .bind(temp_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT OR REPLACE INTO records (kind, id, parent_id, data, offline, synced, position, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .bind(record.kind.as_str())
            .bind(&record.id)
            .bind(&record.parent_id)
            .bind(serde_json::to_string(&record.data)?)
            .bind(record.offline)
            .bind(record.synced)
            .bind(position)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            true
        } else {
            false
        };

        tx.commit().await?;
        Ok(replaced)
    }

    /// Returns the permanent id for a reconciled temporary id, or `id` itself.
    pub async fn resolve_id(&self, id: &str) -> Result<String, StoreError> {
        let mapped: Option<String> =
            sqlx::query_scalar("SELECT permanent_id FROM id_map WHERE temp_id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(mapped.unwrap_or_else(|| id.to_string()))
    }

    /// Whether a queued mutation other than `excluding` targets the entity
    /// `id`, either directly or through a temporary id mapped onto it.
    pub async fn has_pending_mutations(
        &self,
        kind: EntityKind,
        id: &str,
        excluding: &str,
    ) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM mutation_queue
             WHERE entity_kind = ?1 AND id != ?3
               AND (entity_id = ?2
                    OR entity_id IN (SELECT temp_id FROM id_map WHERE permanent_id = ?2))",
        )
        .bind(kind.as_str())
        .bind(id)
        .bind(excluding)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn insert_mutation(&self, item: &MutationQueueItem) -> Result<(), StoreError> {
        let payload = item
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO mutation_queue
                (id, mutation_type, entity_kind, entity_id, parent_id, payload, retry_count, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&item.id)
        .bind(item.mutation_type.as_str())
        .bind(item.entity_kind.as_str())
        .bind(&item.entity_id)
        .bind(&item.parent_id)
        .bind(payload)
        .bind(item.retry_count)
        .bind(&item.last_error)
        .bind(item.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_mutations(&self) -> Result<Vec<MutationQueueItem>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, mutation_type, entity_kind, entity_id, parent_id, payload, retry_count, last_error, created_at
             FROM mutation_queue
             ORDER BY seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(mutation_from_row).collect()
    }

    pub async fn get_mutation(&self, id: &str) -> Result<Option<MutationQueueItem>, StoreError> {
        let row = sqlx::query(
            "SELECT id, mutation_type, entity_kind, entity_id, parent_id, payload, retry_count, last_error, created_at
             FROM mutation_queue
             WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(mutation_from_row).transpose()
    }

    pub async fn delete_mutation(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM mutation_queue WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_mutation_retry(
        &self,
        id: &str,
        retry_count: u32,
        last_error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE mutation_queue SET retry_count = ?2, last_error = ?3 WHERE id = ?1")
                .bind(id)
                .bind(retry_count)
                .bind(last_error)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_mutations(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM mutation_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    pub async fn clear_mutations(&self) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM mutation_queue")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    pub async fn reset_parked_mutations(&self, ceiling: u32) -> Result<usize, StoreError> {
        let result =
            sqlx::query("UPDATE mutation_queue SET retry_count = 0 WHERE retry_count >= ?1")
                .bind(ceiling)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() as usize)
    }
}

fn record_from_row(row: &SqliteRow) -> Result<LocalRecord, StoreError> {
    let kind: String = row.try_get("kind")?;
    let data: String = row.try_get("data")?;
    Ok(LocalRecord {
        kind: EntityKind::parse(&kind).ok_or(StoreError::InvalidEntityKind(kind))?,
        id: row.try_get("id")?,
        parent_id: row.try_get("parent_id")?,
        data: serde_json::from_str(&data)?,
        offline: row.try_get("offline")?,
        synced: row.try_get("synced")?,
    })
}

fn mutation_from_row(row: &SqliteRow) -> Result<MutationQueueItem, StoreError> {
    let mutation_type: String = row.try_get("mutation_type")?;
    let entity_kind: String = row.try_get("entity_kind")?;
    let payload: Option<String> = row.try_get("payload")?;
    Ok(MutationQueueItem {
        id: row.try_get("id")?,
        mutation_type: MutationType::parse(&mutation_type)
            .ok_or(StoreError::InvalidMutationType(mutation_type))?,
        entity_kind: EntityKind::parse(&entity_kind)
            .ok_or(StoreError::InvalidEntityKind(entity_kind))?,
        entity_id: row.try_get("entity_id")?,
        parent_id: row.try_get("parent_id")?,
        payload: payload.as_deref().map(serde_json::from_str).transpose()?,
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
    })
}

pub(crate) fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("citesync");
    path.push("store.db");
    Ok(path)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
