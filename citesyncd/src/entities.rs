use std::sync::Arc;

use citesync_core::EntityKind;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::Value;
use time::OffsetDateTime;

use crate::sync::engine::{EngineError, SyncEngine};
use crate::sync::reconcile::{LocalCollection, merge_fields};
use crate::sync::store::LocalRecord;

const TEMP_ID_PREFIX: &str = "temp_";
const TEMP_ID_SUFFIX_LEN: usize = 9;

/// Application-facing entity operations.
///
/// Every write lands in the local store and the mutation queue first; when the
/// engine is online a background drain is requested afterwards.
#[derive(Clone)]
pub struct Entities {
    engine: Arc<SyncEngine>,
}

impl Entities {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub async fn create_list(&self, data: Value) -> Result<LocalRecord, EngineError> {
        self.create(EntityKind::List, data, None).await
    }

    pub async fn create_project(&self, data: Value) -> Result<LocalRecord, EngineError> {
        self.create(EntityKind::Project, data, None).await
    }

    pub async fn create_citation(
        &self,
        list_id: &str,
        data: Value,
    ) -> Result<LocalRecord, EngineError> {
        self.create(EntityKind::Citation, data, Some(list_id)).await
    }

    /// Stores an optimistic record under a fresh temporary id and queues its
    /// creation.
    pub async fn create(
        &self,
        kind: EntityKind,
        data: Value,
        parent_id: Option<&str>,
    ) -> Result<LocalRecord, EngineError> {
        let store = self.engine.store();
        let parent_id = match parent_id {
            Some(parent_id) => Some(store.resolve_id(parent_id).await?),
            None => None,
        };
        let record = LocalRecord {
            kind,
            id: temp_id(),
            parent_id,
            data: data.clone(),
            offline: !self.engine.is_online(),
            synced: false,
        };
        store.put_record(&record).await?;
        self.engine
            .enqueue_create(kind, &record.id, data, record.parent_id.as_deref())
            .await?;
        self.request_drain();
        Ok(record)
    }

    /// Merges `changes` into the local record and queues the update.
    ///
    /// A temporary id that was already reconciled addresses the record under
    /// its permanent id.
    pub async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        changes: Value,
    ) -> Result<LocalRecord, EngineError> {
        let store = self.engine.store();
        let id = store.resolve_id(id).await?;
        let existing = store.get_record(kind, &id).await?;
        let (base, parent_id, offline) = match existing {
            Some(record) => (record.data, record.parent_id, record.offline),
            None => (Value::Null, None, is_temp_id(&id)),
        };
        let record = LocalRecord {
            kind,
            id: id.clone(),
            parent_id,
            data: merge_fields(&base, &changes),
            offline: offline || !self.engine.is_online(),
            synced: false,
        };
        store.put_record(&record).await?;
        self.engine
            .enqueue_update(kind, &id, changes, record.parent_id.as_deref())
            .await?;
        self.request_drain();
        Ok(record)
    }

    /// Removes the local record and queues the delete. `parent_id` is only
    /// needed for citations that are no longer stored locally.
    pub async fn delete(
        &self,
        kind: EntityKind,
        id: &str,
        parent_id: Option<&str>,
    ) -> Result<bool, EngineError> {
        let store = self.engine.store();
        let id = store.resolve_id(id).await?;
        let existing = store.get_record(kind, &id).await?;
        let parent_id = match existing.and_then(|record| record.parent_id) {
            Some(parent_id) => Some(parent_id),
            None => match parent_id {
                Some(parent_id) => Some(store.resolve_id(parent_id).await?),
                None => None,
            },
        };
        let removed = store.delete_record(kind, &id).await?;
        self.engine
            .enqueue_delete(kind, &id, parent_id.as_deref())
            .await?;
        self.request_drain();
        Ok(removed)
    }

    pub async fn records(
        &self,
        kind: EntityKind,
        parent_id: Option<&str>,
    ) -> Result<Vec<LocalRecord>, EngineError> {
        Ok(self.engine.store().list_records(kind, parent_id).await?)
    }

    pub async fn collection(&self, kind: EntityKind) -> Result<LocalCollection, EngineError> {
        Ok(LocalCollection::new(kind, self.records(kind, None).await?))
    }

    fn request_drain(&self) {
        if !self.engine.is_online() {
            return;
        }
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            if let Err(err) = engine.drain().await {
                tracing::warn!(error = %err, "background drain failed");
            }
        });
    }
}

/// `temp_<unix millis>_<9 lowercase alphanumerics>`.
pub fn temp_id() -> String {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TEMP_ID_SUFFIX_LEN)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect();
    format!("{TEMP_ID_PREFIX}{millis}_{suffix}")
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}
