use citesync_core::{EntityKind, MutationType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::store::{LocalStore, StoreError, now_unix};

/// One pending create/update/delete, replayed in FIFO order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationQueueItem {
    pub id: String,
    #[serde(rename = "type")]
    pub mutation_type: MutationType,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub parent_id: Option<String>,
    pub payload: Option<Value>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
}

impl MutationQueueItem {
    pub fn new(
        mutation_type: MutationType,
        entity_kind: EntityKind,
        entity_id: impl Into<String>,
        payload: Option<Value>,
        parent_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            mutation_type,
            entity_kind,
            entity_id: entity_id.into(),
            parent_id,
            // Deletes never carry a body.
            payload: match mutation_type {
                MutationType::Delete => None,
                _ => payload,
            },
            retry_count: 0,
            last_error: None,
            created_at: now_unix(),
        }
    }
}

/// Durable FIFO of mutations, backed by the `mutation_queue` table.
///
/// Only the sync engine removes or rewrites items; producers append through
/// the engine's `enqueue_*` methods.
#[derive(Clone)]
pub struct MutationQueue {
    store: LocalStore,
}

impl MutationQueue {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub async fn enqueue(&self, item: &MutationQueueItem) -> Result<(), StoreError> {
        self.store.insert_mutation(item).await
    }

    pub async fn peek_all(&self) -> Result<Vec<MutationQueueItem>, StoreError> {
        self.store.list_mutations().await
    }

    pub async fn get(&self, id: &str) -> Result<Option<MutationQueueItem>, StoreError> {
        self.store.get_mutation(id).await
    }

    pub async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        self.store.delete_mutation(id).await
    }

    pub async fn update_retry(
        &self,
        id: &str,
        retry_count: u32,
        last_error: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.store
            .update_mutation_retry(id, retry_count, last_error)
            .await
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        self.store.count_mutations().await
    }

    pub async fn clear(&self) -> Result<usize, StoreError> {
        self.store.clear_mutations().await
    }

    /// Resets items that reached `ceiling` back to zero retries.
    pub async fn reset_parked(&self, ceiling: u32) -> Result<usize, StoreError> {
        self.store.reset_parked_mutations(ceiling).await
    }
}
