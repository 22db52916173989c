use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use citesync_core::{
    ApiError, ApiRequest, ApiResponse, BackendClient, EntityKind, MutationType, build_request,
    permanent_id,
};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::broadcast;

use super::backoff::Backoff;
use super::queue::{MutationQueue, MutationQueueItem};
use super::reconcile::{Reconciliation, fill_missing_fields, merge_fields};
use super::state::{StateHub, StateUpdate, Subscription, SyncState};
use super::store::{LocalRecord, LocalStore, StoreError};

const RECONCILIATION_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_CEILING: u32 = 3;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Dispatch attempts per item within one cycle.
    pub max_attempts: u32,
    pub retry_base: Duration,
    /// Cycles an item may fail before it is parked.
    pub retry_ceiling: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base: DEFAULT_RETRY_BASE,
            retry_ceiling: DEFAULT_RETRY_CEILING,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    AlreadySyncing,
}

/// Queue item that did not sync and will not be dispatched again on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub item_id: String,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub mutation_type: MutationType,
    pub retry_count: u32,
    pub error: String,
    /// The request could never be built; retrying cannot help.
    pub permanent: bool,
}

impl ItemFailure {
    fn new(item: &MutationQueueItem, retry_count: u32, error: String, permanent: bool) -> Self {
        Self {
            item_id: item.id.clone(),
            entity_kind: item.entity_kind,
            entity_id: item.entity_id.clone(),
            mutation_type: item.mutation_type,
            retry_count,
            error,
            permanent,
        }
    }
}

/// Outcome of one `drain()` call.
///
/// `failed` counts every item left in the queue by this cycle: items deferred
/// to the next cycle plus the parked ones listed in `errors`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub success: bool,
    pub synced: usize,
    pub failed: usize,
    pub deferred: usize,
    pub errors: Vec<ItemFailure>,
    pub last_error: Option<String>,
    pub skipped: Option<SkipReason>,
}

impl DrainReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    pub fn was_skipped(&self) -> bool {
        self.skipped.is_some()
    }
}

/// Replays the mutation queue against the backend, one item at a time.
pub struct SyncEngine {
    client: BackendClient,
    store: LocalStore,
    queue: MutationQueue,
    config: EngineConfig,
    backoff: Backoff,
    state: Arc<StateHub>,
    draining: AtomicBool,
    reconciliations: broadcast::Sender<Reconciliation>,
}

impl SyncEngine {
    /// Creates an engine over an initialized store. Starts offline.
    pub async fn open(
        client: BackendClient,
        store: LocalStore,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let queue = MutationQueue::new(store.clone());
        let pending_count = queue.count().await?;
        let (reconciliations, _) = broadcast::channel(RECONCILIATION_CHANNEL_CAPACITY);

        Ok(Self {
            client,
            store,
            queue,
            config,
            backoff: Backoff::linear(config.retry_base),
            state: StateHub::new(SyncState {
                pending_count,
                ..SyncState::default()
            }),
            draining: AtomicBool::new(false),
            reconciliations,
        })
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> SyncState {
        self.state.current()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncState) + Send + Sync + 'static,
    {
        self.state.subscribe(listener)
    }

    pub fn subscribe_reconciliations(&self) -> broadcast::Receiver<Reconciliation> {
        self.reconciliations.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.state.current().is_online
    }

    pub fn set_online(&self, online: bool) {
        self.state.publish(StateUpdate::new().online(online));
    }

    pub async fn enqueue_create(
        &self,
        kind: EntityKind,
        entity_id: &str,
        payload: Value,
        parent_id: Option<&str>,
    ) -> Result<MutationQueueItem, EngineError> {
        self.enqueue(MutationQueueItem::new(
            MutationType::Create,
            kind,
            entity_id,
            Some(payload),
            parent_id.map(str::to_string),
        ))
        .await
    }

    pub async fn enqueue_update(
        &self,
        kind: EntityKind,
        entity_id: &str,
        payload: Value,
        parent_id: Option<&str>,
    ) -> Result<MutationQueueItem, EngineError> {
        self.enqueue(MutationQueueItem::new(
            MutationType::Update,
            kind,
            entity_id,
            Some(payload),
            parent_id.map(str::to_string),
        ))
        .await
    }

    pub async fn enqueue_delete(
        &self,
        kind: EntityKind,
        entity_id: &str,
        parent_id: Option<&str>,
    ) -> Result<MutationQueueItem, EngineError> {
        self.enqueue(MutationQueueItem::new(
            MutationType::Delete,
            kind,
            entity_id,
            None,
            parent_id.map(str::to_string),
        ))
        .await
    }

    pub async fn enqueue(&self, item: MutationQueueItem) -> Result<MutationQueueItem, EngineError> {
        self.queue.enqueue(&item).await?;
        let pending = self.queue.count().await?;
        self.state.publish(StateUpdate::new().pending(pending));
        tracing::debug!(
            item_id = %item.id,
            kind = %item.entity_kind,
            mutation = %item.mutation_type,
            entity_id = %item.entity_id,
            pending,
            "mutation queued"
        );
        Ok(item)
    }

    /// Runs one pass over the queue.
    ///
    /// Refused with a skipped report while offline or while another drain is
    /// running. Item failures are reported, never returned as `Err`; only a
    /// storage failure aborts the cycle.
    pub async fn drain(&self) -> Result<DrainReport, EngineError> {
        if !self.is_online() {
            tracing::debug!("drain skipped: offline");
            return Ok(DrainReport::skipped(SkipReason::Offline));
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("drain skipped: already syncing");
            return Ok(DrainReport::skipped(SkipReason::AlreadySyncing));
        }
        let _guard = DrainGuard(&self.draining);

        self.state
            .publish(StateUpdate::new().syncing(true).error(None));

        let outcome = match self.run_cycle().await {
            Ok(report) => self.queue.count().await.map(|pending| (report, pending)),
            Err(err) => Err(err),
        };

        match outcome {
            Ok((report, pending)) => {
                self.state.publish(
                    StateUpdate::new()
                        .syncing(false)
                        .synced_at(OffsetDateTime::now_utc())
                        .pending(pending)
                        .error(report.last_error.clone()),
                );
                tracing::info!(
                    synced = report.synced,
                    failed = report.failed,
                    pending,
                    "drain finished"
                );
                Ok(report)
            }
            Err(err) => {
                tracing::error!(error = %err, "drain aborted");
                self.state.publish(
                    StateUpdate::new()
                        .syncing(false)
                        .error(Some(err.to_string())),
                );
                Err(err.into())
            }
        }
    }

    /// Gives parked items a fresh set of retries and drains.
    pub async fn retry_failed(&self) -> Result<DrainReport, EngineError> {
        let reset = self.queue.reset_parked(self.config.retry_ceiling).await?;
        tracing::info!(reset, "parked mutations reset");
        self.drain().await
    }

    /// Drops every queued mutation. Local records are left as they are.
    pub async fn clear_queue(&self) -> Result<usize, EngineError> {
        let removed = self.queue.clear().await?;
        self.state.publish(StateUpdate::new().pending(0));
        tracing::info!(removed, "mutation queue cleared");
        Ok(removed)
    }

    async fn run_cycle(&self) -> Result<DrainReport, StoreError> {
        let items = self.queue.peek_all().await?;
        let ceiling = self.config.retry_ceiling;
        let mut report = DrainReport::default();
        // Entities with an unsynced mutation earlier in this cycle.
        let mut blocked: HashSet<String> = HashSet::new();

        for item in items {
            let entity_id = self.store.resolve_id(&item.entity_id).await?;
            let parent_id = match item.parent_id.as_deref() {
                Some(parent_id) => Some(self.store.resolve_id(parent_id).await?),
                None => None,
            };

            if item.retry_count >= ceiling {
                let error = item
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "retry ceiling reached".to_string());
                report
                    .errors
                    .push(ItemFailure::new(&item, item.retry_count, error, false));
                blocked.insert(entity_id);
                continue;
            }

            if blocked.contains(&entity_id)
                || parent_id.as_ref().is_some_and(|parent| blocked.contains(parent))
            {
                tracing::debug!(item_id = %item.id, entity_id = %entity_id, "deferred behind earlier failure");
                report.deferred += 1;
                blocked.insert(entity_id);
                continue;
            }

            let request = match build_request(
                item.mutation_type,
                item.entity_kind,
                &entity_id,
                parent_id.as_deref(),
                item.payload.as_ref(),
            ) {
                Ok(request) => request,
                Err(err) => {
                    let message = err.to_string();
                    tracing::warn!(item_id = %item.id, error = %message, "mutation cannot be sent");
                    let parked = item.retry_count.max(ceiling);
                    self.queue
                        .update_retry(&item.id, parked, Some(&message))
                        .await?;
                    report.last_error = Some(message.clone());
                    report
                        .errors
                        .push(ItemFailure::new(&item, parked, message, true));
                    blocked.insert(entity_id);
                    continue;
                }
            };

            let failure = match self.dispatch(&item, &request).await {
                Ok(response) => {
                    match self
                        .confirm(&item, &entity_id, parent_id.as_deref(), response)
                        .await?
                    {
                        Confirmation::Applied(event) => {
                            if let Some(event) = event {
                                let _ = self.reconciliations.send(event);
                            }
                            report.synced += 1;
                            None
                        }
                        Confirmation::MissingId => {
                            Some("create response did not include an id".to_string())
                        }
                    }
                }
                Err(err) => Some(err.to_string()),
            };

            if let Some(message) = failure {
                let retry_count = item.retry_count.saturating_add(1);
                self.queue
                    .update_retry(&item.id, retry_count, Some(&message))
                    .await?;
                report.last_error = Some(message.clone());
                if retry_count >= ceiling {
                    tracing::warn!(item_id = %item.id, retry_count, "mutation parked after repeated failures");
                    report
                        .errors
                        .push(ItemFailure::new(&item, retry_count, message, false));
                } else {
                    report.deferred += 1;
                }
                blocked.insert(entity_id);
            }
        }

        report.failed = report.deferred + report.errors.len();
        report.success = report.failed == 0;
        Ok(report)
    }

    async fn dispatch(
        &self,
        item: &MutationQueueItem,
        request: &ApiRequest,
    ) -> Result<ApiResponse, ApiError> {
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let delay = self.backoff.delay(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match self.client.execute(request).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    attempt += 1;
                    tracing::warn!(
                        item_id = %item.id,
                        method = %request.method,
                        path = %request.path(),
                        attempt,
                        status = ?err.status(),
                        timeout = err.is_timeout(),
                        class = ?err.classification(),
                        error = %err,
                        "mutation attempt failed"
                    );
                    if attempt >= attempts {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Removes a confirmed item and applies its result to the local store.
    ///
    /// The record is only marked synced when no later mutation for the same
    /// entity is still queued; until then local field values win over the
    /// server reply. A create reply without an id leaves everything as is.
    async fn confirm(
        &self,
        item: &MutationQueueItem,
        entity_id: &str,
        parent_id: Option<&str>,
        response: ApiResponse,
    ) -> Result<Confirmation, StoreError> {
        let kind = item.entity_kind;
        let event = match item.mutation_type {
            MutationType::Create => {
                let Some(permanent) = response.body.as_ref().and_then(permanent_id) else {
                    return Ok(Confirmation::MissingId);
                };
                let pending = self
                    .store
                    .has_pending_mutations(kind, entity_id, &item.id)
                    .await?;

                let existing = self.store.get_record(kind, entity_id).await?;
                let base = existing
                    .as_ref()
                    .map(|record| record.data.clone())
                    .or_else(|| item.payload.clone())
                    .unwrap_or(Value::Null);
                let data = match &response.body {
                    Some(body) if pending => fill_missing_fields(&base, body),
                    Some(body) => merge_fields(&base, body),
                    None => base,
                };
                let record = LocalRecord {
                    kind,
                    id: permanent.clone(),
                    parent_id: parent_id.map(str::to_string),
                    data,
                    offline: false,
                    synced: !pending,
                };

                if permanent == entity_id {
                    self.queue.remove(&item.id).await?;
                    if existing.is_some() {
                        self.store.put_record(&record).await?;
                    }
                    (!pending).then(|| Reconciliation::Synced {
                        kind,
                        id: permanent,
                    })
                } else {
                    let replaced = self
                        .store
                        .reconcile_created(&item.id, entity_id, &record)
                        .await?;
                    tracing::info!(
                        kind = %kind,
                        temp_id = entity_id,
                        permanent_id = %permanent,
                        replaced,
                        pending,
                        "created entity reconciled"
                    );
                    Some(Reconciliation::IdReplaced {
                        temp_id: entity_id.to_string(),
                        record,
                    })
                }
            }
            MutationType::Update => {
                let pending = self
                    .store
                    .has_pending_mutations(kind, entity_id, &item.id)
                    .await?;
                self.queue.remove(&item.id).await?;
                self.store.mark_confirmed(kind, entity_id, !pending).await?;
                (!pending).then(|| Reconciliation::Synced {
                    kind,
                    id: entity_id.to_string(),
                })
            }
            MutationType::Delete => {
                self.queue.remove(&item.id).await?;
                self.store.delete_record(kind, entity_id).await?;
                Some(Reconciliation::Removed {
                    kind,
                    id: entity_id.to_string(),
                })
            }
        };
        Ok(Confirmation::Applied(event))
    }
}

enum Confirmation {
    /// The item left the queue; `None` when there is nothing to announce yet.
    Applied(Option<Reconciliation>),
    MissingId,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
