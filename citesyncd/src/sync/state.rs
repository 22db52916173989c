use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Snapshot of the engine's published status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    pub is_online: bool,
    pub is_syncing: bool,
    pub pending_count: usize,
    pub last_sync_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

impl SyncState {
    pub fn last_sync_rfc3339(&self) -> Option<String> {
        self.last_sync_at.and_then(|at| at.format(&Rfc3339).ok())
    }
}

/// Partial state change; unset fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    is_online: Option<bool>,
    is_syncing: Option<bool>,
    pending_count: Option<usize>,
    last_sync_at: Option<OffsetDateTime>,
    last_error: Option<Option<String>>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn online(mut self, value: bool) -> Self {
        self.is_online = Some(value);
        self
    }

    pub fn syncing(mut self, value: bool) -> Self {
        self.is_syncing = Some(value);
        self
    }

    pub fn pending(mut self, value: usize) -> Self {
        self.pending_count = Some(value);
        self
    }

    pub fn synced_at(mut self, value: OffsetDateTime) -> Self {
        self.last_sync_at = Some(value);
        self
    }

    pub fn error(mut self, value: Option<String>) -> Self {
        self.last_error = Some(value);
        self
    }

    fn apply(self, state: &mut SyncState) {
        if let Some(value) = self.is_online {
            state.is_online = value;
        }
        if let Some(value) = self.is_syncing {
            state.is_syncing = value;
        }
        if let Some(value) = self.pending_count {
            state.pending_count = value;
        }
        if let Some(value) = self.last_sync_at {
            state.last_sync_at = Some(value);
        }
        if let Some(value) = self.last_error {
            state.last_error = value;
        }
    }
}

type Listener = Arc<dyn Fn(&SyncState) + Send + Sync>;

#[derive(Default)]
struct Inner {
    state: SyncState,
    listeners: Vec<(u64, Listener)>,
    next_id: u64,
}

/// Single update path for [`SyncState`].
///
/// Listeners run synchronously on the publishing task, in registration order,
/// and only when the merged state actually changed. A listener must not
/// publish into the same hub.
#[derive(Default)]
pub struct StateHub {
    inner: Mutex<Inner>,
    dispatch: Mutex<()>,
}

impl StateHub {
    pub fn new(initial: SyncState) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: initial,
                ..Inner::default()
            }),
            dispatch: Mutex::new(()),
        })
    }

    pub fn current(&self) -> SyncState {
        self.lock_inner().state.clone()
    }

    /// Merges `update` and notifies listeners. Returns the resulting state.
    pub fn publish(&self, update: StateUpdate) -> SyncState {
        let _dispatch = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        let (snapshot, listeners) = {
            let mut inner = self.lock_inner();
            let mut next = inner.state.clone();
            update.apply(&mut next);
            if next == inner.state {
                return next;
            }
            inner.state = next.clone();
            let listeners: Vec<Listener> = inner
                .listeners
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect();
            (next, listeners)
        };

        for listener in listeners {
            listener(&snapshot);
        }
        snapshot
    }

    /// Registers `listener` and immediately hands it the current state.
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&SyncState) + Send + Sync + 'static,
    {
        let _dispatch = self.dispatch.lock().unwrap_or_else(PoisonError::into_inner);
        let listener: Listener = Arc::new(listener);
        let (id, snapshot) = {
            let mut inner = self.lock_inner();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.listeners.push((id, Arc::clone(&listener)));
            (id, inner.state.clone())
        };
        listener(&snapshot);

        Subscription {
            hub: Arc::downgrade(self),
            id: Some(id),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock_inner().listeners.len()
    }

    fn remove(&self, id: u64) {
        self.lock_inner()
            .listeners
            .retain(|(listener_id, _)| *listener_id != id);
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle returned by [`StateHub::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    hub: Weak<StateHub>,
    id: Option<u64>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let (Some(id), Some(hub)) = (self.id.take(), self.hub.upgrade()) {
            hub.remove(id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}
