use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::engine::SyncEngine;

/// Source of reachability information, injected into the monitor.
pub trait ConnectivitySource: Send + Sync {
    fn is_online(&self) -> bool;

    /// Every change after subscribing, in order. Rapid flips are not merged.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<bool>;
}

/// Connectivity flag driven by the embedding application or by tests.
#[derive(Clone)]
pub struct ManualConnectivity {
    inner: Arc<Mutex<ManualInner>>,
}

struct ManualInner {
    online: bool,
    subscribers: Vec<mpsc::UnboundedSender<bool>>,
}

impl ManualConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualInner {
                online,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Records `online` and forwards it to subscribers when it differs from
    /// the current value.
    pub fn set_online(&self, online: bool) {
        let mut inner = self.lock();
        if inner.online == online {
            return;
        }
        inner.online = online;
        inner.subscribers.retain(|tx| tx.send(online).is_ok());
    }

    fn lock(&self) -> MutexGuard<'_, ManualInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConnectivitySource for ManualConnectivity {
    fn is_online(&self) -> bool {
        self.lock().online
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<bool> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }
}

type TransitionCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Follows a [`ConnectivitySource`] and keeps the engine's `is_online` in step.
///
/// Every offline→online edge triggers exactly one drain, including edges of
/// a flip that happens faster than the monitor task is scheduled.
pub struct ConnectivityMonitor {
    online: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConnectivityMonitor {
    pub fn start(source: &dyn ConnectivitySource, engine: Arc<SyncEngine>) -> Self {
        Self::start_with(source, engine, |_| {})
    }

    /// Like [`ConnectivityMonitor::start`], calling `on_transition` once per edge
    /// after the engine state has been updated.
    pub fn start_with<F>(source: &dyn ConnectivitySource, engine: Arc<SyncEngine>, on_transition: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let mut edges = source.subscribe();
        let mut last = source.is_online();
        engine.set_online(last);
        let online_flag = Arc::new(AtomicBool::new(last));

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let callback: TransitionCallback = Box::new(on_transition);
        let task_flag = Arc::clone(&online_flag);

        let task = tokio::spawn(async move {
            loop {
                let online = tokio::select! {
                    _ = token.cancelled() => break,
                    edge = edges.recv() => match edge {
                        Some(online) => online,
                        None => {
                            tracing::debug!("connectivity source closed");
                            break;
                        }
                    },
                };

                // A change made between subscribing and the initial read.
                if online == last {
                    continue;
                }
                last = online;

                tracing::info!(online, "connectivity changed");
                task_flag.store(online, Ordering::Release);
                engine.set_online(online);
                callback(online);

                if online {
                    let engine = Arc::clone(&engine);
                    tokio::spawn(async move {
                        if let Err(err) = engine.drain().await {
                            tracing::warn!(error = %err, "reconnect drain failed");
                        }
                    });
                }
            }
        });

        Self {
            online: online_flag,
            cancel,
            task: Some(task),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
