use std::sync::Arc;

use anyhow::Context;
use citesync_core::BackendClient;

use crate::config::DaemonConfig;
use crate::entities::Entities;
use crate::sync::connectivity::{ConnectivityMonitor, ManualConnectivity};
use crate::sync::engine::{DrainReport, SyncEngine};
use crate::sync::queue::MutationQueueItem;
use crate::sync::state::SyncState;
use crate::sync::store::LocalStore;

/// Summary printed by the `status` command.
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub state: SyncState,
    pub items: Vec<MutationQueueItem>,
}

impl QueueStatus {
    pub fn parked(&self, ceiling: u32) -> usize {
        self.items
            .iter()
            .filter(|item| item.retry_count >= ceiling)
            .count()
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<SyncEngine>,
    connectivity: ManualConnectivity,
    monitor: ConnectivityMonitor,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let store = LocalStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open store at {:?}", config.db_path))?;
        Self::with_store(config, store).await
    }

    pub async fn with_store(config: DaemonConfig, store: LocalStore) -> anyhow::Result<Self> {
        let mut client = BackendClient::with_timeout(&config.api_url, config.request_timeout)
            .with_context(|| format!("invalid api url {}", config.api_url))?;
        if let Some(token) = &config.api_token {
            client = client.with_token(token.clone());
        }
        let engine = Arc::new(
            SyncEngine::open(client, store, config.engine)
                .await
                .context("failed to initialize sync engine")?,
        );
        let connectivity = ManualConnectivity::new(config.start_online);
        let monitor = ConnectivityMonitor::start(&connectivity, Arc::clone(&engine));

        tracing::info!(
            api_url = %config.api_url,
            db_path = %config.db_path.display(),
            online = config.start_online,
            pending = engine.state().pending_count,
            "runtime started"
        );

        Ok(Self {
            config,
            engine,
            connectivity,
            monitor,
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn entities(&self) -> Entities {
        Entities::new(Arc::clone(&self.engine))
    }

    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    pub async fn status(&self) -> anyhow::Result<QueueStatus> {
        let items = self
            .engine
            .queue()
            .peek_all()
            .await
            .context("failed to read mutation queue")?;
        Ok(QueueStatus {
            state: self.engine.state(),
            items,
        })
    }

    pub async fn sync(&self) -> anyhow::Result<DrainReport> {
        Ok(self.engine.drain().await?)
    }

    pub async fn retry_failed(&self) -> anyhow::Result<DrainReport> {
        Ok(self.engine.retry_failed().await?)
    }

    pub async fn clear(&self) -> anyhow::Result<usize> {
        Ok(self.engine.clear_queue().await?)
    }

    pub async fn shutdown(self) {
        self.monitor.shutdown().await;
        self.engine.store().close().await;
    }
}
