// ============================================================================
// PROVIDER POLLER
// ============================================================================
// Supervisor of the provider workers:
// - one worker per enabled provider, keyed by provider identifier
// - starts and stops serialize per provider, providers run in parallel
// - a root cancellation token reaches every worker on shutdown
// ============================================================================

pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::catalog::{Catalog, ProviderHandle};
use crate::connector::{new_connector, Connector, ConnectorContext};
use crate::error::ConnectorResult;
use crate::storage::Provider;

pub use worker::{Worker, WorkerState, WorkerStats};

/// Builds the connector of a provider.
pub type ConnectorFactory =
    Arc<dyn Fn(&Provider, &ConnectorContext) -> ConnectorResult<Arc<dyn Connector>> + Send + Sync>;

fn default_factory() -> ConnectorFactory {
    Arc::new(|provider: &Provider, context: &ConnectorContext| {
        new_connector(&provider.connector, context, &provider.settings)
    })
}

pub struct Poller {
    catalog: Arc<Catalog>,
    instance_id: String,
    default_timeout: Duration,
    factory: ConnectorFactory,
    workers: DashMap<String, Arc<Worker>>,
    locks: DashMap<String, Arc<TokioMutex<()>>>,
    cancel: CancellationToken,
}

impl Poller {
    pub fn new(catalog: Arc<Catalog>, instance_id: impl Into<String>, default_timeout: Duration) -> Self {
        Self {
            catalog,
            instance_id: instance_id.into(),
            default_timeout,
            factory: default_factory(),
            workers: DashMap::new(),
            locks: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the connector factory.
    pub fn with_factory(mut self, factory: ConnectorFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    fn lock(&self, provider_id: &str) -> Arc<TokioMutex<()>> {
        self.locks
            .entry(provider_id.to_string())
            .or_default()
            .clone()
    }

    /// Create and run the worker of `provider`. Disabled providers and
    /// providers that already have a worker are left alone.
    pub async fn start_worker(&self, provider: &Provider) -> ConnectorResult<()> {
        let lock = self.lock(&provider.item.id);
        let _guard = lock.lock().await;
        let result = self.start_locked(provider).await;
        if !self.workers.contains_key(&provider.item.id) {
            self.release_lock(&provider.item.id, &lock);
        }
        result
    }

    async fn start_locked(&self, provider: &Provider) -> ConnectorResult<()> {
        if !provider.enabled {
            debug!(target: "facette::poller", provider = %provider.item.name, "Provider disabled, not starting");
            return Ok(());
        }
        if self.workers.contains_key(&provider.item.id) {
            return Ok(());
        }

        let timeout = provider
            .settings
            .get("timeout")
            .and_then(serde_json::Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let context = ConnectorContext::new(provider.item.name.clone(), self.instance_id.clone())
            .with_timeout(timeout);
        let connector = (self.factory)(provider, &context)?;

        let handle = Arc::new(ProviderHandle::new(
            provider.item.id.clone(),
            provider.item.name.clone(),
            provider.priority,
            connector,
        ));
        let worker = Arc::new(Worker::new(
            provider,
            handle,
            self.catalog.clone(),
            self.cancel.child_token(),
        ));
        worker.run().await;

        self.workers.insert(provider.item.id.clone(), worker);
        Ok(())
    }

    /// Stop the worker of `provider`. With `restart`, a new worker is built
    /// from `provider` once the old one returned. Records of providers left
    /// without a worker leave the catalog.
    pub async fn stop_worker(&self, provider: &Provider, restart: bool) -> ConnectorResult<()> {
        let lock = self.lock(&provider.item.id);
        let _guard = lock.lock().await;

        let previous = self.workers.remove(&provider.item.id).map(|(_, worker)| worker);
        if let Some(worker) = previous {
            worker.shutdown().await;
        }

        if restart && provider.enabled {
            let result = self.start_locked(provider).await;
            if result.is_err() {
                self.catalog.remove_provider(&provider.item.id);
            }
            return result;
        }

        self.catalog.remove_provider(&provider.item.id);
        self.release_lock(&provider.item.id, &lock);
        Ok(())
    }

    /// Forget the lock of a stopped provider unless another caller waits on it.
    fn release_lock(&self, provider_id: &str, held: &Arc<TokioMutex<()>>) {
        self.locks
            .remove_if(provider_id, |_, lock| Arc::ptr_eq(lock, held) && Arc::strong_count(lock) == 2);
    }

    /// Ask the worker of `provider_id` to refresh. Returns whether the
    /// provider has a running worker.
    pub fn refresh(&self, provider_id: &str) -> bool {
        match self.workers.get(provider_id) {
            Some(worker) => {
                worker.refresh();
                true
            }
            None => false,
        }
    }

    pub fn refresh_all(&self) {
        info!(target: "facette::poller", workers = self.workers.len(), "Refreshing all providers");
        for worker in self.workers.iter() {
            worker.refresh();
        }
    }

    pub fn worker_state(&self, provider_id: &str) -> Option<WorkerState> {
        self.workers.get(provider_id).map(|w| w.state())
    }

    pub fn worker_stats(&self, provider_id: &str) -> Option<WorkerStats> {
        self.workers.get(provider_id).map(|w| w.stats())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop every worker and wait for all of them.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let workers: Vec<Arc<Worker>> = self.workers.iter().map(|w| w.value().clone()).collect();
        self.workers.clear();
        join_all(workers.iter().map(|w| w.shutdown())).await;

        info!(target: "facette::poller", stopped = workers.len(), "Poller stopped");
    }
}
