// ============================================================================
// PROVIDER WORKER
// ============================================================================
// One refresh loop per enabled provider.
//
// A refresh runs the connector and the filter chain concurrently: the
// connector pushes raw records into a bounded channel, the chain drains it
// and keeps the records that survive. Only a complete refresh replaces the
// provider set in the catalog; a failed or cancelled one keeps the previous
// data.
// ============================================================================

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex as TokioMutex, Notify};
use tokio::task::JoinHandle as TokioJoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, FilterChain, ProviderHandle, Record};
use crate::storage::Provider;

/// Capacity of the channel between a connector and its filter chain.
const RECORD_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Stopped,
    Running,
    Refreshing,
    /// The loop panicked; the provider must be restarted explicitly.
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub refreshes: u64,
    pub failures: u64,
    pub records: usize,
    pub last_refresh: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_error: Option<String>,
}

/// State shared between the worker and its spawned loop.
struct Shared {
    handle: Arc<ProviderHandle>,
    filters: FilterChain,
    catalog: Arc<Catalog>,
    state: RwLock<WorkerState>,
    stats: RwLock<WorkerStats>,
}

impl Shared {
    fn set_state(&self, state: WorkerState) {
        *self.state.write() = state;
    }

    /// Run one refresh. Returns once the catalog was updated, the refresh
    /// failed, or `cancel` fired.
    async fn refresh(&self, cancel: &CancellationToken) {
        let provider = &self.handle.name;
        let started = Instant::now();
        self.set_state(WorkerState::Refreshing);

        let (tx, mut rx) = mpsc::channel::<Record>(RECORD_BUFFER);
        let connector = self.handle.connector.clone();

        let produce = async move {
            let result = connector.refresh(&tx).await;
            drop(tx);
            result
        };
        let drain = async {
            let mut records = Vec::new();
            while let Some(record) = rx.recv().await {
                if let Some(record) = self.filters.apply(record) {
                    records.push(record);
                }
            }
            records
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            outcome = async { tokio::join!(produce, drain) } => Some(outcome),
        };

        match outcome {
            None => {
                debug!(target: "facette::poller", provider = %provider, "Refresh cancelled");
            }
            Some((Ok(()), records)) => {
                let count = records.len();
                self.catalog.replace_provider_set(self.handle.clone(), records);

                let mut stats = self.stats.write();
                stats.refreshes += 1;
                stats.records = count;
                stats.last_refresh = Some(Utc::now());
                stats.last_duration_ms = Some(started.elapsed().as_millis() as u64);
                stats.last_error = None;

                info!(
                    target: "facette::poller",
                    provider = %provider,
                    records = count,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Provider refreshed"
                );
            }
            Some((Err(e), _)) => {
                let mut stats = self.stats.write();
                stats.failures += 1;
                stats.last_error = Some(e.to_string());

                warn!(target: "facette::poller", provider = %provider, error = %e, "Provider refresh failed");
            }
        }

        self.set_state(WorkerState::Running);
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

pub struct Worker {
    id: String,
    refresh_interval: Duration,
    shared: Arc<Shared>,
    refresh: Arc<Notify>,
    cancel: CancellationToken,
    task_handle: TokioMutex<Option<TokioJoinHandle<()>>>,
}

impl Worker {
    /// Build a stopped worker. `cancel` is a child of the poller token.
    pub fn new(
        provider: &Provider,
        handle: Arc<ProviderHandle>,
        catalog: Arc<Catalog>,
        cancel: CancellationToken,
    ) -> Self {
        let filters = FilterChain::new(&provider.item.name, &provider.filters);

        Self {
            id: provider.item.id.clone(),
            refresh_interval: Duration::from_secs(provider.refresh_interval),
            shared: Arc::new(Shared {
                handle,
                filters,
                catalog,
                state: RwLock::new(WorkerState::Stopped),
                stats: RwLock::new(WorkerStats::default()),
            }),
            refresh: Arc::new(Notify::new()),
            cancel,
            task_handle: TokioMutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.shared.handle.name
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.read()
    }

    pub fn stats(&self) -> WorkerStats {
        self.shared.stats.read().clone()
    }

    /// Spawn the refresh loop. An initial refresh runs right away.
    pub async fn run(&self) {
        let mut task = self.task_handle.lock().await;
        if task.is_some() {
            return;
        }

        let shared = self.shared.clone();
        let refresh = self.refresh.clone();
        let cancel = self.cancel.clone();
        let period = self.refresh_interval;

        shared.set_state(WorkerState::Running);

        let handle = tokio::spawn(async move {
            let name = shared.handle.name.clone();
            let body = async {
                let mut ticker = (!period.is_zero()).then(|| {
                    let mut ticker = interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    ticker
                });
                // First tick of an interval completes immediately
                if let Some(ticker) = ticker.as_mut() {
                    ticker.tick().await;
                }

                shared.refresh(&cancel).await;

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = refresh.notified() => shared.refresh(&cancel).await,
                        _ = next_tick(&mut ticker) => shared.refresh(&cancel).await,
                    }
                }
            };

            match AssertUnwindSafe(body).catch_unwind().await {
                Ok(()) => {
                    shared.set_state(WorkerState::Stopped);
                    debug!(target: "facette::poller", provider = %name, "Worker loop exited");
                }
                Err(_) => {
                    shared.set_state(WorkerState::Failed);
                    error!(target: "facette::poller", provider = %name, "Worker panicked, restart the provider to resume refreshes");
                }
            }
        });

        *task = Some(handle);
        info!(
            target: "facette::poller",
            provider = %self.name(),
            interval_secs = period.as_secs(),
            "Provider worker started"
        );
    }

    /// Request a refresh. Requests received while one is in flight collapse
    /// into a single follow-up refresh.
    pub fn refresh(&self) {
        self.refresh.notify_one();
    }

    /// Stop the loop and wait for it to return.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        if let Some(handle) = self.task_handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(target: "facette::poller", provider = %self.name(), error = %e, "Worker task ended abnormally");
            }
        }

        if self.state() != WorkerState::Failed {
            self.shared.set_state(WorkerState::Stopped);
        }
        info!(target: "facette::poller", provider = %self.name(), "Provider worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ProviderFilter;
    use crate::connector::testing::MemoryConnector;
    use crate::storage::Item;
    use pretty_assertions::assert_eq;

    fn provider(refresh_interval: u64) -> Provider {
        Provider {
            item: Item {
                id: "p1".into(),
                ..Item::named("p1")
            },
            connector: "facette".into(),
            refresh_interval,
            ..Default::default()
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_initial_refresh_fills_catalog() {
        let connector = Arc::new(
            MemoryConnector::new("p1").with_records(vec![
                Record::new("collectd", "host1", "cpu.idle"),
                Record::new("collectd", "host1", "cpu.user"),
            ]),
        );
        let catalog = Arc::new(Catalog::new());
        let mut provider = provider(0);
        provider.filters.push(ProviderFilter {
            action: "discard".into(),
            target: "metric".into(),
            pattern: "user".into(),
            into: String::new(),
        });

        let worker = Worker::new(
            &provider,
            connector.clone().handle("p1", 0),
            catalog.clone(),
            CancellationToken::new(),
        );
        worker.run().await;

        wait_for(|| worker.stats().refreshes == 1).await;
        let index = catalog.snapshot();
        assert!(index.metric_exists("collectd", "host1", "cpu.idle"));
        assert!(!index.metric_exists("collectd", "host1", "cpu.user"));
        assert_eq!(worker.stats().records, 1);

        worker.refresh();
        wait_for(|| worker.stats().refreshes == 2).await;

        worker.shutdown().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_set() {
        let connector = Arc::new(
            MemoryConnector::new("p1").with_records(vec![Record::new("o", "s", "m")]),
        );
        let catalog = Arc::new(Catalog::new());
        let worker = Worker::new(
            &provider(0),
            connector.clone().handle("p1", 0),
            catalog.clone(),
            CancellationToken::new(),
        );
        worker.run().await;
        wait_for(|| worker.stats().refreshes == 1).await;

        *connector.fail_refresh.lock() = true;
        worker.refresh();
        wait_for(|| worker.stats().failures == 1).await;

        assert!(catalog.snapshot().metric_exists("o", "s", "m"));
        assert!(worker.stats().last_error.is_some());
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_inflight_refresh() {
        let connector = Arc::new(
            MemoryConnector::new("p1").with_records(vec![Record::new("o", "s", "m")]),
        );
        *connector.refresh_delay.lock() = Some(Duration::from_secs(60));

        let catalog = Arc::new(Catalog::new());
        let worker = Worker::new(
            &provider(0),
            connector.clone().handle("p1", 0),
            catalog.clone(),
            CancellationToken::new(),
        );
        worker.run().await;
        wait_for(|| worker.state() == WorkerState::Refreshing).await;

        tokio::time::timeout(Duration::from_secs(5), worker.shutdown())
            .await
            .unwrap();
        assert_eq!(catalog.snapshot().metric_count(), 0);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_refresh() {
        let connector = Arc::new(MemoryConnector::new("p1"));
        let worker = Worker::new(
            &provider(30),
            connector.clone().handle("p1", 0),
            Arc::new(Catalog::new()),
            CancellationToken::new(),
        );
        worker.run().await;

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(connector.refreshes(), 4);
        worker.shutdown().await;
    }
}
