//! Run coordinator.
//!
//! Wires the pipeline together:
//!
//! ```text
//! ┌─────────────┐      ┌──────────────┐      ┌─────────────┐      ┌─────────┐
//! │  Collector  │─────>│ Analyzer x N │─────>│   Writer    │─────>│  Store  │
//! │ (next_pair) │ work │  (scoring)   │update│ (1 handle)  │      │         │
//! └─────────────┘      └──────────────┘      └─────────────┘      └─────────┘
//!   coordinator         JoinSet tasks          single task
//! ```
//!
//! Both channels are bounded, so a slow store throttles the workers, which
//! in turn throttle how fast pairs are pulled from the collector.
//!
//! Shutdown is ordered: the coordinator closes the work channel, the workers
//! drain it and drop their update senders, the writer drains the update
//! channel and releases its handle, and only then is the run reported.
//!
//! The coordinator reserves a slot in the work channel before it pulls the
//! next pair, so a shutdown request wakes it even when every worker is busy,
//! and a pair taken from the collector is never dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};

use crate::analyzer::{join_workers, AnalyzerPool, WorkerFault};
use crate::collector::Collector;
use crate::error::PipelineError;
use crate::metrics::{new_shared_metrics, RunStats};
use crate::scoring::Scorer;
use crate::store::{CollectionNames, Store};
use crate::writer::{WriteFailure, Writer};

/// Concurrency settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of analyzer workers.
    pub workers: usize,
    /// Capacity of the collector → worker channel.
    pub work_buffer: usize,
    /// Capacity of the worker → writer channel.
    pub write_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            workers,
            work_buffer: workers * 2,
            write_buffer: 64,
        }
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Set when the run stopped early because of a shutdown request.
    pub cancelled: bool,
    pub stats: RunStats,
    pub write_failures: Vec<WriteFailure>,
    pub worker_faults: Vec<WorkerFault>,
}

impl RunReport {
    pub fn is_partial(&self) -> bool {
        self.cancelled
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at.signed_duration_since(self.started_at)
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} run: {} pairs analyzed, {} beacons, {} plain ({} insufficient data), {} failed",
            if self.cancelled { "Partial" } else { "Completed" },
            self.stats.pairs_analyzed,
            self.stats.beacons,
            self.stats.plain_connections,
            self.stats.insufficient_data,
            self.stats.failed(),
        )
    }
}

/// Cooperative cancellation shared between the coordinator and whoever
/// requests the stop (Ctrl+C in the CLI).
#[derive(Debug, Default)]
pub struct Shutdown {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once `request` has been called.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Registered before the flag check so a request in between is not missed
        notified.as_mut().enable();
        if self.is_requested() {
            return;
        }
        notified.await;
    }
}

/// The beacon analysis pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    scorer: Arc<dyn Scorer>,
    collections: CollectionNames,
    shutdown: Arc<Shutdown>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, scorer: Arc<dyn Scorer>, collections: CollectionNames) -> Self {
        Self {
            config,
            scorer,
            collections,
            shutdown: Arc::new(Shutdown::default()),
        }
    }

    /// Returns a handle to request cooperative cancellation.
    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        Arc::clone(&self.shutdown)
    }

    /// Runs one analysis pass over everything `collector` yields.
    ///
    /// On cancellation no further pairs are pulled, but every pair already
    /// handed to a worker is analyzed and its update applied. A collector
    /// failure is reported the same way, as an error carrying the partial
    /// report. A writer panic is an error too, since updates it had not yet
    /// applied are lost.
    pub async fn run<C>(&self, collector: &mut C, store: &dyn Store) -> Result<RunReport, PipelineError>
    where
        C: Collector + ?Sized,
    {
        let started_at = Utc::now();
        let metrics = new_shared_metrics();

        let handle = store.acquire().await?;
        let (update_tx, update_rx) = mpsc::channel(self.config.write_buffer.max(1));
        let writer = Writer::new(self.collections.clone(), Arc::clone(&metrics)).start(handle, update_rx);

        let (work_tx, work_rx) = mpsc::channel(self.config.work_buffer.max(1));
        let workers = AnalyzerPool::new(
            Arc::clone(&self.scorer),
            Arc::clone(&metrics),
            self.config.workers,
        )
        .start(work_rx, update_tx);

        info!("Pipeline started");

        let mut dispatched: u64 = 0;
        let mut cancelled = false;
        let mut collector_error = None;

        loop {
            if self.shutdown.is_requested() {
                info!("Shutdown requested after {} pairs, draining", dispatched);
                cancelled = true;
                break;
            }

            let permit = tokio::select! {
                permit = work_tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("All analyzer workers exited, stopping collection");
                        break;
                    }
                },
                _ = self.shutdown.wait() => continue,
            };

            match collector.next_pair().await {
                Ok(Some(pair)) => {
                    permit.send(pair);
                    dispatched += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Collector failed after {} pairs: {}", dispatched, e);
                    collector_error = Some(e);
                    break;
                }
            }
        }

        drop(work_tx);
        let worker_faults = join_workers(workers, &metrics).await;

        let (write_failures, writer_error) = match writer.await {
            Ok(stats) => (stats.failures, None),
            Err(e) => {
                error!("Writer task failed: {}", e);
                (Vec::new(), Some(e))
            }
        };

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            cancelled,
            stats: metrics.snapshot(),
            write_failures,
            worker_faults,
        };
        info!("{}", report);

        match (writer_error, collector_error) {
            (Some(source), _) => Err(PipelineError::Writer {
                source,
                report: Box::new(report),
            }),
            (None, Some(source)) => Err(PipelineError::Collector {
                source,
                report: Box::new(report),
            }),
            (None, None) => Ok(report),
        }
    }
}
