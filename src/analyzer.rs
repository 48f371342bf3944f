//! Analyzer pool - the fan-out stage of the pipeline.
//!
//! A fixed number of workers pull connection pairs off a shared bounded
//! channel, score them, and publish one `Update` per pair to the writer.
//! Workers never touch the store; the writer is its only mutator.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace};

use crate::error::ScoringError;
use crate::metrics::SharedRunMetrics;
use crate::model::{
    to_document, BeaconRecord, BeaconUpdate, ConnectionPair, ConnectionRecord, HostAggregate,
    PairKey, PlainReason, Selector, SubUpdate, Update,
};
use crate::scoring::Scorer;

/// How a pair was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Beacon,
    BelowThreshold,
    InsufficientData,
}

/// A pair that could not be analyzed. `pair` is `None` when a worker task
/// died outside of per-pair analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerFault {
    pub worker: usize,
    pub pair: Option<PairKey>,
    pub message: String,
}

/// Scores one pair and packages the result for the writer.
pub fn build_update(
    pair: &ConnectionPair,
    scorer: &dyn Scorer,
    analyzed_at: DateTime<Utc>,
) -> Result<(Update, Classification), serde_json::Error> {
    let key = pair.key;
    let connection_count = pair.total_connections();

    let result = match scorer.score(&pair.timestamps, &pair.sizes) {
        Ok(result) => result,
        Err(ScoringError::InsufficientData { required, actual }) => {
            trace!("{}: insufficient data ({} < {})", key, actual, required);
            let record = ConnectionRecord {
                src: key.src,
                dst: key.dst,
                connection_count,
                score: None,
                timing_score: None,
                size_score: None,
                reason: PlainReason::InsufficientData,
                analyzed_at,
            };
            return Ok((
                connection_update(key, &record)?,
                Classification::InsufficientData,
            ));
        }
    };

    if result.score < scorer.threshold() {
        debug!("{}: below threshold (score {:.3})", key, result.score);
        let record = ConnectionRecord {
            src: key.src,
            dst: key.dst,
            connection_count,
            score: Some(result.score),
            timing_score: Some(result.timing_score),
            size_score: Some(result.size_score),
            reason: PlainReason::BelowThreshold,
            analyzed_at,
        };
        return Ok((
            connection_update(key, &record)?,
            Classification::BelowThreshold,
        ));
    }

    debug!("{}: beacon (score {:.3})", key, result.score);
    let record = BeaconRecord::new(&key, connection_count, &result, analyzed_at);
    let hosts = [(key.src, key.dst), (key.dst, key.src)]
        .into_iter()
        .map(|(host, peer)| {
            let aggregate = HostAggregate {
                host,
                beacon_peers: [(peer.to_string(), result.score)].into_iter().collect(),
            };
            Ok(SubUpdate {
                selector: Selector::Host(host),
                document: to_document(&aggregate)?,
            })
        })
        .collect::<Result<Vec<_>, serde_json::Error>>()?;

    let update = Update {
        pair: key,
        beacon: Some(BeaconUpdate {
            record: SubUpdate {
                selector: Selector::Pair(key),
                document: to_document(&record)?,
            },
            hosts,
        }),
        connection: None,
    };
    Ok((update, Classification::Beacon))
}

fn connection_update(key: PairKey, record: &ConnectionRecord) -> Result<Update, serde_json::Error> {
    Ok(Update {
        pair: key,
        beacon: None,
        connection: Some(SubUpdate {
            selector: Selector::Pair(key),
            document: to_document(record)?,
        }),
    })
}

/// Bounded pool of stateless analyzer workers.
pub struct AnalyzerPool {
    scorer: Arc<dyn Scorer>,
    metrics: SharedRunMetrics,
    workers: usize,
}

impl AnalyzerPool {
    pub fn new(scorer: Arc<dyn Scorer>, metrics: SharedRunMetrics, workers: usize) -> Self {
        Self {
            scorer,
            metrics,
            workers: workers.max(1),
        }
    }

    /// Spawns the workers. Each returns the faults it recorded once the work
    /// channel is closed and drained.
    pub fn start(
        self,
        work_rx: mpsc::Receiver<ConnectionPair>,
        update_tx: mpsc::Sender<Update>,
    ) -> JoinSet<Vec<WorkerFault>> {
        let work_rx = Arc::new(Mutex::new(work_rx));
        let mut set = JoinSet::new();

        for id in 0..self.workers {
            let work_rx = Arc::clone(&work_rx);
            let update_tx = update_tx.clone();
            let scorer = Arc::clone(&self.scorer);
            let metrics = Arc::clone(&self.metrics);
            set.spawn(run_worker(id, work_rx, update_tx, scorer, metrics));
        }

        info!("Analyzer pool started with {} workers", self.workers);
        set
    }
}

/// Waits for every worker and gathers their faults. A worker task that died
/// outright is reported as a fault without a pair.
pub async fn join_workers(
    mut set: JoinSet<Vec<WorkerFault>>,
    metrics: &SharedRunMetrics,
) -> Vec<WorkerFault> {
    let mut faults = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(mut worker_faults) => faults.append(&mut worker_faults),
            Err(e) => {
                error!("Analyzer worker task failed: {}", e);
                metrics.inc_worker_fault();
                faults.push(WorkerFault {
                    worker: usize::MAX,
                    pair: None,
                    message: e.to_string(),
                });
            }
        }
    }
    faults
}

/// Worker loop: pull, score, publish, until the work channel closes.
async fn run_worker(
    id: usize,
    work_rx: Arc<Mutex<mpsc::Receiver<ConnectionPair>>>,
    update_tx: mpsc::Sender<Update>,
    scorer: Arc<dyn Scorer>,
    metrics: SharedRunMetrics,
) -> Vec<WorkerFault> {
    let mut faults = Vec::new();

    loop {
        let next = work_rx.lock().await.recv().await;
        let Some(pair) = next else {
            break;
        };
        let key = pair.key;

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            build_update(&pair, scorer.as_ref(), Utc::now())
        }));

        let (update, classification) = match outcome {
            Ok(Ok(built)) => built,
            Ok(Err(e)) => {
                error!("Worker {}: could not encode records for {}: {}", id, key, e);
                metrics.inc_worker_fault();
                faults.push(WorkerFault {
                    worker: id,
                    pair: Some(key),
                    message: e.to_string(),
                });
                continue;
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!("Worker {}: analysis of {} panicked: {}", id, key, message);
                metrics.inc_worker_fault();
                faults.push(WorkerFault {
                    worker: id,
                    pair: Some(key),
                    message,
                });
                continue;
            }
        };

        metrics.update_enqueued();
        if update_tx.send(update).await.is_err() {
            metrics.update_dropped();
            error!("Worker {}: writer channel closed, dropping {}", id, key);
            metrics.inc_worker_fault();
            faults.push(WorkerFault {
                worker: id,
                pair: Some(key),
                message: "writer channel closed".to_string(),
            });
            break;
        }

        match classification {
            Classification::Beacon => metrics.inc_beacon(),
            Classification::BelowThreshold => metrics.inc_plain(false),
            Classification::InsufficientData => metrics.inc_plain(true),
        }
    }

    trace!("Worker {} finished", id);
    faults
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::new_shared_metrics;
    use crate::scoring::{BeaconScorer, ScoreResult, ScoringParams};

    fn key(a: u8, b: u8) -> PairKey {
        PairKey::new([10, 0, 0, a].into(), [10, 0, 0, b].into())
    }

    fn periodic_pair(key: PairKey, count: usize, interval_secs: i64) -> ConnectionPair {
        let base = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let timestamps = (0..count)
            .map(|i| base + chrono::Duration::seconds(interval_secs * i as i64))
            .collect();
        ConnectionPair::new(key, timestamps, vec![200; count])
    }

    #[test]
    fn test_regular_pair_builds_beacon_update() {
        let scorer = BeaconScorer::new(ScoringParams::default());
        let pair = periodic_pair(key(1, 2), 10, 60);

        let (update, classification) = build_update(&pair, &scorer, Utc::now()).unwrap();

        assert_eq!(classification, Classification::Beacon);
        assert!(update.connection.is_none());
        let beacon = update.beacon.unwrap();
        assert_eq!(beacon.record.selector, Selector::Pair(key(1, 2)));
        assert!(beacon.record.document["score"].as_f64().unwrap() >= 0.9);
        assert_eq!(beacon.record.document["connection_count"], 10);

        let hosts: Vec<&Selector> = beacon.hosts.iter().map(|h| &h.selector).collect();
        assert_eq!(
            hosts,
            vec![
                &Selector::Host(key(1, 2).src),
                &Selector::Host(key(1, 2).dst)
            ]
        );
        assert!(beacon.hosts[0].document["beacon_peers"]
            .as_object()
            .unwrap()
            .contains_key("10.0.0.2"));
    }

    #[test]
    fn test_short_pair_builds_connection_update_only() {
        let scorer = BeaconScorer::new(ScoringParams::default());
        let pair = periodic_pair(key(3, 4), 2, 60);

        let (update, classification) = build_update(&pair, &scorer, Utc::now()).unwrap();

        assert_eq!(classification, Classification::InsufficientData);
        assert!(update.beacon.is_none());
        let connection = update.connection.unwrap();
        assert_eq!(connection.document["reason"], "insufficient_data");
        assert!(connection.document["score"].is_null());
    }

    #[test]
    fn test_below_threshold_keeps_scores_on_connection_record() {
        let scorer = BeaconScorer::new(ScoringParams {
            threshold: 1.01,
            ..ScoringParams::default()
        });
        let pair = periodic_pair(key(5, 6), 10, 60);

        let (update, classification) = build_update(&pair, &scorer, Utc::now()).unwrap();

        assert_eq!(classification, Classification::BelowThreshold);
        let connection = update.connection.unwrap();
        assert_eq!(connection.document["reason"], "below_threshold");
        assert!(connection.document["score"].as_f64().is_some());
    }

    struct PanickingScorer;

    impl Scorer for PanickingScorer {
        fn score(
            &self,
            timestamps: &[DateTime<Utc>],
            _sizes: &[u64],
        ) -> Result<ScoreResult, ScoringError> {
            if timestamps.len() == 7 {
                panic!("boom");
            }
            Err(ScoringError::InsufficientData {
                required: 100,
                actual: timestamps.len(),
            })
        }

        fn threshold(&self) -> f64 {
            0.5
        }
    }

    #[tokio::test]
    async fn test_panicking_pair_is_skipped_and_counted() {
        let metrics = new_shared_metrics();
        let pool = AnalyzerPool::new(Arc::new(PanickingScorer), Arc::clone(&metrics), 2);
        let (work_tx, work_rx) = mpsc::channel(4);
        let (update_tx, mut update_rx) = mpsc::channel(16);
        let set = pool.start(work_rx, update_tx);

        work_tx.send(periodic_pair(key(1, 2), 3, 60)).await.unwrap();
        work_tx.send(periodic_pair(key(3, 4), 7, 60)).await.unwrap();
        work_tx.send(periodic_pair(key(5, 6), 5, 60)).await.unwrap();
        drop(work_tx);

        let faults = join_workers(set, &metrics).await;

        let mut received = Vec::new();
        while let Some(update) = update_rx.recv().await {
            received.push(update.pair);
        }
        received.sort();

        assert_eq!(received, vec![key(1, 2), key(5, 6)]);
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].pair, Some(key(3, 4)));
        assert_eq!(faults[0].message, "boom");

        let stats = metrics.snapshot();
        assert_eq!(stats.worker_faults, 1);
        assert_eq!(stats.pairs_analyzed, 2);
        assert_eq!(stats.insufficient_data, 2);
    }

    #[tokio::test]
    async fn test_worker_stops_when_writer_is_gone() {
        let metrics = new_shared_metrics();
        let scorer = Arc::new(BeaconScorer::default());
        let pool = AnalyzerPool::new(scorer, Arc::clone(&metrics), 1);
        let (work_tx, work_rx) = mpsc::channel(4);
        let (update_tx, update_rx) = mpsc::channel(1);
        drop(update_rx);
        let set = pool.start(work_rx, update_tx);

        work_tx.send(periodic_pair(key(1, 2), 10, 60)).await.unwrap();
        drop(work_tx);

        let faults = join_workers(set, &metrics).await;

        assert_eq!(faults.len(), 1);
        assert_eq!(metrics.in_flight(), 0);
        assert_eq!(metrics.snapshot().pairs_analyzed, 0);
    }
}
