//! Writer - the single consumer that applies updates to the store.
//!
//! Updates are applied strictly one at a time in arrival order. Within one
//! update the new authoritative record is always written before the stale
//! copy in the other collection is removed, and the removal only happens if
//! that write succeeded. A demotion also drops the pair from both hosts'
//! beacon peers. Store failures are recorded and the writer moves on.

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::metrics::SharedRunMetrics;
use crate::model::{HostAggregate, Selector, SubUpdate, Update};
use crate::store::{CollectionNames, StoreHandle};

/// Store operation kind, for failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOp {
    Upsert,
    RemoveAll,
}

impl std::fmt::Display for WriteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upsert => write!(f, "upsert"),
            Self::RemoveAll => write!(f, "remove_all"),
        }
    }
}

/// One failed store operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteFailure {
    pub collection: String,
    pub selector: Selector,
    pub op: WriteOp,
    pub message: String,
}

/// What the writer reports back when it finishes.
#[derive(Debug, Default)]
pub struct WriterStats {
    pub updates_applied: u64,
    pub failures: Vec<WriteFailure>,
}

pub struct Writer {
    collections: CollectionNames,
    metrics: SharedRunMetrics,
}

impl Writer {
    pub fn new(collections: CollectionNames, metrics: SharedRunMetrics) -> Self {
        Self {
            collections,
            metrics,
        }
    }

    /// Spawns the writer task. It owns `handle` until the channel is closed
    /// and drained, then releases it and returns its stats.
    pub fn start(
        self,
        handle: Box<dyn StoreHandle>,
        rx: mpsc::Receiver<Update>,
    ) -> JoinHandle<WriterStats> {
        tokio::spawn(self.run(handle, rx))
    }

    async fn run(
        self,
        mut handle: Box<dyn StoreHandle>,
        mut rx: mpsc::Receiver<Update>,
    ) -> WriterStats {
        info!("Writer started");
        let mut stats = WriterStats::default();

        while let Some(update) = rx.recv().await {
            let mut failures = self.apply(handle.as_mut(), &update).await;
            if !failures.is_empty() {
                self.metrics.inc_failed_pair();
            }
            stats.updates_applied += 1;
            stats.failures.append(&mut failures);
            self.metrics.update_applied();
        }

        drop(handle);
        info!(
            "Writer drained: {} updates applied, {} failed writes",
            stats.updates_applied,
            stats.failures.len()
        );
        stats
    }

    /// Applies one update. Returns the store operations that failed.
    pub async fn apply(&self, handle: &mut dyn StoreHandle, update: &Update) -> Vec<WriteFailure> {
        let mut failures = Vec::new();

        if update.is_empty() {
            trace!("{}: empty update", update.pair);
            return failures;
        }

        if let Some(beacon) = &update.beacon {
            let written = self
                .upsert(handle, &self.collections.beacon, &beacon.record, &mut failures)
                .await;

            for host in &beacon.hosts {
                self.upsert(handle, &self.collections.host, host, &mut failures)
                    .await;
            }

            if written {
                self.remove_all(
                    handle,
                    &self.collections.connection,
                    &beacon.record.selector,
                    &mut failures,
                )
                .await;
            }
        }

        if let Some(connection) = &update.connection {
            let written = self
                .upsert(handle, &self.collections.connection, connection, &mut failures)
                .await;

            if written {
                let demoted = self
                    .remove_all(
                        handle,
                        &self.collections.beacon,
                        &connection.selector,
                        &mut failures,
                    )
                    .await;

                // Both hosts stop counting the pair once its beacon record is gone
                if demoted > 0 {
                    let pair = update.pair;
                    for (host, peer) in [(pair.src, pair.dst), (pair.dst, pair.src)] {
                        let retraction = HostAggregate::peer_retraction(host, peer);
                        self.upsert(handle, &self.collections.host, &retraction, &mut failures)
                            .await;
                    }
                }
            }
        }

        failures
    }

    async fn upsert(
        &self,
        handle: &mut dyn StoreHandle,
        collection: &str,
        sub: &SubUpdate,
        failures: &mut Vec<WriteFailure>,
    ) -> bool {
        match handle.upsert(collection, &sub.selector, &sub.document).await {
            Ok(()) => true,
            Err(e) => {
                self.record_failure(collection, &sub.selector, WriteOp::Upsert, e, failures);
                false
            }
        }
    }

    async fn remove_all(
        &self,
        handle: &mut dyn StoreHandle,
        collection: &str,
        selector: &Selector,
        failures: &mut Vec<WriteFailure>,
    ) -> u64 {
        match handle.remove_all(collection, selector).await {
            Ok(0) => 0,
            Ok(removed) => {
                debug!(
                    "Removed {} stale record(s) for {} from {}",
                    removed, selector, collection
                );
                removed
            }
            Err(e) => {
                self.record_failure(collection, selector, WriteOp::RemoveAll, e, failures);
                0
            }
        }
    }

    fn record_failure(
        &self,
        collection: &str,
        selector: &Selector,
        op: WriteOp,
        error: impl std::fmt::Display,
        failures: &mut Vec<WriteFailure>,
    ) {
        warn!("Store {} on {} for {} failed: {}", op, collection, selector, error);
        self.metrics.inc_write_failure();
        failures.push(WriteFailure {
            collection: collection.to_string(),
            selector: selector.clone(),
            op,
            message: error.to_string(),
        });
    }
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("collections", &self.collections)
            .finish()
    }
}

/// Convenience for applying updates outside of a running pipeline.
pub async fn apply_all(
    writer: &Writer,
    handle: &mut dyn StoreHandle,
    updates: &[Update],
) -> Vec<WriteFailure> {
    let mut failures = Vec::new();
    for update in updates {
        failures.append(&mut writer.apply(handle, update).await);
    }
    failures
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::metrics::new_shared_metrics;
    use crate::model::{BeaconUpdate, Document, HostAggregate, PairKey};
    use crate::store::{MemoryStore, Store};
    use serde_json::json;

    fn key() -> PairKey {
        PairKey::new([10, 0, 0, 5].into(), [10, 0, 0, 6].into())
    }

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn beacon_update(score: f64) -> Update {
        let k = key();
        Update {
            pair: k,
            beacon: Some(BeaconUpdate {
                record: SubUpdate {
                    selector: Selector::Pair(k),
                    document: doc(json!({"src": "10.0.0.5", "dst": "10.0.0.6", "score": score})),
                },
                hosts: vec![
                    SubUpdate {
                        selector: Selector::Host(k.src),
                        document: doc(json!({"host": "10.0.0.5", "beacon_peers": {"10.0.0.6": score}})),
                    },
                    SubUpdate {
                        selector: Selector::Host(k.dst),
                        document: doc(json!({"host": "10.0.0.6", "beacon_peers": {"10.0.0.5": score}})),
                    },
                ],
            }),
            connection: None,
        }
    }

    fn connection_update() -> Update {
        let k = key();
        Update {
            pair: k,
            beacon: None,
            connection: Some(SubUpdate {
                selector: Selector::Pair(k),
                document: doc(json!({"src": "10.0.0.5", "dst": "10.0.0.6", "connection_count": 9})),
            }),
        }
    }

    fn writer() -> Writer {
        Writer::new(CollectionNames::default(), new_shared_metrics())
    }

    #[tokio::test]
    async fn test_beacon_update_writes_record_and_hosts() {
        let store = MemoryStore::new();
        let mut handle = store.acquire().await.unwrap();

        let failures = writer().apply(handle.as_mut(), &beacon_update(0.95)).await;

        assert!(failures.is_empty());
        assert!(store.get("beacon", &Selector::Pair(key())).await.is_some());
        assert_eq!(store.len("host").await, 2);
        assert!(store.get("uconn", &Selector::Pair(key())).await.is_none());
    }

    #[tokio::test]
    async fn test_connection_update_demotes_beacon() {
        let store = MemoryStore::new();
        let mut handle = store.acquire().await.unwrap();
        let writer = writer();

        writer.apply(handle.as_mut(), &beacon_update(0.95)).await;
        writer.apply(handle.as_mut(), &connection_update()).await;

        assert!(store.get("beacon", &Selector::Pair(key())).await.is_none());
        assert_eq!(
            store.get("uconn", &Selector::Pair(key())).await.unwrap()["connection_count"],
            9
        );
    }

    #[tokio::test]
    async fn test_beacon_update_promotes_plain_connection() {
        let store = MemoryStore::new();
        let mut handle = store.acquire().await.unwrap();
        let writer = writer();

        writer.apply(handle.as_mut(), &connection_update()).await;
        writer.apply(handle.as_mut(), &beacon_update(0.9)).await;

        assert!(store.get("uconn", &Selector::Pair(key())).await.is_none());
        assert!(store.get("beacon", &Selector::Pair(key())).await.is_some());
    }

    #[tokio::test]
    async fn test_applying_twice_matches_applying_once() {
        let once = MemoryStore::new();
        let twice = MemoryStore::new();
        let writer = writer();
        let update = beacon_update(0.93);

        let mut handle = once.acquire().await.unwrap();
        writer.apply(handle.as_mut(), &update).await;

        let mut handle = twice.acquire().await.unwrap();
        writer.apply(handle.as_mut(), &update).await;
        writer.apply(handle.as_mut(), &update).await;

        for (collection, selector) in [
            ("beacon", Selector::Pair(key())),
            ("host", Selector::Host(key().src)),
            ("host", Selector::Host(key().dst)),
        ] {
            assert_eq!(
                once.get(collection, &selector).await,
                twice.get(collection, &selector).await
            );
        }
        assert_eq!(once.len("host").await, twice.len("host").await);
    }

    #[tokio::test]
    async fn test_both_sub_updates_apply_beacon_path_first() {
        let store = MemoryStore::new();
        let mut handle = store.acquire().await.unwrap();
        let mut update = beacon_update(0.97);
        update.connection = connection_update().connection;

        let failures = writer().apply(handle.as_mut(), &update).await;

        // Beacon written then demoted by the connection path in the same update
        assert!(failures.is_empty());
        assert!(store.get("beacon", &Selector::Pair(key())).await.is_none());
        assert!(store.get("uconn", &Selector::Pair(key())).await.is_some());
        assert_eq!(store.len("host").await, 2);
        let host = store.get("host", &Selector::Host(key().src)).await.unwrap();
        assert_eq!(host["beacon_peers"], json!({}));
        // 1 beacon upsert + 2 hosts + 1 uconn remove + 1 uconn upsert + 1 beacon remove
        // + 2 host retractions
        assert_eq!(store.writes(), 8);
    }

    #[tokio::test]
    async fn test_demotion_drops_peer_from_both_hosts() {
        let store = MemoryStore::new();
        let mut handle = store.acquire().await.unwrap();
        let writer = writer();
        let other = PairKey::new(key().src, [10, 0, 0, 7].into());
        let mut other_beacon = beacon_update(0.91);
        other_beacon.pair = other;
        if let Some(beacon) = other_beacon.beacon.as_mut() {
            beacon.record.selector = Selector::Pair(other);
            beacon.hosts = vec![SubUpdate {
                selector: Selector::Host(other.src),
                document: doc(json!({"host": "10.0.0.5", "beacon_peers": {"10.0.0.7": 0.91}})),
            }];
        }

        writer.apply(handle.as_mut(), &beacon_update(0.95)).await;
        writer.apply(handle.as_mut(), &other_beacon).await;
        let failures = writer.apply(handle.as_mut(), &connection_update()).await;

        assert!(failures.is_empty());
        let src: HostAggregate =
            serde_json::from_value(store.get("host", &Selector::Host(key().src)).await.unwrap().into())
                .unwrap();
        let dst: HostAggregate =
            serde_json::from_value(store.get("host", &Selector::Host(key().dst)).await.unwrap().into())
                .unwrap();
        assert_eq!(src.beacon_count(), 1);
        assert!(src.beacon_peers.contains_key("10.0.0.7"));
        assert_eq!(dst.beacon_count(), 0);
    }

    #[tokio::test]
    async fn test_plain_update_without_prior_beacon_leaves_hosts_alone() {
        let store = MemoryStore::new();
        let mut handle = store.acquire().await.unwrap();

        writer().apply(handle.as_mut(), &connection_update()).await;

        assert_eq!(store.len("host").await, 0);
        // 1 uconn upsert + 1 beacon remove
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn test_empty_update_is_noop() {
        let store = MemoryStore::new();
        let mut handle = store.acquire().await.unwrap();
        let update = Update {
            pair: key(),
            beacon: None,
            connection: None,
        };

        assert!(writer().apply(handle.as_mut(), &update).await.is_empty());
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_failed_host_upserts_are_recorded_and_processing_continues() {
        let store = MemoryStore::new();
        store.fail_collection("host");
        let metrics = new_shared_metrics();
        let writer = Writer::new(CollectionNames::default(), Arc::clone(&metrics));
        let mut handle = store.acquire().await.unwrap();

        let failures = apply_all(
            &writer,
            handle.as_mut(),
            &[beacon_update(0.95), connection_update()],
        )
        .await;

        // 2 host upserts for the beacon, 2 peer retractions for the demotion
        assert_eq!(failures.len(), 4);
        assert!(failures
            .iter()
            .all(|f| f.collection == "host" && f.op == WriteOp::Upsert));
        assert_eq!(metrics.snapshot().write_failures, 4);
        assert!(store.get("uconn", &Selector::Pair(key())).await.is_some());
        assert!(store.get("beacon", &Selector::Pair(key())).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_authoritative_write_keeps_stale_copy() {
        let store = MemoryStore::new();
        let writer = writer();
        let mut handle = store.acquire().await.unwrap();
        writer.apply(handle.as_mut(), &beacon_update(0.95)).await;

        store.fail_collection("uconn");
        let failures = writer.apply(handle.as_mut(), &connection_update()).await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].collection, "uconn");
        assert!(store.get("beacon", &Selector::Pair(key())).await.is_some());
    }

    #[tokio::test]
    async fn test_writer_task_counts_pairs_with_failed_writes_once() {
        let store = MemoryStore::new();
        store.fail_collection("host");
        let metrics = new_shared_metrics();
        let handle = store.acquire().await.unwrap();
        let (tx, rx) = mpsc::channel(4);
        let task = Writer::new(CollectionNames::default(), Arc::clone(&metrics)).start(handle, rx);

        metrics.update_enqueued();
        tx.send(beacon_update(0.95)).await.unwrap();
        metrics.update_enqueued();
        tx.send(connection_update()).await.unwrap();
        drop(tx);

        let stats = task.await.unwrap();
        assert_eq!(stats.failures.len(), 4);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.write_failures, 4);
        assert_eq!(snapshot.failed_pairs, 2);
    }

    #[tokio::test]
    async fn test_writer_task_drains_and_releases_handle() {
        let store = MemoryStore::new();
        let metrics = new_shared_metrics();
        let handle = store.acquire().await.unwrap();
        let (tx, rx) = mpsc::channel(1);
        let task = Writer::new(CollectionNames::default(), Arc::clone(&metrics)).start(handle, rx);

        for _ in 0..3 {
            metrics.update_enqueued();
            tx.send(connection_update()).await.unwrap();
        }
        drop(tx);

        let stats = task.await.unwrap();
        assert_eq!(stats.updates_applied, 3);
        assert_eq!(store.open_handles(), 0);
        assert_eq!(metrics.in_flight(), 0);
    }
}
