//! Shared data model: host pairs, store selectors and documents, persisted
//! record shapes, and the `Update` handed from analyzer workers to the writer.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::ser::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::scoring::{BeaconTier, ScoreResult};

/// Directed source/destination host relationship under analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PairKey {
    pub src: IpAddr,
    pub dst: IpAddr,
}

impl PairKey {
    pub fn new(src: IpAddr, dst: IpAddr) -> Self {
        Self { src, dst }
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// Aggregated connection history for one host pair.
///
/// `timestamps` and `sizes` are parallel lists with one entry per observed
/// connection. `connection_count` may be larger than the lists when the
/// collector truncated the history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPair {
    #[serde(flatten)]
    pub key: PairKey,
    pub timestamps: Vec<DateTime<Utc>>,
    #[serde(alias = "bytes")]
    pub sizes: Vec<u64>,
    #[serde(default)]
    pub connection_count: u64,
}

impl ConnectionPair {
    pub fn new(key: PairKey, timestamps: Vec<DateTime<Utc>>, sizes: Vec<u64>) -> Self {
        let connection_count = timestamps.len() as u64;
        Self {
            key,
            timestamps,
            sizes,
            connection_count,
        }
    }

    /// Total connections, falling back to the timestamp count when the
    /// collector did not supply one.
    pub fn total_connections(&self) -> u64 {
        self.connection_count.max(self.timestamps.len() as u64)
    }
}

/// Key identifying which store record a write applies to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    Pair(PairKey),
    Host(IpAddr),
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Pair(key) => write!(f, "pair({})", key),
            Selector::Host(ip) => write!(f, "host({})", ip),
        }
    }
}

/// Schemaless record body, as held by the store.
pub type Document = Map<String, Value>;

/// Merges `patch` into `target`. Nested objects merge key by key, `null`
/// deletes the field, and any other value (arrays included) replaces what was
/// there.
pub fn merge_document(target: &mut Document, patch: &Document) {
    for (field, value) in patch {
        match (target.get_mut(field), value) {
            (_, Value::Null) => {
                target.remove(field);
            }
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_document(existing, incoming);
            }
            _ => {
                let mut value = value.clone();
                if let Value::Object(map) = &mut value {
                    map.retain(|_, v| !v.is_null());
                }
                target.insert(field.clone(), value);
            }
        }
    }
}

/// Serializes a record into a store document.
pub fn to_document<T: Serialize>(record: &T) -> Result<Document, serde_json::Error> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        other => Err(serde_json::Error::custom(format!(
            "record serialized to a non-object value: {}",
            other
        ))),
    }
}

/// One interval histogram bucket: intervals in `[bucket_ms, bucket_ms + width)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub bucket_ms: i64,
    pub count: u64,
}

/// Beacon-store record for one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconRecord {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub score: f64,
    pub timing_score: f64,
    pub size_score: f64,
    pub severity: String,
    pub connection_count: u64,
    pub interval_mode_ms: f64,
    pub interval_mode_count: u64,
    pub interval_median_ms: f64,
    pub interval_skew: f64,
    pub interval_madm_ms: f64,
    pub interval_range_ms: f64,
    pub size_mode: u64,
    pub size_mode_count: u64,
    pub size_median: f64,
    pub size_skew: f64,
    pub size_madm: f64,
    pub size_range: u64,
    /// Interval histogram, ascending by bucket. Stored as a list so an
    /// upsert replaces it whole.
    pub interval_histogram: Vec<HistogramBucket>,
    pub analyzed_at: DateTime<Utc>,
}

impl BeaconRecord {
    pub fn new(
        key: &PairKey,
        connection_count: u64,
        result: &ScoreResult,
        analyzed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            src: key.src,
            dst: key.dst,
            score: result.score,
            timing_score: result.timing_score,
            size_score: result.size_score,
            severity: BeaconTier::from_score(result.score).severity().to_string(),
            connection_count,
            interval_mode_ms: result.timing.mode,
            interval_mode_count: result.timing.mode_count,
            interval_median_ms: result.timing.median,
            interval_skew: result.timing.skew,
            interval_madm_ms: result.timing.madm,
            interval_range_ms: result.timing.range,
            size_mode: result.size.mode as u64,
            size_mode_count: result.size.mode_count,
            size_median: result.size.median,
            size_skew: result.size.skew,
            size_madm: result.size.madm,
            size_range: result.size.range as u64,
            interval_histogram: result
                .histogram
                .iter()
                .map(|(bucket, count)| HistogramBucket {
                    bucket_ms: *bucket,
                    count: *count,
                })
                .collect(),
            analyzed_at,
        }
    }

    pub fn key(&self) -> PairKey {
        PairKey::new(self.src, self.dst)
    }
}

/// Why a pair was recorded as a plain connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlainReason {
    InsufficientData,
    BelowThreshold,
}

/// Plain-connection-store record for one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub connection_count: u64,
    /// Absent when the pair had too little data to score.
    pub score: Option<f64>,
    pub timing_score: Option<f64>,
    pub size_score: Option<f64>,
    pub reason: PlainReason,
    pub analyzed_at: DateTime<Utc>,
}

impl ConnectionRecord {
    pub fn key(&self) -> PairKey {
        PairKey::new(self.src, self.dst)
    }
}

/// Per-host beacon participation rollup.
///
/// Peers are kept as a map so re-applying the same upsert leaves the record
/// unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostAggregate {
    pub host: IpAddr,
    #[serde(default)]
    pub beacon_peers: BTreeMap<String, f64>,
}

impl HostAggregate {
    pub fn beacon_count(&self) -> usize {
        self.beacon_peers.len()
    }

    pub fn max_score(&self) -> f64 {
        self.beacon_peers.values().copied().fold(0.0, f64::max)
    }

    /// Patch that drops `peer` from `host`'s beacon peers.
    pub fn peer_retraction(host: IpAddr, peer: IpAddr) -> SubUpdate {
        let mut peers = Map::new();
        peers.insert(peer.to_string(), Value::Null);
        let mut document = Document::new();
        document.insert("host".to_string(), Value::String(host.to_string()));
        document.insert("beacon_peers".to_string(), Value::Object(peers));
        SubUpdate {
            selector: Selector::Host(host),
            document,
        }
    }
}

/// A selector/document pair targeted at one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct SubUpdate {
    pub selector: Selector,
    pub document: Document,
}

/// Beacon classification write set: the pair record plus host rollups.
#[derive(Debug, Clone, PartialEq)]
pub struct BeaconUpdate {
    pub record: SubUpdate,
    pub hosts: Vec<SubUpdate>,
}

/// Unit of work handed from an analyzer worker to the writer.
///
/// Normally exactly one of `beacon` and `connection` is set, but the writer
/// accepts any combination.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub pair: PairKey,
    pub beacon: Option<BeaconUpdate>,
    pub connection: Option<SubUpdate>,
}

impl Update {
    pub fn is_empty(&self) -> bool {
        self.beacon.is_none() && self.connection.is_none()
    }
}
