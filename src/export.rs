//! Export Module
//!
//! Renders stored beacon records, host rollups and run reports as text,
//! JSON or JSON Lines for analysts and downstream security tooling.

use std::cmp::Ordering;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::model::{BeaconRecord, Document, HostAggregate, PairKey, Selector};
use crate::pipeline::RunReport;
use crate::scoring::{rank_results, BeaconTier, Rankable};

/// Output format for exports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    JsonLines, // One JSON object per line (JSONL)
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "jsonl" | "jsonlines" => Ok(Self::JsonLines),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::JsonLines => write!(f, "jsonl"),
        }
    }
}

impl Rankable for BeaconRecord {
    fn rank_score(&self) -> f64 {
        self.score
    }

    fn rank_connections(&self) -> u64 {
        self.connection_count
    }

    fn rank_key(&self) -> PairKey {
        self.key()
    }
}

/// Decodes stored documents, skipping (and logging) any that do not match
/// the record shape.
pub fn decode_records<T: DeserializeOwned>(collection: &str, documents: Vec<(Selector, Document)>) -> Vec<T> {
    documents
        .into_iter()
        .filter_map(|(selector, document)| {
            match serde_json::from_value(serde_json::Value::Object(document)) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping malformed {} record {}: {}", collection, selector, e);
                    None
                }
            }
        })
        .collect()
}

/// Ranks beacons most-suspicious first and keeps at most `limit`.
pub fn top_beacons(mut records: Vec<BeaconRecord>, limit: usize) -> Vec<BeaconRecord> {
    rank_results(&mut records);
    records.truncate(limit);
    records
}

/// Ranks hosts by beacon count, then strongest beacon, and keeps at most `limit`.
/// Hosts whose beacons have all been demoted are left out.
pub fn top_hosts(mut hosts: Vec<HostAggregate>, limit: usize) -> Vec<HostAggregate> {
    hosts.retain(|h| h.beacon_count() > 0);
    hosts.sort_by(|a, b| {
        b.beacon_count()
            .cmp(&a.beacon_count())
            .then_with(|| b.max_score().partial_cmp(&a.max_score()).unwrap_or(Ordering::Equal))
            .then_with(|| a.host.cmp(&b.host))
    });
    hosts.truncate(limit);
    hosts
}

/// JSON envelope for a listing
#[derive(Serialize)]
struct JsonListing<'a, T> {
    version: &'static str,
    timestamp: String,
    count: usize,
    records: &'a [T],
}

fn export_listing<T: Serialize>(records: &[T], format: OutputFormat, summary: &str) -> String {
    match format {
        OutputFormat::Json => {
            let listing = JsonListing {
                version: "1.0",
                timestamp: Utc::now().to_rfc3339(),
                count: records.len(),
                records,
            };
            serde_json::to_string_pretty(&listing)
                .unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
        }
        OutputFormat::JsonLines => {
            let mut lines = Vec::with_capacity(records.len() + 1);

            // First line is the summary
            let header = serde_json::json!({
                "type": "summary",
                "timestamp": Utc::now().to_rfc3339(),
                "listing": summary,
                "count": records.len(),
            });
            lines.push(serde_json::to_string(&header).unwrap_or_default());

            for record in records {
                if let Ok(line) = serde_json::to_string(record) {
                    lines.push(line);
                }
            }
            lines.join("\n")
        }
        OutputFormat::Text => String::new(),
    }
}

/// Exports beacon records in the specified format
pub fn export_beacons(records: &[BeaconRecord], format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => beacons_text(records),
        _ => export_listing(records, format, "beacons"),
    }
}

/// Exports host rollups in the specified format
pub fn export_hosts(hosts: &[HostAggregate], format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => hosts_text(hosts),
        _ => export_listing(hosts, format, "hosts"),
    }
}

fn beacons_text(records: &[BeaconRecord]) -> String {
    let mut output = String::new();

    if records.is_empty() {
        output.push_str("Beacons: None detected\n");
        return output;
    }

    output.push_str(&format!("--- Beacons ({}) ---\n", records.len()));
    output.push_str(&"-".repeat(100));
    output.push('\n');

    for record in records {
        output.push_str(&format!(
            "[{:8}] {} -> {} | Score: {:.3} (timing {:.3}, size {:.3}) | Interval: {} | Size: {}B | Conns: {} | {}\n",
            record.severity,
            record.src,
            record.dst,
            record.score,
            record.timing_score,
            record.size_score,
            format_interval(Some(record.interval_mode_ms)),
            record.size_mode,
            record.connection_count,
            BeaconTier::from_score(record.score),
        ));
    }

    output
}

fn hosts_text(hosts: &[HostAggregate]) -> String {
    let mut output = String::new();

    if hosts.is_empty() {
        output.push_str("Hosts: None involved in beacons\n");
        return output;
    }

    output.push_str(&format!("--- Beaconing Hosts ({}) ---\n", hosts.len()));
    for host in hosts {
        output.push_str(&format!(
            "{:<40} beacons: {:>4} | max score: {:.3} | peers: {}\n",
            host.host,
            host.beacon_count(),
            host.max_score(),
            host.beacon_peers.keys().cloned().collect::<Vec<_>>().join(", "),
        ));
    }

    output
}

/// Exports a run report in the specified format
pub fn export_run_report(report: &RunReport, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(report)
            .unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e)),
        OutputFormat::JsonLines => serde_json::to_string(report)
            .unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e)),
        OutputFormat::Text => run_report_text(report),
    }
}

fn run_report_text(report: &RunReport) -> String {
    let stats = &report.stats;
    let mut output = String::new();

    output.push_str(&format!(
        "--- Run Report{} ---\nStarted: {}\nDuration: {:.1}s\nPairs Analyzed: {}\nBeacons: {}\nPlain Connections: {} ({} insufficient data)\nUpdates Applied: {}\nPeak In Flight: {}\n",
        if report.is_partial() { " (partial)" } else { "" },
        report.started_at.format("%Y-%m-%d %H:%M:%S"),
        report.duration().num_milliseconds() as f64 / 1000.0,
        stats.pairs_analyzed,
        stats.beacons,
        stats.plain_connections,
        stats.insufficient_data,
        stats.updates_applied,
        stats.max_in_flight,
    ));

    if !report.worker_faults.is_empty() {
        output.push_str(&format!("\nWorker Faults ({}):\n", report.worker_faults.len()));
        for fault in &report.worker_faults {
            let pair = fault
                .pair
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            output.push_str(&format!("  worker {} | {} | {}\n", fault.worker, pair, fault.message));
        }
    }

    if !report.write_failures.is_empty() {
        output.push_str(&format!("\nWrite Failures ({}):\n", report.write_failures.len()));
        for failure in &report.write_failures {
            output.push_str(&format!(
                "  {} {} {} | {}\n",
                failure.op, failure.collection, failure.selector, failure.message
            ));
        }
    }

    output
}

/// Formats an interval in a human-readable way
fn format_interval(ms: Option<f64>) -> String {
    match ms {
        Some(ms) if ms >= 1000.0 => format!("{:.1}s", ms / 1000.0),
        Some(ms) => format!("{:.0}ms", ms),
        None => "N/A".to_string(),
    }
}
