//! Beacon scoring engine.
//!
//! Turns one host pair's connection history into a beacon likelihood score.
//! Everything here is pure and deterministic; no I/O and no shared state.
//!
//! # Statistical Methodology
//!
//! ## Delta Calculation
//! Timestamps are sorted and turned into intervals:
//! Δᵢ = tᵢ₊₁ - tᵢ (milliseconds)
//!
//! ## Symmetry (Bowley skew)
//! skew = (Q₁ + Q₃ - 2·Q₂) / (Q₃ - Q₁)
//!
//! Timer-driven traffic has a symmetric interval distribution, so
//! `skew_score = 1 - |skew|`.
//!
//! ## Dispersion (MADM)
//! The median absolute deviation about the median, normalised by the median:
//! dispersion = MADM / Q₂
//!
//! `dispersion_score = max(0, 1 - dispersion / cutoff)`. Zero dispersion maps
//! to 1.0, so perfectly regular intervals score the maximum.
//!
//! ## Sizes
//! Payload sizes use the same skew and dispersion measures plus a smallness
//! term, `1 - mode / ceiling`, since beacons tend to send small, identical
//! payloads.
//!
//! ## Combination
//! score = w_t · timing + w_s · size, with weights normalised to sum to 1,
//! clamped to [0, 1] and rounded up to millis precision.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Max, Min, OrderStatistics};

use crate::error::ScoringError;
use crate::model::PairKey;

/// Score tiers used when presenting results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BeaconTier {
    /// score < 0.7
    Low,
    /// 0.7 ≤ score < 0.8
    Medium,
    /// 0.8 ≤ score < 0.9
    High,
    /// score ≥ 0.9 - near-perfect timer-driven traffic
    Critical,
}

impl BeaconTier {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 0.9 => Self::Critical,
            s if s >= 0.8 => Self::High,
            s if s >= 0.7 => Self::Medium,
            _ => Self::Low,
        }
    }

    /// Returns a human-readable severity level.
    pub fn severity(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }
}

impl std::fmt::Display for BeaconTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "Near-Perfect Periodicity (Probable C2)"),
            Self::High => write!(f, "Strong Periodicity (Suspicious)"),
            Self::Medium => write!(f, "Moderate Periodicity"),
            Self::Low => write!(f, "Weak Periodicity (Likely Organic)"),
        }
    }
}

/// Tunables for one sub-score.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SubScoreParams {
    /// Weight of the symmetry term.
    pub skew_weight: f64,
    /// Weight of the dispersion term.
    pub dispersion_weight: f64,
    /// Relative dispersion (MADM / median) at which the dispersion term hits 0.
    pub dispersion_cutoff: f64,
}

impl Default for SubScoreParams {
    fn default() -> Self {
        Self {
            skew_weight: 1.0,
            dispersion_weight: 1.0,
            dispersion_cutoff: 0.5,
        }
    }
}

/// Full parameter set for the scoring engine.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScoringParams {
    /// Fewer timestamps than this fails with `InsufficientData`.
    pub min_connections: usize,
    /// Combined score at or above which a pair is a beacon.
    pub threshold: f64,
    /// Histogram bucket width for the interval mode.
    pub bucket_width_ms: f64,
    pub timing_weight: f64,
    pub size_weight: f64,
    /// Weight of the smallness term inside the size sub-score.
    pub smallness_weight: f64,
    /// Payload size at which the smallness term hits 0.
    pub smallness_ceiling: f64,
    pub timing: SubScoreParams,
    pub size: SubScoreParams,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            min_connections: 4,
            threshold: 0.7,
            bucket_width_ms: 1000.0,
            timing_weight: 0.5,
            size_weight: 0.5,
            smallness_weight: 1.0,
            smallness_ceiling: 65535.0,
            timing: SubScoreParams::default(),
            size: SubScoreParams::default(),
        }
    }
}

/// Descriptive statistics for one series (intervals or sizes).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesStatistics {
    pub count: usize,
    /// Start of the most populated histogram bucket.
    pub mode: f64,
    pub mode_count: u64,
    pub median: f64,
    pub skew: f64,
    pub madm: f64,
    pub min: f64,
    pub max: f64,
    pub range: f64,
}

/// Output of the scoring engine for one pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreResult {
    pub score: f64,
    pub timing_score: f64,
    pub size_score: f64,
    pub timing: SeriesStatistics,
    pub size: SeriesStatistics,
    /// Interval histogram: bucket start (ms) → occurrences.
    pub histogram: BTreeMap<i64, u64>,
}

/// Trait for beacon scoring strategies.
pub trait Scorer: Send + Sync {
    fn score(
        &self,
        timestamps: &[DateTime<Utc>],
        sizes: &[u64],
    ) -> Result<ScoreResult, ScoringError>;

    /// Combined score at or above which a pair is classified as a beacon.
    fn threshold(&self) -> f64;
}

/// Default scorer backed by [`score`].
#[derive(Debug, Clone, Default)]
pub struct BeaconScorer {
    params: ScoringParams,
}

impl BeaconScorer {
    pub fn new(params: ScoringParams) -> Self {
        Self { params }
    }
}

impl Scorer for BeaconScorer {
    fn score(
        &self,
        timestamps: &[DateTime<Utc>],
        sizes: &[u64],
    ) -> Result<ScoreResult, ScoringError> {
        score(timestamps, sizes, &self.params)
    }

    fn threshold(&self) -> f64 {
        self.params.threshold
    }
}

/// Scores one pair's connection history.
pub fn score(
    timestamps: &[DateTime<Utc>],
    sizes: &[u64],
    params: &ScoringParams,
) -> Result<ScoreResult, ScoringError> {
    let required = params.min_connections.max(2);
    if timestamps.len() < required {
        return Err(ScoringError::InsufficientData {
            required,
            actual: timestamps.len(),
        });
    }
    if sizes.is_empty() {
        return Err(ScoringError::InsufficientData {
            required: 1,
            actual: 0,
        });
    }

    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();
    let deltas = timestamps_to_deltas(&sorted);

    let histogram = histogram(&deltas, params.bucket_width_ms);
    let timing = describe(&deltas, &histogram);

    let size_values: Vec<f64> = sizes.iter().map(|&s| s as f64).collect();
    let size = describe(&size_values, &histogram_of(&size_values, 1.0));

    let timing_score = ceil_millis(weighted(&[
        (params.timing.skew_weight, skew_score(timing.skew)),
        (
            params.timing.dispersion_weight,
            dispersion_score(timing.madm, timing.median, params.timing.dispersion_cutoff),
        ),
    ]));

    let size_score = ceil_millis(weighted(&[
        (params.size.skew_weight, skew_score(size.skew)),
        (
            params.size.dispersion_weight,
            dispersion_score(size.madm, size.median, params.size.dispersion_cutoff),
        ),
        (
            params.smallness_weight,
            smallness_score(size.mode, params.smallness_ceiling),
        ),
    ]));

    let score = ceil_millis(weighted(&[
        (params.timing_weight, timing_score),
        (params.size_weight, size_score),
    ]));

    Ok(ScoreResult {
        score,
        timing_score,
        size_score,
        timing,
        size,
        histogram,
    })
}

/// Converts timestamps to interval deltas in milliseconds.
pub fn timestamps_to_deltas(timestamps: &[DateTime<Utc>]) -> Vec<f64> {
    if timestamps.len() < 2 {
        return Vec::new();
    }

    timestamps
        .windows(2)
        .map(|window| {
            let delta = window[1].signed_duration_since(window[0]);
            delta.num_milliseconds() as f64
        })
        .collect()
}

/// Buckets interval deltas by `bucket_width_ms`, keyed by bucket start.
pub fn histogram(deltas_ms: &[f64], bucket_width_ms: f64) -> BTreeMap<i64, u64> {
    histogram_of(deltas_ms, bucket_width_ms)
}

fn histogram_of(values: &[f64], bucket_width: f64) -> BTreeMap<i64, u64> {
    let width = if bucket_width > 0.0 { bucket_width } else { 1.0 };
    let mut buckets = BTreeMap::new();
    for value in values {
        let start = ((value / width).floor() * width) as i64;
        *buckets.entry(start).or_insert(0) += 1;
    }
    buckets
}

/// Computes the statistics for a non-empty series.
fn describe(values: &[f64], buckets: &BTreeMap<i64, u64>) -> SeriesStatistics {
    let mut data = Data::new(values.to_vec());

    let median = data.median();
    let q1 = data.lower_quartile();
    let q3 = data.upper_quartile();
    let min = data.min();
    let max = data.max();

    let deviations: Vec<f64> = values.iter().map(|v| (v - median).abs()).collect();
    let madm = Data::new(deviations).median();

    // Ties resolve to the smallest bucket.
    let (mode, mode_count) = buckets
        .iter()
        .fold((0_i64, 0_u64), |best, (&bucket, &count)| {
            if count > best.1 {
                (bucket, count)
            } else {
                best
            }
        });

    SeriesStatistics {
        count: values.len(),
        mode: mode as f64,
        mode_count,
        median,
        skew: bowley_skew(q1, median, q3),
        madm,
        min,
        max,
        range: max - min,
    }
}

/// Bowley's quartile skew. Zero when the quartiles collapse.
pub fn bowley_skew(q1: f64, q2: f64, q3: f64) -> f64 {
    let denominator = q3 - q1;
    if denominator == 0.0 || q2 == q1 || q2 == q3 {
        return 0.0;
    }
    ((q1 + q3 - 2.0 * q2) / denominator).clamp(-1.0, 1.0)
}

/// `1 - |skew|`.
pub fn skew_score(skew: f64) -> f64 {
    (1.0 - skew.abs()).clamp(0.0, 1.0)
}

/// Maps MADM relative to the median onto [0, 1]; zero dispersion is 1.0.
pub fn dispersion_score(madm: f64, median: f64, cutoff: f64) -> f64 {
    let relative = if madm == 0.0 {
        0.0
    } else if median <= 0.0 {
        f64::INFINITY
    } else {
        madm / median
    };
    let cutoff = if cutoff > 0.0 { cutoff } else { f64::MIN_POSITIVE };
    (1.0 - relative / cutoff).clamp(0.0, 1.0)
}

/// Smaller payloads score higher.
pub fn smallness_score(mode: f64, ceiling: f64) -> f64 {
    if ceiling <= 0.0 {
        return 0.0;
    }
    (1.0 - mode / ceiling).clamp(0.0, 1.0)
}

fn weighted(terms: &[(f64, f64)]) -> f64 {
    let total: f64 = terms.iter().map(|(w, _)| w.max(0.0)).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let sum: f64 = terms.iter().map(|(w, v)| w.max(0.0) * v).sum();
    (sum / total).clamp(0.0, 1.0)
}

fn ceil_millis(value: f64) -> f64 {
    ((value * 1000.0).ceil() / 1000.0).clamp(0.0, 1.0)
}

/// Anything that can be placed in a "most beacon-like" ranking.
pub trait Rankable {
    fn rank_score(&self) -> f64;
    fn rank_connections(&self) -> u64;
    fn rank_key(&self) -> PairKey;
}

/// Score descending, then connection count descending, then pair key.
pub fn compare_ranked<T: Rankable>(a: &T, b: &T) -> Ordering {
    b.rank_score()
        .partial_cmp(&a.rank_score())
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.rank_connections().cmp(&a.rank_connections()))
        .then_with(|| a.rank_key().cmp(&b.rank_key()))
}

/// Sorts in place into ranking order.
pub fn rank_results<T: Rankable>(items: &mut [T]) {
    items.sort_by(compare_ranked);
}
