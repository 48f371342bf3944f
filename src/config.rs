//! Configuration Module
//!
//! Provides TOML-based configuration for beacon-hunt.
//! Configuration is optional - CLI arguments can override file settings.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::export::OutputFormat;
use crate::pipeline::PipelineConfig;
use crate::scoring::ScoringParams;
use crate::store::CollectionNames;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub scoring: ScoringConfig,
    pub pipeline: PipelineConfig,
    pub store: StoreConfig,
    pub output: OutputConfig,
}

impl Config {
    /// Loads configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Generates a default configuration file content
    pub fn generate_default() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config)
            .unwrap_or_else(|_| "# Failed to generate config".to_string())
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        let scoring = &self.scoring.params;
        if scoring.min_connections < 2 {
            anyhow::bail!("min_connections must be at least 2");
        }
        if !(0.0..=1.0).contains(&scoring.threshold) {
            anyhow::bail!("threshold must be between 0.0 and 1.0");
        }
        if scoring.bucket_width_ms <= 0.0 {
            anyhow::bail!("bucket_width_ms must be greater than 0");
        }
        if scoring.smallness_ceiling <= 0.0 {
            anyhow::bail!("smallness_ceiling must be greater than 0");
        }
        let weights = [
            scoring.timing_weight,
            scoring.size_weight,
            scoring.smallness_weight,
            scoring.timing.skew_weight,
            scoring.timing.dispersion_weight,
            scoring.size.skew_weight,
            scoring.size.dispersion_weight,
        ];
        if weights.iter().any(|w| *w < 0.0) {
            anyhow::bail!("scoring weights must not be negative");
        }
        if scoring.timing_weight + scoring.size_weight <= 0.0 {
            anyhow::bail!("timing_weight and size_weight must not both be 0");
        }
        if self.pipeline.workers == 0 {
            anyhow::bail!("workers must be greater than 0");
        }
        if self.pipeline.work_buffer == 0 || self.pipeline.write_buffer == 0 {
            anyhow::bail!("work_buffer and write_buffer must be greater than 0");
        }
        let names = &self.store.collections;
        if names.beacon == names.connection
            || names.beacon == names.host
            || names.connection == names.host
        {
            anyhow::bail!("store collection names must be distinct");
        }
        Ok(())
    }
}

/// Scoring configuration: the engine parameters plus a sensitivity profile
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Detection profile (affects sensitivity)
    pub profile: DetectionProfile,
    #[serde(flatten)]
    pub params: ScoringParams,
}

impl ScoringConfig {
    /// Scoring parameters with the profile applied
    pub fn effective(&self) -> ScoringParams {
        let mut params = self.params.clone();
        params.threshold = self.profile.adjust_threshold(params.threshold);
        params.min_connections = self.profile.adjust_min_connections(params.min_connections);
        params
    }
}

/// Detection sensitivity profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DetectionProfile {
    /// High sensitivity, more false positives
    Paranoid,
    /// Default balanced profile
    #[default]
    Balanced,
    /// Low sensitivity, fewer beacons
    Relaxed,
}

impl DetectionProfile {
    /// Returns the adjusted beacon threshold
    pub fn adjust_threshold(&self, base: f64) -> f64 {
        match self {
            Self::Paranoid => (base - 0.1).max(0.0), // Lower bar = more beacons
            Self::Balanced => base,
            Self::Relaxed => (base + 0.1).min(1.0),
        }
    }

    /// Returns the adjusted minimum connection count
    pub fn adjust_min_connections(&self, base: usize) -> usize {
        match self {
            Self::Paranoid => base.saturating_sub(1).max(3),
            Self::Balanced => base,
            Self::Relaxed => base + 4,
        }
    }
}

impl std::fmt::Display for DetectionProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paranoid => write!(f, "paranoid"),
            Self::Balanced => write!(f, "balanced"),
            Self::Relaxed => write!(f, "relaxed"),
        }
    }
}

/// Store-related configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON snapshot the store is loaded from and saved to
    pub path: PathBuf,
    pub collections: CollectionNames,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("beacon-hunt.store.json"),
            collections: CollectionNames::default(),
        }
    }
}

/// Output-related configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output format (text, json, jsonl)
    #[serde(with = "output_format_serde")]
    pub format: OutputFormat,
    /// Maximum records shown by the show commands
    pub limit: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            limit: 50,
        }
    }
}

/// Custom serde implementation for OutputFormat
mod output_format_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(format: &OutputFormat, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<OutputFormat, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
