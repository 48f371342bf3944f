//! Connection pair sources.
//!
//! A collector is drained exactly once per run. `JsonLinesCollector` streams
//! pre-aggregated pair records from a file one line at a time, so the input
//! never has to fit in memory.

use std::collections::VecDeque;
use std::path::Path;

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, trace};

use crate::error::CollectorError;
use crate::model::ConnectionPair;

/// Lazy sequence of connection pairs.
#[async_trait]
pub trait Collector: Send {
    /// Returns the next pair, or `None` once the input is exhausted.
    async fn next_pair(&mut self) -> Result<Option<ConnectionPair>, CollectorError>;
}

/// Collector over pairs already held in memory.
#[derive(Debug, Default)]
pub struct VecCollector {
    pairs: VecDeque<ConnectionPair>,
}

impl VecCollector {
    pub fn new(pairs: Vec<ConnectionPair>) -> Self {
        Self {
            pairs: pairs.into(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.pairs.len()
    }
}

#[async_trait]
impl Collector for VecCollector {
    async fn next_pair(&mut self) -> Result<Option<ConnectionPair>, CollectorError> {
        Ok(self.pairs.pop_front())
    }
}

/// Streams one JSON `ConnectionPair` per line. Blank lines are skipped.
pub struct JsonLinesCollector {
    lines: Lines<BufReader<File>>,
    line_number: usize,
}

impl JsonLinesCollector {
    pub async fn open(path: &Path) -> Result<Self, CollectorError> {
        let file = File::open(path).await?;
        debug!("Reading connection pairs from {}", path.display());
        Ok(Self {
            lines: BufReader::new(file).lines(),
            line_number: 0,
        })
    }
}

#[async_trait]
impl Collector for JsonLinesCollector {
    async fn next_pair(&mut self) -> Result<Option<ConnectionPair>, CollectorError> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_number += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let pair: ConnectionPair =
                serde_json::from_str(trimmed).map_err(|source| CollectorError::Parse {
                    line: self.line_number,
                    source,
                })?;
            trace!("Collected {}", pair.key);
            return Ok(Some(pair));
        }
        Ok(None)
    }
}
