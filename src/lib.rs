//! beacon-hunt: batch beacon detection over aggregated connection logs.
//!
//! Connection histories are scored for timer-driven regularity by a pool of
//! analyzer workers. A single writer records each pair as a beacon or a
//! plain connection, keeping the two collections mutually exclusive.

pub mod analyzer;
pub mod collector;
pub mod config;
pub mod error;
pub mod export;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod scoring;
pub mod store;
pub mod writer;
