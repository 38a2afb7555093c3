//! Durable storage for sensor readings.
//!
//! This module provides:
//! - `Store`: the persistence contract used by ingestors and the query engine
//! - `duckdb`: the DuckDB implementation backed by a bounded connection pool
//! - `pool`: the bb8 connection manager for DuckDB
//!
//! Failures are split in two. `StoreError::Unavailable` covers anything a caller
//! may retry later (connection loss, pool exhaustion, a closed store), while
//! `StoreError::Invalid` covers rows the store will never accept.

pub mod duckdb;
pub mod pool;

use crate::reading::{NewReading, Reading, RowId, SensorKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use thiserror::Error;

/// Errors reported by a [`Store`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// Transient failure. The operation may succeed if retried.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The request violates the schema or a constraint. Retrying cannot help.
    #[error("invalid reading: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Selects a time-bounded slice of one sensor type.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesFilter {
    pub sensor_type: String,
    /// `None` selects every sensor id, including readings without one.
    pub sensor_ids: Option<Vec<i16>>,
    /// Inclusive lower bound on the reading timestamp.
    pub since: DateTime<Utc>,
}

impl SeriesFilter {
    pub fn new(sensor_type: impl Into<String>, since: DateTime<Utc>) -> Self {
        Self {
            sensor_type: sensor_type.into(),
            sensor_ids: None,
            since,
        }
    }

    pub fn with_sensor_ids(mut self, sensor_ids: impl IntoIterator<Item = i16>) -> Self {
        self.sensor_ids = Some(sensor_ids.into_iter().collect());
        self
    }
}

/// Persistence contract for readings.
///
/// Implementations must be safe to share between concurrent ingestion workers.
/// Rows are append-only: there is no update or delete path.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Ensure the schema exists. Safe to call on every start.
    async fn initialize(&self) -> Result<(), StoreError>;

    /// Append one reading, assigning its id and (when absent) its timestamp.
    async fn insert(&self, reading: NewReading) -> Result<RowId, StoreError>;

    /// Readings matching the filter, ordered by timestamp ascending.
    async fn query_range(&self, filter: &SeriesFilter) -> Result<Vec<Reading>, StoreError>;

    /// Every (sensor type, sensor id) combination ever stored.
    async fn distinct_sensors(&self) -> Result<BTreeSet<SensorKey>, StoreError>;

    /// Close the store. Subsequent calls fail with `Unavailable`.
    async fn shutdown(&self);
}
