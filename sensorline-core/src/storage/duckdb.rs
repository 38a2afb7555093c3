//! DuckDB storage backend implementation.
//!
//! Readings live in a single append-only table. Ids come from a sequence and
//! timestamps are stored as UTC microseconds since the epoch. An index on
//! `(sensor_type, sensor_id, timestamp)` serves the range scans issued by the
//! query engine.
//!
//! # Configuration
//!
//! ```toml
//! [store]
//! connection = "sensorline.db"   # Use ":memory:" for an in-memory database
//! table = "sensor_data"
//! pool_max = 20
//! pool_min = 1
//! checkout_timeout_secs = 30
//! ```
//!
//! All access goes through a bounded bb8 pool. A checkout that cannot be served
//! within the timeout fails with `StoreError::Unavailable`, which ingestors
//! treat as backpressure and answer with redelivery. Shutting the store down
//! drops the pool, so a file database is released once the last checked-out
//! connection comes back.

use crate::config::StoreConfig;
use crate::reading::{NewReading, Reading, RowId, SensorKey};
use crate::storage::pool::{build_pool, DuckDbConnectionManager, PoolConfig};
use crate::storage::{SeriesFilter, Store, StoreError};
use async_trait::async_trait;
use bb8::{Pool, PooledConnection, RunError};
use chrono::{DateTime, Utc};
use duckdb::{params, Connection, ToSql};
use std::collections::BTreeSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Error classes DuckDB reports for statements that can never succeed.
const INVALID_ERROR_CLASSES: [&str; 7] = [
    "Constraint Error",
    "Conversion Error",
    "Binder Error",
    "Parser Error",
    "Catalog Error",
    "Invalid Input Error",
    "Out of Range Error",
];

/// DuckDB-based store for sensor readings.
pub struct DuckDbStore {
    /// `None` once the store has been shut down.
    pool: RwLock<Option<Pool<DuckDbConnectionManager>>>,
    table: String,
}

impl DuckDbStore {
    /// Opens (or creates) the database at `connection`.
    ///
    /// Must be called from within a tokio runtime; the pool starts its
    /// background tasks immediately.
    pub fn new(connection: &str, table: &str, pool_config: &PoolConfig) -> Result<Self, StoreError> {
        Self::open(connection, table, None, pool_config)
    }

    /// Creates a store over a private in-memory database.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        Self::new(":memory:", "sensor_data", &PoolConfig::default())
    }

    /// Creates a store from the `[store]` configuration section.
    pub fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        Self::open(&config.connection, &config.table, config.threads, &config.pool_config())
    }

    fn open(connection: &str, table: &str, threads: Option<i64>, pool_config: &PoolConfig) -> Result<Self, StoreError> {
        validate_table_name(table)?;
        let manager = DuckDbConnectionManager::open(connection, threads)
            .map_err(|e| StoreError::Unavailable(format!("failed to open {}: {}", connection, e)))?;

        Ok(Self {
            pool: RwLock::new(Some(build_pool(manager, pool_config))),
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    // A poisoned lock still guards a usable pool handle.
    fn pool_read(&self) -> RwLockReadGuard<'_, Option<Pool<DuckDbConnectionManager>>> {
        self.pool.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pool_write(&self) -> RwLockWriteGuard<'_, Option<Pool<DuckDbConnectionManager>>> {
        self.pool.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn checkout(&self) -> Result<PooledConnection<'static, DuckDbConnectionManager>, StoreError> {
        let pool = self
            .pool_read()
            .clone()
            .ok_or_else(|| StoreError::Unavailable("store is shut down".to_string()))?;
        pool.get_owned().await.map_err(|e| match e {
            RunError::User(e) => StoreError::Unavailable(format!("connection failed: {}", e)),
            RunError::TimedOut => StoreError::Unavailable("timed out waiting for a pooled connection".to_string()),
        })
    }

    fn insert_row(&self, conn: &Connection, reading: &NewReading, sensor_id: Option<i16>) -> Result<RowId, StoreError> {
        let timestamp = reading.timestamp.unwrap_or_else(Utc::now);
        let sql = format!(
            "INSERT INTO {} (timestamp, sensor_id, sensor_type, value) VALUES (?, ?, ?, ?) RETURNING id",
            self.table
        );

        conn.query_row(
            &sql,
            params![timestamp.timestamp_micros(), sensor_id, reading.sensor_type, reading.value],
            |row| row.get::<_, i64>(0),
        )
        .map_err(classify)
    }

    fn select_range(&self, conn: &Connection, filter: &SeriesFilter) -> Result<Vec<Reading>, StoreError> {
        let mut sql = format!(
            "SELECT id, timestamp, sensor_id, sensor_type, value FROM {} \
             WHERE sensor_type = ? AND timestamp >= ?",
            self.table
        );
        let mut param_values: Vec<Box<dyn ToSql>> = vec![
            Box::new(filter.sensor_type.clone()),
            Box::new(filter.since.timestamp_micros()),
        ];

        if let Some(ids) = &filter.sensor_ids {
            let placeholders = vec!["?"; ids.len()].join(", ");
            sql.push_str(&format!(" AND sensor_id IN ({})", placeholders));
            for id in ids {
                param_values.push(Box::new(*id));
            }
        }
        sql.push_str(" ORDER BY timestamp ASC, id ASC");

        let mut stmt = conn.prepare(&sql).map_err(classify)?;
        let param_refs: Vec<&dyn ToSql> = param_values.iter().map(|p| p.as_ref()).collect();
        let mut rows = stmt.query(param_refs.as_slice()).map_err(classify)?;

        let mut readings = Vec::new();
        while let Some(row) = rows.next().map_err(classify)? {
            let micros: i64 = row.get(1).map_err(classify)?;
            readings.push(Reading {
                id: row.get(0).map_err(classify)?,
                timestamp: from_micros(micros)?,
                sensor_id: row.get(2).map_err(classify)?,
                sensor_type: row.get(3).map_err(classify)?,
                value: row.get(4).map_err(classify)?,
            });
        }

        Ok(readings)
    }

    fn select_sensors(&self, conn: &Connection) -> Result<BTreeSet<SensorKey>, StoreError> {
        let sql = format!("SELECT DISTINCT sensor_type, sensor_id FROM {}", self.table);
        let mut stmt = conn.prepare(&sql).map_err(classify)?;
        let mut rows = stmt.query(params![]).map_err(classify)?;

        let mut sensors = BTreeSet::new();
        while let Some(row) = rows.next().map_err(classify)? {
            sensors.insert(SensorKey {
                sensor_type: row.get(0).map_err(classify)?,
                sensor_id: row.get(1).map_err(classify)?,
            });
        }
        Ok(sensors)
    }
}

#[async_trait]
impl Store for DuckDbStore {
    async fn initialize(&self) -> Result<(), StoreError> {
        let conn = self.checkout().await?;
        conn.execute_batch(&format!(
            r#"
            CREATE SEQUENCE IF NOT EXISTS {table}_id_seq START 1;

            CREATE TABLE IF NOT EXISTS {table} (
                id BIGINT PRIMARY KEY DEFAULT nextval('{table}_id_seq'),
                timestamp BIGINT NOT NULL,
                sensor_id SMALLINT,
                sensor_type VARCHAR NOT NULL,
                value DOUBLE NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_{table}_series
            ON {table}(sensor_type, sensor_id, timestamp);
            "#,
            table = self.table
        ))
        .map_err(classify)?;

        info!(table = %self.table, "store schema ready");
        Ok(())
    }

    async fn insert(&self, reading: NewReading) -> Result<RowId, StoreError> {
        let sensor_id = validate(&reading)?;
        let conn = self.checkout().await?;
        let id = self.insert_row(&conn, &reading, sensor_id)?;
        debug!(row_id = id, sensor_type = %reading.sensor_type, "inserted reading");
        Ok(id)
    }

    async fn query_range(&self, filter: &SeriesFilter) -> Result<Vec<Reading>, StoreError> {
        if matches!(&filter.sensor_ids, Some(ids) if ids.is_empty()) {
            return Ok(Vec::new());
        }
        let conn = self.checkout().await?;
        self.select_range(&conn, filter)
    }

    async fn distinct_sensors(&self) -> Result<BTreeSet<SensorKey>, StoreError> {
        let conn = self.checkout().await?;
        self.select_sensors(&conn)
    }

    async fn shutdown(&self) {
        let pool = self.pool_write().take();
        if let Some(pool) = pool {
            let state = pool.state();
            drop(pool);
            info!(table = %self.table, checked_out = state.connections - state.idle_connections, "store shut down");
        }
    }
}

/// Rejects readings that violate the table's constraints before touching the
/// database.
fn validate(reading: &NewReading) -> Result<Option<i16>, StoreError> {
    if reading.sensor_type.trim().is_empty() {
        return Err(StoreError::Invalid("sensor_type must not be empty".to_string()));
    }
    if !reading.value.is_finite() {
        return Err(StoreError::Invalid(format!("value {} is not finite", reading.value)));
    }
    reading
        .sensor_id
        .map(|id| {
            i16::try_from(id).map_err(|_| StoreError::Invalid(format!("sensor_id {} is out of range", id)))
        })
        .transpose()
}

fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let mut chars = table.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(StoreError::Invalid(format!("invalid table name {:?}", table)))
    }
}

fn classify(err: duckdb::Error) -> StoreError {
    let message = err.to_string();
    if INVALID_ERROR_CLASSES.iter().any(|class| message.contains(class)) {
        StoreError::Invalid(message)
    } else {
        StoreError::Unavailable(message)
    }
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Invalid(format!("timestamp {} is out of range", micros)))
}
