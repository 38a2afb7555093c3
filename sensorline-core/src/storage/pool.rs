//! Bounded DuckDB connection pool.
//!
//! DuckDB allows one database instance per file per process, so the manager
//! opens the database once and hands out clones of that root connection. Every
//! clone shares the same catalog, which also makes `:memory:` databases visible
//! to all pooled connections.

use async_trait::async_trait;
use bb8::{ManageConnection, Pool};
use duckdb::{Config, Connection};
use std::sync::Mutex;
use std::time::Duration;

/// Pool sizing and checkout behaviour.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live connections
    pub max_size: u32,
    /// Idle connections kept open
    pub min_idle: Option<u32>,
    /// How long a checkout waits for a free connection before failing
    pub checkout_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 20,
            min_idle: Some(1),
            checkout_timeout: Duration::from_secs(30),
        }
    }
}

/// bb8 manager producing DuckDB connections that share one database.
pub struct DuckDbConnectionManager {
    root: Mutex<Connection>,
}

impl DuckDbConnectionManager {
    /// Opens the database behind `connection` (a file path or `:memory:`).
    pub fn open(connection: &str, threads: Option<i64>) -> Result<Self, duckdb::Error> {
        let mut config = Config::default();
        if let Some(threads) = threads {
            config = config.threads(threads)?;
        }
        let root = Connection::open_with_flags(connection, config)?;
        Ok(Self {
            root: Mutex::new(root),
        })
    }
}

#[async_trait]
impl ManageConnection for DuckDbConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    async fn connect(&self) -> Result<Connection, duckdb::Error> {
        // A poisoned lock still guards a usable connection.
        let root = match self.root.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        root.try_clone()
    }

    async fn is_valid(&self, conn: &mut Connection) -> Result<(), duckdb::Error> {
        conn.execute_batch("SELECT 1")
    }

    fn has_broken(&self, _conn: &mut Connection) -> bool {
        false
    }
}

/// Builds the pool without opening connections up front; the first checkout
/// establishes them.
pub fn build_pool(manager: DuckDbConnectionManager, config: &PoolConfig) -> Pool<DuckDbConnectionManager> {
    Pool::builder()
        .max_size(config.max_size.max(1))
        .min_idle(config.min_idle)
        .connection_timeout(config.checkout_timeout)
        .test_on_check_out(true)
        .build_unchecked(manager)
}
