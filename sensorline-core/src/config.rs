//! Configuration management for sensorline.
//!
//! This module provides configuration handling through multiple sources:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/sensorline/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (`SENSORLINE__SECTION__KEY`, e.g. `SENSORLINE__STORE__TABLE`)
//! 5. Command-line arguments
//!
//! Configuration options are loaded in order of precedence, with later sources
//! overriding earlier ones.
//!
//! # Environment Variables
//!
//! Queue credentials should be provided via environment variables:
//! - `SENSORLINE_QUEUE_USERNAME` - Broker username
//! - `SENSORLINE_QUEUE_PASSWORD` - Broker password
//!
//! `RABBITMQ_USER` / `RABBITMQ_PASS` are accepted as a fallback.
//!
//! # Sensor profiles
//!
//! Each `[sensors.<type>]` table sets the unit label and, optionally, the alert
//! threshold and its direction for one sensor type. Profiles are loaded once at
//! startup and never change afterwards.

use crate::series::{Direction, ThresholdRule};
use crate::storage::pool::PoolConfig;
use clap::Args;
use config::{Config, ConfigError};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");
const DEFAULT_CONFIG_PATH: &str = "/etc/sensorline/config.toml";

/// Bounds applied to the query lookback window, in hours.
pub const MIN_LOOKBACK_HOURS: u32 = 1;
pub const MAX_LOOKBACK_HOURS: u32 = 48;

/// Command-line arguments shared by every sensorline command.
///
/// Each option can also be given through the environment variable listed
/// next to it.
#[derive(Args, Debug, Default, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Message broker host
    #[arg(long, env = "SENSORLINE_QUEUE_HOST", global = true)]
    pub queue_host: Option<String>,

    /// Message broker port
    #[arg(long, env = "SENSORLINE_QUEUE_PORT", global = true)]
    pub queue_port: Option<u16>,

    /// Queue to consume readings from
    #[arg(long, env = "SENSORLINE_QUEUE_NAME", global = true)]
    pub queue_name: Option<String>,

    /// Number of concurrent ingestion workers
    #[arg(long, env = "SENSORLINE_WORKERS", global = true)]
    pub workers: Option<usize>,

    /// Broker username
    #[arg(long, env = "SENSORLINE_QUEUE_USERNAME", global = true)]
    pub queue_username: Option<String>,

    /// Broker password
    #[arg(long, env = "SENSORLINE_QUEUE_PASSWORD", global = true, hide_env_values = true)]
    pub queue_password: Option<String>,

    /// Store database path, or ":memory:"
    #[arg(long, env = "SENSORLINE_STORE_CONNECTION", global = true)]
    pub store_connection: Option<String>,

    /// Table holding the readings
    #[arg(long, env = "SENSORLINE_STORE_TABLE", global = true)]
    pub store_table: Option<String>,

    /// Maximum pooled store connections
    #[arg(long, env = "SENSORLINE_STORE_POOL_MAX", global = true)]
    pub pool_max: Option<u32>,

    /// Default query lookback window in hours
    #[arg(long, env = "SENSORLINE_LOOKBACK_HOURS", global = true)]
    pub lookback_hours: Option<u32>,
}

/// Complete service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Message broker configuration
    pub queue: QueueConfig,
    /// Store configuration
    pub store: StoreConfig,
    /// Query defaults
    pub query: QueryConfig,
    /// Per-sensor-type unit labels and alert rules
    #[serde(default)]
    pub sensors: SensorCatalog,
}

/// Message broker connection and consumer options.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Broker host name
    pub host: String,
    /// Broker port
    pub port: u16,
    /// AMQP virtual host
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Queue name
    pub queue: String,
    /// Concurrent worker count
    pub workers: usize,
    /// Pause after a requeue before the worker asks for the next message
    #[serde(default = "default_requeue_backoff_ms")]
    pub requeue_backoff_ms: u64,
    /// Authentication credentials (not serialized)
    #[serde(skip)]
    pub credentials: Option<Credentials>,
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_requeue_backoff_ms() -> u64 {
    1000
}

impl QueueConfig {
    pub fn requeue_backoff(&self) -> Duration {
        Duration::from_millis(self.requeue_backoff_ms)
    }

    /// AMQP URI for the broker. Falls back to the broker's default guest
    /// account when no credentials are configured.
    pub fn amqp_uri(&self) -> String {
        let (username, password) = match &self.credentials {
            Some(creds) => (creds.username.as_str(), creds.password.as_str()),
            None => ("guest", "guest"),
        };
        let vhost = if self.vhost == "/" {
            "%2f".to_string()
        } else {
            self.vhost.trim_start_matches('/').to_string()
        };
        format!("amqp://{}:{}@{}:{}/{}", username, password, self.host, self.port, vhost)
    }
}

/// Authentication credentials for the message broker.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    /// Username for authentication
    pub username: String,
    /// Password for authentication
    pub password: String,
}

/// Store location and pool limits.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Database file path or `:memory:`
    pub connection: String,
    /// Readings table name
    pub table: String,
    /// Maximum live connections
    pub pool_max: u32,
    /// Idle connections kept open
    #[serde(default)]
    pub pool_min: u32,
    /// Seconds a checkout waits before failing
    pub checkout_timeout_secs: u64,
    /// DuckDB worker threads (optional)
    #[serde(default)]
    pub threads: Option<i64>,
}

impl StoreConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.pool_max.max(1),
            min_idle: (self.pool_min > 0).then_some(self.pool_min.min(self.pool_max.max(1))),
            checkout_timeout: Duration::from_secs(self.checkout_timeout_secs),
        }
    }
}

/// Query defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    /// Default lookback window in hours
    pub lookback_hours: u32,
}

impl QueryConfig {
    /// The lookback window, clamped to 1–48 hours.
    pub fn lookback(&self) -> chrono::Duration {
        clamp_lookback(self.lookback_hours)
    }
}

pub fn clamp_lookback(hours: u32) -> chrono::Duration {
    chrono::Duration::hours(i64::from(hours.clamp(MIN_LOOKBACK_HOURS, MAX_LOOKBACK_HOURS)))
}

/// Unit label and alert rule for one sensor type.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SensorProfile {
    /// Unit label shown next to values
    #[serde(default)]
    pub unit: String,
    /// Alert threshold; no alerts are raised without one
    pub threshold: Option<f64>,
    /// Which side of the threshold alerts
    #[serde(default = "default_direction")]
    pub direction: Direction,
}

fn default_direction() -> Direction {
    Direction::Above
}

impl SensorProfile {
    pub fn rule(&self) -> Option<ThresholdRule> {
        self.threshold.map(|threshold| ThresholdRule {
            threshold,
            direction: self.direction,
        })
    }
}

/// Immutable table of sensor profiles keyed by sensor type.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct SensorCatalog(HashMap<String, SensorProfile>);

impl SensorCatalog {
    pub fn new(profiles: HashMap<String, SensorProfile>) -> Self {
        Self(profiles)
    }

    pub fn profile(&self, sensor_type: &str) -> Option<&SensorProfile> {
        self.0.get(sensor_type)
    }

    /// Unit label for a sensor type; empty when unknown.
    pub fn unit(&self, sensor_type: &str) -> &str {
        self.profile(sensor_type).map(|p| p.unit.as_str()).unwrap_or("")
    }

    pub fn rule(&self, sensor_type: &str) -> Option<ThresholdRule> {
        self.profile(sensor_type).and_then(SensorProfile::rule)
    }
}

impl FromIterator<(String, SensorProfile)> for SensorCatalog {
    fn from_iter<I: IntoIterator<Item = (String, SensorProfile)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Settings {
    /// Loads configuration from all available sources.
    pub fn new(cli: &CliArgs) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        // Load default configuration
        builder = builder.add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml));

        // Load system configuration if it exists
        if let Ok(metadata) = std::fs::metadata(DEFAULT_CONFIG_PATH) {
            if metadata.is_file() {
                builder = builder.add_source(config::File::from(PathBuf::from(DEFAULT_CONFIG_PATH)));
            }
        }

        // Load user configuration if specified
        if let Some(ref config_path) = cli.config {
            builder = builder.add_source(config::File::from(config_path.clone()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SENSORLINE")
                .separator("__")
                .try_parsing(true),
        );

        // Override with command line arguments
        if let Some(ref host) = cli.queue_host {
            builder = builder.set_override("queue.host", host.as_str())?;
        }
        if let Some(port) = cli.queue_port {
            builder = builder.set_override("queue.port", port)?;
        }
        if let Some(ref name) = cli.queue_name {
            builder = builder.set_override("queue.queue", name.as_str())?;
        }
        if let Some(workers) = cli.workers {
            builder = builder.set_override("queue.workers", workers as u64)?;
        }
        if let Some(ref connection) = cli.store_connection {
            builder = builder.set_override("store.connection", connection.as_str())?;
        }
        if let Some(ref table) = cli.store_table {
            builder = builder.set_override("store.table", table.as_str())?;
        }
        if let Some(pool_max) = cli.pool_max {
            builder = builder.set_override("store.pool_max", pool_max)?;
        }
        if let Some(hours) = cli.lookback_hours {
            builder = builder.set_override("query.lookback_hours", hours)?;
        }

        let mut settings: Settings = builder.build()?.try_deserialize()?;
        settings.queue.credentials = Self::load_queue_credentials(cli);
        settings.validate()?;

        Ok(settings)
    }

    /// The embedded defaults with no other sources applied.
    pub fn defaults() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.workers == 0 {
            return Err(ConfigError::Message("queue.workers must be at least 1".to_string()));
        }
        if self.store.pool_max == 0 {
            return Err(ConfigError::Message("store.pool_max must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Load broker credentials from all available sources.
    /// Priority order (highest to lowest):
    /// 1. Environment variables
    /// 2. Command line arguments
    /// 3. The legacy `RABBITMQ_USER` / `RABBITMQ_PASS` variables
    fn load_queue_credentials(cli: &CliArgs) -> Option<Credentials> {
        if let (Some(username), Some(password)) = (
            env::var("SENSORLINE_QUEUE_USERNAME").ok(),
            env::var("SENSORLINE_QUEUE_PASSWORD").ok(),
        ) {
            return Some(Credentials { username, password });
        }

        if let (Some(username), Some(password)) = (&cli.queue_username, &cli.queue_password) {
            return Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            });
        }

        if let (Some(username), Some(password)) = (env::var("RABBITMQ_USER").ok(), env::var("RABBITMQ_PASS").ok()) {
            return Some(Credentials { username, password });
        }

        None
    }
}
