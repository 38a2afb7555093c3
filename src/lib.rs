//! Sensorline: sensor reading ingestion and series reports
//!
//! This library drains sensor readings from a message queue into a DuckDB
//! store with at-least-once delivery, and derives moving averages,
//! distributions and threshold alerts from the stored series.
//!
//! # Example
//!
//! ```rust,no_run
//! use sensorline::{run_worker, Ingestor, MemoryQueue, SeriesQueryEngine};
//! use sensorline_core::storage::{duckdb::DuckDbStore, Store};
//! use sensorline_core::Settings;
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::defaults()?;
//!
//!     // Create and initialize the store
//!     let store: Arc<dyn Store> = Arc::new(DuckDbStore::new_in_memory()?);
//!     store.initialize().await?;
//!
//!     // Feed a local queue
//!     let queue = MemoryQueue::new();
//!     queue.publish(r#"{"sensor_type": "temperature", "sensor_id": 1, "value": 21.5}"#)?;
//!     queue.close();
//!
//!     // Drain it with one worker
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     let ingestor = Ingestor::new(store.clone());
//!     let stats = run_worker(0, ingestor, queue.consumer(), shutdown_rx).await?;
//!     println!("Stored {} readings", stats.stored);
//!
//!     // Query the last six hours
//!     let engine = SeriesQueryEngine::new(store.clone(), settings.sensors);
//!     let filter = engine.lookback_filter("temperature", settings.query.lookback());
//!     let view = engine.moving_average(&filter).await?;
//!     println!("{:?}", view);
//!
//!     store.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod amqp;
pub mod ingestor;
pub mod query;
pub mod queue;
pub mod tests;

pub use amqp::{AmqpBroker, AmqpQueue};
pub use ingestor::{run_worker, Ingestor, MessageEvent, MessageState, ReceiptClock, Settlement, WorkerStats};
pub use query::{QueryError, SeriesQueryEngine};
pub use queue::{Delivery, MemoryConsumer, MemoryQueue, MessageQueue, QueueError};
