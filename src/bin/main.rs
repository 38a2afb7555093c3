//! Sensorline binary.
//!
//! # Commands
//!
//! - `sensorline ingest` drains the configured RabbitMQ queue into the store with
//!   one worker per `queue.workers` until Ctrl-C. With `--stdin`, readings are read
//!   as JSON lines from standard input instead and the command exits at end of
//!   input.
//! - `sensorline report <SENSOR_TYPE>` prints the known sensors and the moving
//!   average, distribution, threshold and histogram views of one sensor type over
//!   the lookback window.
//!
//! # Configuration
//!
//! Configuration can be provided through multiple sources, in order of precedence:
//!
//! 1. Command-line arguments (highest precedence)
//! 2. Environment variables (`SENSORLINE__SECTION__KEY`)
//! 3. User-specified configuration file (via `--config`)
//! 4. System-wide configuration (`/etc/sensorline/config.toml`)
//! 5. Default configuration (embedded in binary)
//!
//! A `.env` file in the working directory is loaded first. Log output follows
//! `RUST_LOG` and defaults to `info`.
//!
//! # Examples
//!
//! ```bash
//! # Consume from a local broker with eight workers
//! SENSORLINE_QUEUE_USERNAME=ingest SENSORLINE_QUEUE_PASSWORD=secret \
//!   sensorline ingest --workers 8
//!
//! # Replay captured messages without a broker
//! sensorline ingest --stdin --store-connection readings.db < capture.jsonl
//!
//! # Smoke sensors 1 and 2 over the last 12 hours
//! sensorline report smoke --sensor-id 1 --sensor-id 2 --lookback-hours 12
//! ```

use clap::{Parser, Subcommand};
use futures::future::join_all;
use sensorline::{run_worker, AmqpBroker, Ingestor, MemoryQueue, MessageQueue, QueryError, SeriesQueryEngine, WorkerStats};
use sensorline_core::config::{CliArgs, Settings};
use sensorline_core::series::DerivedView;
use sensorline_core::storage::{duckdb::DuckDbStore, Store};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub settings: CliArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Consume readings and store them
    Ingest {
        /// Read JSON messages line by line from standard input
        #[arg(long)]
        stdin: bool,
    },
    /// Print series views for one sensor type
    Report {
        /// Sensor type to report on
        sensor_type: String,

        /// Restrict the report to these sensor ids
        #[arg(long = "sensor-id")]
        sensor_ids: Vec<i16>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let settings = Settings::new(&cli.settings)?;

    let store = Arc::new(DuckDbStore::from_config(&settings.store)?);
    store.initialize().await?;
    info!(connection = %settings.store.connection, table = %store.table(), "Store ready");

    let result = match cli.command {
        Commands::Ingest { stdin } => ingest(&settings, store.clone(), stdin).await,
        Commands::Report { sensor_type, sensor_ids } => report(&settings, store.clone(), &sensor_type, sensor_ids).await,
    };

    store.shutdown().await;
    result
}

async fn ingest(settings: &Settings, store: Arc<DuckDbStore>, stdin: bool) -> Result<(), Box<dyn std::error::Error>> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signals = tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested, finishing in-flight messages");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    let ingestor = Ingestor::new(store).with_requeue_backoff(settings.queue.requeue_backoff());
    let workers = settings.queue.workers;

    let stats = if stdin {
        let queue = MemoryQueue::new();
        let feeder = tokio::spawn(feed_from_stdin(queue.clone()));
        let consumers = (0..workers).map(|_| queue.consumer()).collect();
        let stats = run_workers(consumers, ingestor, shutdown_rx).await;
        feeder.abort();
        stats
    } else {
        let broker = AmqpBroker::connect(&settings.queue).await?;
        let mut consumers = Vec::with_capacity(workers);
        for worker in 0..workers {
            consumers.push(broker.consumer(worker).await?);
        }
        let stats = run_workers(consumers, ingestor, shutdown_rx).await;
        if let Err(e) = broker.close().await {
            warn!(error = %e, "Broker connection did not close cleanly");
        }
        stats
    };
    signals.abort();

    let stats = stats?;
    info!(
        received = stats.received,
        stored = stats.stored,
        dropped_malformed = stats.dropped_malformed,
        dropped_invalid = stats.dropped_invalid,
        requeued = stats.requeued,
        "Ingestion finished"
    );
    Ok(())
}

/// Runs one worker per consumer and sums their counters. A worker that fails
/// does not stop the others; the first failure is reported once all have ended.
async fn run_workers<Q>(
    consumers: Vec<Q>,
    ingestor: Ingestor,
    shutdown: watch::Receiver<bool>,
) -> Result<WorkerStats, Box<dyn std::error::Error>>
where
    Q: MessageQueue + 'static,
{
    info!(workers = consumers.len(), "Starting workers");
    let handles = consumers
        .into_iter()
        .enumerate()
        .map(|(worker, queue)| tokio::spawn(run_worker(worker, ingestor.clone(), queue, shutdown.clone())));

    let mut total = WorkerStats::default();
    let mut failure: Option<Box<dyn std::error::Error>> = None;
    for (worker, joined) in join_all(handles).await.into_iter().enumerate() {
        match joined {
            Ok(Ok(stats)) => total += stats,
            Ok(Err(e)) => {
                error!(worker, error = %e, "Worker failed");
                failure.get_or_insert_with(|| Box::new(e));
            }
            Err(e) => {
                error!(worker, error = %e, "Worker task aborted");
                failure.get_or_insert_with(|| Box::new(e));
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(total),
    }
}

async fn feed_from_stdin(queue: MemoryQueue) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                if queue.publish(line).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to read standard input");
                break;
            }
        }
    }
    queue.close();
}

async fn report(
    settings: &Settings,
    store: Arc<DuckDbStore>,
    sensor_type: &str,
    sensor_ids: Vec<i16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = SeriesQueryEngine::new(store, settings.sensors.clone());
    let lookback = settings.query.lookback();

    let types = engine.list_sensor_types().await.map_err(explain)?;
    if types.is_empty() {
        println!("No data: no sensor has reported yet.");
        return Ok(());
    }
    println!("Sensor types:");
    for known in &types {
        let ids = engine.list_sensor_ids(known).await.map_err(explain)?;
        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let unit = engine.unit(known);
        println!(
            "  {}{}: ids [{}]",
            known,
            if unit.is_empty() { String::new() } else { format!(" ({})", unit) },
            ids.join(", ")
        );
    }

    let mut filter = engine.lookback_filter(sensor_type, lookback);
    if !sensor_ids.is_empty() {
        filter = filter.with_sensor_ids(sensor_ids);
    }
    let hours = lookback.num_hours();

    match engine.rule(sensor_type) {
        Some(rule) => println!(
            "\nAlert rule for {}: {} {} {}",
            sensor_type,
            rule.direction,
            rule.threshold,
            engine.unit(sensor_type)
        ),
        None => println!("\nNo alert rule configured for {}", sensor_type),
    }

    let views = [
        engine.moving_average(&filter).await,
        engine.distribution(&filter).await,
        engine.threshold_exceedance(&filter).await,
        engine.value_histogram(&filter).await,
    ];
    for view in views {
        print_view(&view.map_err(explain)?, hours)?;
    }
    Ok(())
}

fn print_view(view: &DerivedView, hours: i64) -> Result<(), Box<dyn std::error::Error>> {
    println!("\n{} of {} (last {} hours)", view.kind(), view.filter.sensor_type, hours);
    if view.is_empty() {
        println!("No data");
        return Ok(());
    }
    let batch = view.to_record_batch()?;
    println!("{}", arrow::util::pretty::pretty_format_batches(&[batch])?);
    Ok(())
}

fn explain(err: QueryError) -> QueryError {
    if err.is_retryable() {
        warn!(error = %err, "Store unavailable, the report can be retried");
    }
    err
}
