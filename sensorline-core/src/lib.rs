/*!
# Sensorline core: durable sensor readings and on-demand series views

Sensorline core holds the parts of the sensor pipeline that do not depend on a
message broker: the reading model, a pooled DuckDB store, the layered
configuration, and the pure series computations behind every report.

## Key Features

### Durable storage
- Append-only `sensor_data` table with store-assigned ids and timestamps
- Bounded bb8 connection pool with a checkout timeout
- Failures classified as retryable (`Unavailable`) or permanent (`Invalid`)

### Series views
- Moving average over the last five readings of each sensor
- Value distribution in fixed-width bins anchored at the minimum
- Threshold exceedance per sensor type, above or below the bound
- Raw value histogram

## Usage

```rust,no_run
use sensorline_core::storage::{duckdb::DuckDbStore, SeriesFilter, Store};
use sensorline_core::reading::NewReading;
use sensorline_core::series::{moving_average, MOVING_AVERAGE_WINDOW};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = DuckDbStore::new_in_memory()?;
    store.initialize().await?;

    for value in [21.0, 21.5, 22.0, 22.5, 23.0] {
        store.insert(NewReading::new("temperature", value).with_sensor_id(1)).await?;
    }

    let since = chrono::Utc::now() - chrono::Duration::hours(6);
    let readings = store.query_range(&SeriesFilter::new("temperature", since)).await?;
    for series in moving_average(&readings, MOVING_AVERAGE_WINDOW) {
        println!("{:?}", series);
    }

    store.shutdown().await;
    Ok(())
}
```

## Configuration

Settings are layered from the embedded defaults, `/etc/sensorline/config.toml`,
an optional `--config` file, `SENSORLINE__SECTION__KEY` environment variables
and command-line flags. See the [`config`] module.
*/

pub mod config;
pub mod reading;
pub mod series;
pub mod storage;

pub use config::{CliArgs, SensorCatalog, SensorProfile, Settings};
pub use reading::{NewReading, Reading, RowId, SensorKey};
pub use series::{DerivedView, Direction, ThresholdRule, ViewKind, ViewRows};
pub use storage::{SeriesFilter, Store, StoreError};
