//! Series queries for dashboards and reports.
//!
//! The engine reads one slice of the store per call and derives a view from it.
//! It keeps no state between calls; the sensor catalog is fixed at construction.

use chrono::{Duration, Utc};
use sensorline_core::config::SensorCatalog;
use sensorline_core::reading::Reading;
use sensorline_core::series::{self, DerivedView, ThresholdRule, ViewRows, BIN_WIDTH, MOVING_AVERAGE_WINDOW};
use sensorline_core::storage::{SeriesFilter, Store, StoreError};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueryError {
    /// True when the same query may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueryError::Store(e) => e.is_retryable(),
        }
    }
}

pub struct SeriesQueryEngine {
    store: Arc<dyn Store>,
    sensors: SensorCatalog,
}

impl SeriesQueryEngine {
    pub fn new(store: Arc<dyn Store>, sensors: SensorCatalog) -> Self {
        Self { store, sensors }
    }

    pub fn sensors(&self) -> &SensorCatalog {
        &self.sensors
    }

    /// Every sensor type that has ever reported.
    pub async fn list_sensor_types(&self) -> Result<BTreeSet<String>, QueryError> {
        let sensors = self.store.distinct_sensors().await?;
        Ok(sensors.into_iter().map(|key| key.sensor_type).collect())
    }

    /// Sensor ids seen for one type. Readings without an id are not listed.
    pub async fn list_sensor_ids(&self, sensor_type: &str) -> Result<BTreeSet<i16>, QueryError> {
        let sensors = self.store.distinct_sensors().await?;
        Ok(sensors
            .into_iter()
            .filter(|key| key.sensor_type == sensor_type)
            .filter_map(|key| key.sensor_id)
            .collect())
    }

    /// Filter covering the last `lookback` of one sensor type.
    pub fn lookback_filter(&self, sensor_type: &str, lookback: Duration) -> SeriesFilter {
        SeriesFilter::new(sensor_type, Utc::now() - lookback)
    }

    /// Raw readings in timestamp order.
    pub async fn query_series(&self, filter: &SeriesFilter) -> Result<Vec<Reading>, QueryError> {
        Ok(self.store.query_range(filter).await?)
    }

    pub async fn moving_average(&self, filter: &SeriesFilter) -> Result<DerivedView, QueryError> {
        let readings = self.query_series(filter).await?;
        Ok(view(
            filter,
            ViewRows::MovingAverage(series::moving_average(&readings, MOVING_AVERAGE_WINDOW)),
        ))
    }

    pub async fn distribution(&self, filter: &SeriesFilter) -> Result<DerivedView, QueryError> {
        let readings = self.query_series(filter).await?;
        Ok(view(
            filter,
            ViewRows::Distribution(series::binned_distribution(&readings, BIN_WIDTH)),
        ))
    }

    /// Readings outside the configured bound for the filter's sensor type.
    pub async fn threshold_exceedance(&self, filter: &SeriesFilter) -> Result<DerivedView, QueryError> {
        let rule = self.rule(&filter.sensor_type);
        // Without a rule nothing can be flagged, so the store is not consulted.
        let rows = match rule {
            Some(rule) => {
                let readings = self.query_series(filter).await?;
                series::exceedances(&readings, Some(&rule))
            }
            None => Vec::new(),
        };
        Ok(view(filter, ViewRows::Threshold(rows)))
    }

    pub async fn value_histogram(&self, filter: &SeriesFilter) -> Result<DerivedView, QueryError> {
        let readings = self.query_series(filter).await?;
        Ok(view(filter, ViewRows::Histogram(series::value_histogram(&readings))))
    }

    pub fn rule(&self, sensor_type: &str) -> Option<ThresholdRule> {
        self.sensors.rule(sensor_type)
    }

    pub fn unit(&self, sensor_type: &str) -> &str {
        self.sensors.unit(sensor_type)
    }
}

fn view(filter: &SeriesFilter, rows: ViewRows) -> DerivedView {
    DerivedView {
        filter: filter.clone(),
        rows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorline_core::config::SensorProfile;
    use sensorline_core::series::Direction;
    use sensorline_core::storage::duckdb::DuckDbStore;
    use sensorline_core::NewReading;

    fn catalog() -> SensorCatalog {
        [(
            "smoke".to_string(),
            SensorProfile {
                unit: "%".to_string(),
                threshold: Some(5.0),
                direction: Direction::Below,
            },
        )]
        .into_iter()
        .collect()
    }

    async fn engine_with(values: &[(&str, Option<i64>, f64)]) -> SeriesQueryEngine {
        let store = DuckDbStore::new_in_memory().unwrap();
        store.initialize().await.unwrap();
        let base = Utc::now() - Duration::minutes(30);
        for (i, (sensor_type, sensor_id, value)) in values.iter().enumerate() {
            let mut reading = NewReading::new(*sensor_type, *value).at(base + Duration::seconds(i as i64));
            reading.sensor_id = *sensor_id;
            store.insert(reading).await.unwrap();
        }
        SeriesQueryEngine::new(Arc::new(store), catalog())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sensor_listing() {
        let engine = engine_with(&[("gas", Some(2), 1.0), ("gas", Some(1), 1.0), ("smoke", None, 3.0)]).await;
        let types = engine.list_sensor_types().await.unwrap();
        assert_eq!(types.into_iter().collect::<Vec<_>>(), vec!["gas", "smoke"]);
        assert_eq!(
            engine.list_sensor_ids("gas").await.unwrap().into_iter().collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(engine.list_sensor_ids("smoke").await.unwrap().is_empty());
        assert!(engine.list_sensor_ids("humidity").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_threshold_uses_catalog_direction() {
        let engine = engine_with(&[
            ("smoke", None, 6.0),
            ("smoke", None, 4.0),
            ("smoke", None, 3.0),
            ("smoke", None, 7.0),
        ])
        .await;
        let filter = engine.lookback_filter("smoke", Duration::hours(6));
        let view = engine.threshold_exceedance(&filter).await.unwrap();
        match view.rows {
            ViewRows::Threshold(rows) => {
                assert_eq!(rows.iter().map(|r| r.value).collect::<Vec<_>>(), vec![4.0, 3.0]);
            }
            other => panic!("unexpected rows {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unconfigured_type_flags_nothing() {
        let engine = engine_with(&[("gas", Some(1), 1000.0)]).await;
        let filter = engine.lookback_filter("gas", Duration::hours(6));
        let view = engine.threshold_exceedance(&filter).await.unwrap();
        assert!(view.is_empty());
        assert_eq!(engine.unit("gas"), "");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_views_over_lookback() {
        let engine = engine_with(&[
            ("temperature", Some(1), 1.0),
            ("temperature", Some(1), 2.0),
            ("temperature", Some(1), 3.0),
            ("temperature", Some(1), 4.0),
            ("temperature", Some(1), 5.0),
            ("temperature", Some(1), 6.0),
        ])
        .await;
        let filter = engine.lookback_filter("temperature", Duration::hours(1));

        let averages = engine.moving_average(&filter).await.unwrap();
        match &averages.rows {
            ViewRows::MovingAverage(series) => {
                assert_eq!(series.len(), 1);
                let got: Vec<_> = series[0].points.iter().map(|p| p.average).collect();
                assert_eq!(got, vec![None, None, None, None, Some(3.0), Some(4.0)]);
            }
            other => panic!("unexpected rows {:?}", other),
        }

        let distribution = engine.distribution(&filter).await.unwrap();
        assert!(!distribution.is_empty());
        assert_eq!(distribution.filter, filter);

        let narrow = engine.lookback_filter("temperature", Duration::minutes(1));
        assert!(engine.value_histogram(&narrow).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unavailable_store_is_retryable() {
        let store = DuckDbStore::new_in_memory().unwrap();
        store.initialize().await.unwrap();
        store.shutdown().await;
        let engine = SeriesQueryEngine::new(Arc::new(store), catalog());

        let err = engine.list_sensor_types().await.unwrap_err();
        assert!(err.is_retryable());
        let filter = engine.lookback_filter("smoke", Duration::hours(6));
        assert!(engine.threshold_exceedance(&filter).await.unwrap_err().is_retryable());
    }
}
