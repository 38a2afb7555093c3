//! The reading data model and its columnar form.
//!
//! A [`Reading`] is one timestamped measurement as it exists in the store. The
//! insert side uses [`NewReading`], whose timestamp may be absent (the store
//! fills it in) and whose sensor id has not been range-checked yet.

use arrow_array::{ArrayRef, Float64Array, Int16Array, Int64Array, RecordBatch, StringArray, TimestampMicrosecondArray};
use arrow_schema::{ArrowError, DataType, Field, Schema, TimeUnit};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Store-assigned surrogate key. Monotonically increasing.
pub type RowId = i64;

/// A single stored sensor measurement. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Store-assigned identifier
    pub id: RowId,
    /// Time the reading was received by an ingestor
    pub timestamp: DateTime<Utc>,
    /// Physical sensor instance, absent for single-sensor deployments
    pub sensor_id: Option<i16>,
    /// Open-set sensor tag such as `temperature` or `smoke`
    pub sensor_type: String,
    /// Measurement in the sensor's native unit
    pub value: f64,
}

impl Reading {
    /// The logical series this reading belongs to.
    pub fn key(&self) -> SensorKey {
        SensorKey {
            sensor_type: self.sensor_type.clone(),
            sensor_id: self.sensor_id,
        }
    }
}

/// A reading that has not been persisted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub timestamp: Option<DateTime<Utc>>,
    /// Unchecked; the store rejects values outside the SMALLINT range.
    pub sensor_id: Option<i64>,
    pub sensor_type: String,
    pub value: f64,
}

impl NewReading {
    pub fn new(sensor_type: impl Into<String>, value: f64) -> Self {
        Self {
            timestamp: None,
            sensor_id: None,
            sensor_type: sensor_type.into(),
            value,
        }
    }

    pub fn with_sensor_id(mut self, sensor_id: i64) -> Self {
        self.sensor_id = Some(sensor_id);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Identifies a logical series: a sensor type plus an optional instance id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SensorKey {
    pub sensor_type: String,
    pub sensor_id: Option<i16>,
}

impl Display for SensorKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.sensor_id {
            Some(id) => write!(f, "{}#{}", self.sensor_type, id),
            None => write!(f, "{}", self.sensor_type),
        }
    }
}

/// Gets the schema for readings in Arrow format.
pub fn get_readings_schema() -> Schema {
    Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
        Field::new("sensor_id", DataType::Int16, true),
        Field::new("sensor_type", DataType::Utf8, false),
        Field::new("value", DataType::Float64, false),
    ])
}

/// Creates a RecordBatch from a slice of readings.
pub fn create_record_batch(readings: &[Reading]) -> Result<RecordBatch, ArrowError> {
    let ids = Int64Array::from_iter_values(readings.iter().map(|r| r.id));
    let timestamps = TimestampMicrosecondArray::from_iter_values(
        readings.iter().map(|r| r.timestamp.timestamp_micros()),
    )
    .with_timezone("UTC");
    let sensor_ids: Int16Array = readings.iter().map(|r| r.sensor_id).collect();
    let sensor_types = StringArray::from_iter_values(readings.iter().map(|r| r.sensor_type.as_str()));
    let values = Float64Array::from_iter_values(readings.iter().map(|r| r.value));

    let arrays: Vec<ArrayRef> = vec![
        Arc::new(ids),
        Arc::new(timestamps),
        Arc::new(sensor_ids),
        Arc::new(sensor_types),
        Arc::new(values),
    ];

    RecordBatch::try_new(Arc::new(get_readings_schema()), arrays)
}
