//! Read-side backend over an embedded DataFusion context.
//!
//! `AnalyticsBackend` serves metric reads (volume samples, staleness, record
//! sampling) by running SQL against tables registered in a
//! [`SessionContext`] and converting the resulting Arrow batches into the
//! crate's row types. It is read-only: the monitoring-store half of the
//! operation set answers with [`BackendError::Unsupported`], the same way a
//! query-only transport declines writes.

use std::collections::HashMap;

use arrow::array::{
    Array, BooleanArray, Float32Array, Float64Array, Int32Array, Int64Array, StringArray,
    TimestampMicrosecondArray, TimestampMillisecondArray, TimestampNanosecondArray,
    TimestampSecondArray,
};
use arrow::datatypes::{DataType, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datafusion::prelude::*;
use tracing::{debug, instrument};

use crate::alert::{Alert, AlertKind, AlertWriteOutcome};
use crate::baseline::MetricBaseline;
use crate::contract::ContractViolation;

use super::{
    Backend, BackendConnection, BackendError, BackendResult, FieldValue, MetricDescriptor,
    MetricKind, MetricSample, SampleBucket, SampleRecord, TimeWindow,
};

/// Read-side backend over registered DataFusion tables.
///
/// # Example
///
/// ```rust,ignore
/// use datafusion::prelude::*;
/// use vigil_guard::backend::AnalyticsBackend;
///
/// let ctx = SessionContext::new();
/// ctx.register_parquet("orders_history", "data/orders.parquet", Default::default()).await?;
///
/// let backend = AnalyticsBackend::new("cdc", ctx).with_timestamp_column("created_at");
/// ```
pub struct AnalyticsBackend {
    name: String,
    ctx: SessionContext,
    timestamp_column: String,
}

impl AnalyticsBackend {
    /// Creates a backend over the given session context.
    pub fn new(name: impl Into<String>, ctx: SessionContext) -> Self {
        Self {
            name: name.into(),
            ctx,
            timestamp_column: "created_at".to_string(),
        }
    }

    /// Sets the timestamp column used for windowing and freshness queries.
    pub fn with_timestamp_column(mut self, column: impl Into<String>) -> Self {
        self.timestamp_column = column.into();
        self
    }
}

#[async_trait]
impl Backend for AnalyticsBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> BackendResult<Box<dyn BackendConnection>> {
        // SessionContext is cheaply cloneable (shared state behind Arcs), so
        // a "connection" is a handle onto the same registered tables.
        Ok(Box::new(AnalyticsConnection {
            name: self.name.clone(),
            ctx: self.ctx.clone(),
            timestamp_column: self.timestamp_column.clone(),
        }))
    }
}

struct AnalyticsConnection {
    name: String,
    ctx: SessionContext,
    timestamp_column: String,
}

impl AnalyticsConnection {
    async fn collect(&self, sql: &str) -> BackendResult<Vec<RecordBatch>> {
        debug!(backend = %self.name, sql, "executing analytics query");
        let df = self.ctx.sql(sql).await?;
        Ok(df.collect().await?)
    }

    fn unsupported(&self, operation: &str) -> BackendError {
        BackendError::unsupported(self.name.as_str(), operation)
    }

    /// Non-null timestamps from the given column across all batches, in
    /// query order.
    fn timestamps(batches: &[RecordBatch], column: usize) -> BackendResult<Vec<DateTime<Utc>>> {
        let mut out = Vec::new();
        for batch in batches {
            let array = batch.column(column);
            for row in 0..batch.num_rows() {
                if let FieldValue::Timestamp(ts) = field_value_at(array.as_ref(), row)? {
                    out.push(ts);
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl BackendConnection for AnalyticsConnection {
    async fn ping(&self) -> BackendResult<()> {
        self.collect("SELECT 1").await.map(|_| ())
    }

    #[instrument(skip(self, descriptor, window), fields(metric = %descriptor.name))]
    async fn metric_samples(
        &self,
        descriptor: &MetricDescriptor,
        window: &TimeWindow,
    ) -> BackendResult<Vec<MetricSample>> {
        let source = validate_identifier(&descriptor.source)?;
        let ts = validate_identifier(&self.timestamp_column)?;

        match descriptor.kind {
            MetricKind::Volume => {
                let unit = match descriptor.bucket {
                    SampleBucket::Hourly => "hour",
                    SampleBucket::Daily => "day",
                };
                let sql = format!(
                    "SELECT CAST(date_trunc('{unit}', {ts}) AS TIMESTAMP) AS bucket_start, \
                     COUNT(*) AS record_count \
                     FROM {source} \
                     WHERE {ts} >= to_timestamp('{start}') AND {ts} < to_timestamp('{end}') \
                     GROUP BY date_trunc('{unit}', {ts}) \
                     ORDER BY bucket_start",
                    start = window.start.to_rfc3339(),
                    end = window.end.to_rfc3339(),
                );
                let batches = self.collect(&sql).await?;

                let mut samples = Vec::new();
                for batch in &batches {
                    let buckets = batch
                        .column(0)
                        .as_any()
                        .downcast_ref::<TimestampNanosecondArray>()
                        .ok_or_else(|| {
                            BackendError::Query("bucket_start is not a timestamp".to_string())
                        })?;
                    let counts = batch
                        .column(1)
                        .as_any()
                        .downcast_ref::<Int64Array>()
                        .ok_or_else(|| {
                            BackendError::Query("record_count is not an integer".to_string())
                        })?;
                    for row in 0..batch.num_rows() {
                        samples.push(MetricSample {
                            bucket_start: DateTime::from_timestamp_nanos(buckets.value(row)),
                            value: counts.value(row) as f64,
                        });
                    }
                }
                Ok(samples)
            }
            MetricKind::Freshness => {
                let sql = format!(
                    "SELECT CAST({ts} AS TIMESTAMP) AS observed_at \
                     FROM {source} \
                     WHERE {ts} >= to_timestamp('{start}') AND {ts} < to_timestamp('{end}') \
                     ORDER BY observed_at",
                    start = window.start.to_rfc3339(),
                    end = window.end.to_rfc3339(),
                );
                let batches = self.collect(&sql).await?;
                let timestamps = Self::timestamps(&batches, 0)?;
                // Inter-arrival gaps in minutes, stamped on the later record.
                Ok(timestamps
                    .windows(2)
                    .map(|pair| MetricSample {
                        bucket_start: pair[1],
                        value: (pair[1] - pair[0]).num_seconds() as f64 / 60.0,
                    })
                    .collect())
            }
        }
    }

    async fn current_volume(&self, source: &str, since: DateTime<Utc>) -> BackendResult<u64> {
        let source = validate_identifier(source)?;
        let ts = validate_identifier(&self.timestamp_column)?;
        let sql = format!(
            "SELECT COUNT(*) AS record_count FROM {source} \
             WHERE {ts} >= to_timestamp('{since}')",
            since = since.to_rfc3339(),
        );
        let batches = self.collect(&sql).await?;

        let batch = batches
            .first()
            .ok_or_else(|| BackendError::Query("count query returned no batches".to_string()))?;
        let counts = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .ok_or_else(|| BackendError::Query("record_count is not an integer".to_string()))?;
        Ok(counts.value(0) as u64)
    }

    async fn latest_record_at(&self, source: &str) -> BackendResult<Option<DateTime<Utc>>> {
        let source = validate_identifier(source)?;
        let ts = validate_identifier(&self.timestamp_column)?;
        let sql = format!("SELECT CAST(MAX({ts}) AS TIMESTAMP) AS latest FROM {source}");
        let batches = self.collect(&sql).await?;
        Ok(Self::timestamps(&batches, 0)?.into_iter().next())
    }

    async fn sample_records(&self, source: &str, limit: usize) -> BackendResult<Vec<SampleRecord>> {
        let source = validate_identifier(source)?;
        let ts = validate_identifier(&self.timestamp_column)?;
        let sql = format!("SELECT * FROM {source} ORDER BY {ts} DESC LIMIT {limit}");
        let batches = self.collect(&sql).await?;

        let mut records = Vec::new();
        let mut row_index = 0usize;
        for batch in &batches {
            let schema = batch.schema();
            for row in 0..batch.num_rows() {
                let mut fields = HashMap::with_capacity(batch.num_columns());
                for (col, field) in schema.fields().iter().enumerate() {
                    let value = field_value_at(batch.column(col).as_ref(), row)?;
                    fields.insert(field.name().clone(), value);
                }
                records.push(SampleRecord {
                    reference: format!("{source}#{row_index}"),
                    fields,
                });
                row_index += 1;
            }
        }
        Ok(records)
    }

    async fn fetch_baseline(&self, _metric_name: &str) -> BackendResult<Option<MetricBaseline>> {
        Err(self.unsupported("fetch_baseline"))
    }

    async fn upsert_baseline(&self, _baseline: &MetricBaseline) -> BackendResult<()> {
        Err(self.unsupported("upsert_baseline"))
    }

    async fn upsert_alert(&self, _alert: &Alert) -> BackendResult<AlertWriteOutcome> {
        Err(self.unsupported("upsert_alert"))
    }

    async fn insert_violations(&self, _violations: &[ContractViolation]) -> BackendResult<()> {
        Err(self.unsupported("insert_violations"))
    }

    async fn recent_alert_counts(
        &self,
        _since: DateTime<Utc>,
    ) -> BackendResult<HashMap<AlertKind, u64>> {
        Err(self.unsupported("recent_alert_counts"))
    }
}

/// Rejects identifiers that could smuggle SQL into a formatted query.
fn validate_identifier(identifier: &str) -> BackendResult<&str> {
    let valid = !identifier.is_empty()
        && identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(identifier)
    } else {
        Err(BackendError::Query(format!(
            "invalid identifier '{identifier}'"
        )))
    }
}

/// Converts one Arrow cell into a [`FieldValue`].
fn field_value_at(array: &dyn Array, row: usize) -> BackendResult<FieldValue> {
    if array.is_null(row) {
        return Ok(FieldValue::Null);
    }

    let value = match array.data_type() {
        DataType::Utf8 => {
            let array = array
                .as_any()
                .downcast_ref::<StringArray>()
                .expect("checked data type");
            FieldValue::Text(array.value(row).to_string())
        }
        DataType::Int32 => {
            let array = array
                .as_any()
                .downcast_ref::<Int32Array>()
                .expect("checked data type");
            FieldValue::Integer(i64::from(array.value(row)))
        }
        DataType::Int64 => {
            let array = array
                .as_any()
                .downcast_ref::<Int64Array>()
                .expect("checked data type");
            FieldValue::Integer(array.value(row))
        }
        DataType::Float32 => {
            let array = array
                .as_any()
                .downcast_ref::<Float32Array>()
                .expect("checked data type");
            FieldValue::Float(f64::from(array.value(row)))
        }
        DataType::Float64 => {
            let array = array
                .as_any()
                .downcast_ref::<Float64Array>()
                .expect("checked data type");
            FieldValue::Float(array.value(row))
        }
        DataType::Boolean => {
            let array = array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .expect("checked data type");
            FieldValue::Boolean(array.value(row))
        }
        DataType::Timestamp(unit, _tz) => {
            let ts = match unit {
                TimeUnit::Second => {
                    let array = array
                        .as_any()
                        .downcast_ref::<TimestampSecondArray>()
                        .expect("checked data type");
                    DateTime::from_timestamp(array.value(row), 0)
                }
                TimeUnit::Millisecond => {
                    let array = array
                        .as_any()
                        .downcast_ref::<TimestampMillisecondArray>()
                        .expect("checked data type");
                    DateTime::from_timestamp_millis(array.value(row))
                }
                TimeUnit::Microsecond => {
                    let array = array
                        .as_any()
                        .downcast_ref::<TimestampMicrosecondArray>()
                        .expect("checked data type");
                    DateTime::from_timestamp_micros(array.value(row))
                }
                TimeUnit::Nanosecond => {
                    let array = array
                        .as_any()
                        .downcast_ref::<TimestampNanosecondArray>()
                        .expect("checked data type");
                    Some(DateTime::from_timestamp_nanos(array.value(row)))
                }
            };
            let ts = ts.ok_or_else(|| {
                BackendError::Query("timestamp value out of representable range".to_string())
            })?;
            FieldValue::Timestamp(ts)
        }
        other => {
            // Unrecognized types degrade to their textual rendering so a
            // contract can still pattern-check them.
            let rendered = arrow::util::display::array_value_to_string(array, row)?;
            debug!(data_type = %other, "rendering unsupported arrow type as text");
            FieldValue::Text(rendered)
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{Field, Schema};
    use chrono::TimeZone;
    use datafusion::datasource::MemTable;
    use std::sync::Arc;

    /// Registers an `orders` table with one row per entry of `rows`:
    /// (created_at millis, order_key, total_amount).
    async fn analytics_with_orders(rows: &[(i64, &str, f64)]) -> AnalyticsBackend {
        let schema = Arc::new(Schema::new(vec![
            Field::new(
                "created_at",
                DataType::Timestamp(TimeUnit::Millisecond, None),
                false,
            ),
            Field::new("order_key", DataType::Utf8, false),
            Field::new("total_amount", DataType::Float64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(TimestampMillisecondArray::from(
                    rows.iter().map(|(ts, _, _)| *ts).collect::<Vec<_>>(),
                )),
                Arc::new(StringArray::from(
                    rows.iter().map(|(_, key, _)| *key).collect::<Vec<_>>(),
                )),
                Arc::new(Float64Array::from(
                    rows.iter().map(|(_, _, amount)| *amount).collect::<Vec<_>>(),
                )),
            ],
        )
        .unwrap();
        let table = MemTable::try_new(schema, vec![vec![batch]]).unwrap();

        let ctx = SessionContext::new();
        ctx.register_table("orders", Arc::new(table)).unwrap();
        AnalyticsBackend::new("analytics", ctx)
    }

    fn millis(ts: DateTime<Utc>) -> i64 {
        ts.timestamp_millis()
    }

    #[tokio::test]
    async fn ping_succeeds() {
        let backend = analytics_with_orders(&[]).await;
        let conn = backend.connect().await.unwrap();
        conn.ping().await.unwrap();
    }

    #[tokio::test]
    async fn volume_samples_aggregate_per_hour() {
        let base = Utc.with_ymd_and_hms(2024, 3, 5, 8, 0, 0).unwrap();
        let backend = analytics_with_orders(&[
            (millis(base + chrono::Duration::minutes(5)), "ORD-1", 10.0),
            (millis(base + chrono::Duration::minutes(25)), "ORD-2", 11.0),
            (millis(base + chrono::Duration::minutes(65)), "ORD-3", 12.0),
        ])
        .await;
        let conn = backend.connect().await.unwrap();

        let metric = MetricDescriptor::volume("orders_rate", "orders", 7);
        let window = metric.window_ending_at(base + chrono::Duration::hours(3));
        let samples = conn.metric_samples(&metric, &window).await.unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].bucket_start, base);
        assert_eq!(samples[0].value, 2.0);
        assert_eq!(samples[1].value, 1.0);
    }

    #[tokio::test]
    async fn freshness_samples_are_gaps_in_minutes() {
        let base = Utc.with_ymd_and_hms(2024, 3, 5, 8, 0, 0).unwrap();
        let backend = analytics_with_orders(&[
            (millis(base), "ORD-1", 1.0),
            (millis(base + chrono::Duration::minutes(30)), "ORD-2", 2.0),
            (millis(base + chrono::Duration::minutes(90)), "ORD-3", 3.0),
        ])
        .await;
        let conn = backend.connect().await.unwrap();

        let metric = MetricDescriptor::freshness("orders_staleness", "orders", 7);
        let window = metric.window_ending_at(base + chrono::Duration::hours(2));
        let samples = conn.metric_samples(&metric, &window).await.unwrap();

        assert_eq!(samples.len(), 2);
        assert!((samples[0].value - 30.0).abs() < 1e-9);
        assert!((samples[1].value - 60.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn current_volume_counts_since_cutoff() {
        let base = Utc.with_ymd_and_hms(2024, 3, 5, 8, 0, 0).unwrap();
        let backend = analytics_with_orders(&[
            (millis(base), "ORD-1", 1.0),
            (millis(base + chrono::Duration::hours(1)), "ORD-2", 2.0),
            (millis(base + chrono::Duration::hours(2)), "ORD-3", 3.0),
        ])
        .await;
        let conn = backend.connect().await.unwrap();

        let count = conn
            .current_volume("orders", base + chrono::Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn latest_record_at_handles_data_and_empty() {
        let base = Utc.with_ymd_and_hms(2024, 3, 5, 8, 0, 0).unwrap();
        let backend = analytics_with_orders(&[
            (millis(base), "ORD-1", 1.0),
            (millis(base + chrono::Duration::hours(2)), "ORD-2", 2.0),
        ])
        .await;
        let conn = backend.connect().await.unwrap();
        let latest = conn.latest_record_at("orders").await.unwrap().unwrap();
        assert_eq!(latest, base + chrono::Duration::hours(2));

        let empty = analytics_with_orders(&[]).await;
        let conn = empty.connect().await.unwrap();
        assert!(conn.latest_record_at("orders").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sample_records_convert_arrow_values() {
        let base = Utc.with_ymd_and_hms(2024, 3, 5, 8, 0, 0).unwrap();
        let backend = analytics_with_orders(&[
            (millis(base), "ORD-1", 10.5),
            (millis(base + chrono::Duration::hours(1)), "ORD-2", 20.5),
        ])
        .await;
        let conn = backend.connect().await.unwrap();

        let records = conn.sample_records("orders", 10).await.unwrap();
        assert_eq!(records.len(), 2);
        // Newest first.
        assert_eq!(
            records[0].fields.get("order_key"),
            Some(&FieldValue::Text("ORD-2".to_string()))
        );
        assert_eq!(
            records[0].fields.get("total_amount"),
            Some(&FieldValue::Float(20.5))
        );
        assert!(matches!(
            records[0].fields.get("created_at"),
            Some(FieldValue::Timestamp(_))
        ));
    }

    #[tokio::test]
    async fn monitoring_writes_are_unsupported() {
        let backend = analytics_with_orders(&[]).await;
        let conn = backend.connect().await.unwrap();
        let err = conn.fetch_baseline("anything").await.unwrap_err();
        assert!(matches!(err, BackendError::Unsupported { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn malicious_identifiers_are_rejected() {
        let backend = analytics_with_orders(&[]).await;
        let conn = backend.connect().await.unwrap();
        let err = conn
            .current_volume("orders; DROP TABLE orders", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Query(_)));
    }
}
