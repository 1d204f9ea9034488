//! Chunk writers
//!
//! A chunk is written atomically: either every record lands or none do.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::BigDecimal;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use super::models::{AlertLevel, DomainRecord, EventType, MagnitudeType};

/// Identifies the rows produced by one partition of one execution
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub execution_id: i64,
    pub partition_id: String,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Write rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Remove rows left by an earlier attempt at the same partition
    async fn reset_partition(&self, key: &PartitionKey) -> Result<u64, SinkError>;

    /// Insert the whole chunk in one transaction
    async fn write_chunk(&self, key: &PartitionKey, records: &[DomainRecord]) -> Result<u64, SinkError>;
}

// ============================================================================
// PostgreSQL
// ============================================================================

#[derive(Clone)]
pub struct PgRecordSink {
    pool: PgPool,
}

impl PgRecordSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Rows written for a partition, in insertion order
    pub async fn fetch_partition(&self, key: &PartitionKey) -> Result<Vec<DomainRecord>, SinkError> {
        let rows = sqlx::query_as::<_, EarthquakeRow>(
            r#"
            SELECT time, magnitude, place, state, country, tsunami, significance,
                   mag_type, event_type, felt_reports, cdi, mmi, alert_level, source_id
            FROM earthquakes
            WHERE execution_id = $1 AND partition_id = $2
            ORDER BY id
            "#,
        )
        .bind(key.execution_id)
        .bind(&key.partition_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DomainRecord::try_from).collect()
    }
}

#[async_trait]
impl RecordSink for PgRecordSink {
    async fn reset_partition(&self, key: &PartitionKey) -> Result<u64, SinkError> {
        let result = sqlx::query("DELETE FROM earthquakes WHERE execution_id = $1 AND partition_id = $2")
            .bind(key.execution_id)
            .bind(&key.partition_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn write_chunk(&self, key: &PartitionKey, records: &[DomainRecord]) -> Result<u64, SinkError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO earthquakes (execution_id, partition_id, time, magnitude, place, state, country, \
             tsunami, significance, mag_type, event_type, felt_reports, cdi, mmi, alert_level, source_id) ",
        );
        builder.push_values(records, |mut row, record| {
            row.push_bind(key.execution_id)
                .push_bind(&key.partition_id)
                .push_bind(record.time)
                .push_bind(&record.magnitude)
                .push_bind(&record.place)
                .push_bind(&record.state)
                .push_bind(&record.country)
                .push_bind(record.tsunami)
                .push_bind(record.significance)
                .push_bind(record.magnitude_type.map(|t| t.code()))
                .push_bind(record.event_type.name())
                .push_bind(record.felt_reports)
                .push_bind(&record.cdi)
                .push_bind(&record.mmi)
                .push_bind(record.alert_level.map(|a| a.name()))
                .push_bind(&record.source_id);
        });

        let result = builder.build().execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EarthquakeRow {
    time: DateTime<Utc>,
    magnitude: Option<BigDecimal>,
    place: String,
    state: Option<String>,
    country: String,
    tsunami: bool,
    significance: Option<i32>,
    mag_type: Option<String>,
    event_type: String,
    felt_reports: Option<i32>,
    cdi: Option<BigDecimal>,
    mmi: Option<BigDecimal>,
    alert_level: Option<String>,
    source_id: String,
}

impl TryFrom<EarthquakeRow> for DomainRecord {
    type Error = SinkError;

    fn try_from(row: EarthquakeRow) -> Result<Self, Self::Error> {
        let corrupt = |column: &str, value: &str| {
            SinkError::Rejected(format!("stored {} [{}] is not recognised", column, value))
        };

        let magnitude_type = row
            .mag_type
            .as_deref()
            .map(|code| MagnitudeType::from_code(code).ok_or_else(|| corrupt("mag_type", code)))
            .transpose()?;
        let event_type = EventType::ALL
            .into_iter()
            .find(|t| t.name() == row.event_type)
            .ok_or_else(|| corrupt("event_type", &row.event_type))?;
        let alert_level = row
            .alert_level
            .as_deref()
            .map(|name| AlertLevel::from_label(name).ok_or_else(|| corrupt("alert_level", name)))
            .transpose()?;

        Ok(DomainRecord {
            time: row.time,
            magnitude: row.magnitude,
            place: row.place,
            state: row.state,
            country: row.country,
            tsunami: row.tsunami,
            significance: row.significance,
            magnitude_type,
            event_type,
            felt_reports: row.felt_reports,
            cdi: row.cdi,
            mmi: row.mmi,
            alert_level,
            source_id: row.source_id,
        })
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Sink keeping rows in memory, used by `standalone` runs and tests
#[derive(Default)]
pub struct MemoryRecordSink {
    rows: Mutex<HashMap<PartitionKey, Vec<DomainRecord>>>,
    fail_on_write: Mutex<Option<usize>>,
    writes: Mutex<usize>,
}

impl MemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `n`th chunk write (0-based, counted across partitions) fail
    pub fn fail_on_write(self, n: usize) -> Self {
        *lock(&self.fail_on_write) = Some(n);
        self
    }

    pub fn rows(&self, key: &PartitionKey) -> Vec<DomainRecord> {
        lock(&self.rows).get(key).cloned().unwrap_or_default()
    }

    pub fn total_rows(&self) -> usize {
        lock(&self.rows).values().map(Vec::len).sum()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl RecordSink for MemoryRecordSink {
    async fn reset_partition(&self, key: &PartitionKey) -> Result<u64, SinkError> {
        Ok(lock(&self.rows).remove(key).map_or(0, |rows| rows.len() as u64))
    }

    async fn write_chunk(&self, key: &PartitionKey, records: &[DomainRecord]) -> Result<u64, SinkError> {
        let attempt = {
            let mut writes = lock(&self.writes);
            let attempt = *writes;
            *writes += 1;
            attempt
        };
        if *lock(&self.fail_on_write) == Some(attempt) {
            return Err(SinkError::Rejected(format!("injected failure on write {}", attempt)));
        }

        lock(&self.rows)
            .entry(key.clone())
            .or_default()
            .extend_from_slice(records);
        Ok(records.len() as u64)
    }
}
