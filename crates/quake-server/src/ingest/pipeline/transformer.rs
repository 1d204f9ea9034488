//! Validated row -> domain record

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::fields::Field;
use super::models::{AlertLevel, DomainRecord, EventType, MagnitudeType, RawRecord};
use super::states;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    #[error("line {line}: {field} value [{value}] is not in its vocabulary")]
    UnknownCode {
        line: u64,
        field: Field,
        value: String,
    },

    #[error("line {line}: {field} is required")]
    Missing { line: u64, field: Field },

    #[error("line {line}: time [{millis}] cannot be represented as a timestamp")]
    TimeOutOfRange { line: u64, millis: i64 },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecordTransformer;

impl RecordTransformer {
    pub fn transform(&self, raw: RawRecord) -> Result<DomainRecord, TransformError> {
        let line = raw.line;
        let missing = |field| TransformError::Missing { line, field };

        let millis = raw.time.ok_or_else(|| missing(Field::Time))?;
        let time = DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or(TransformError::TimeOutOfRange { line, millis })?;

        let place = raw.place.ok_or_else(|| missing(Field::Place))?;
        let (state, country) = states::locate(&place);

        let event_label = raw.event_type.ok_or_else(|| missing(Field::EventType))?;
        let event_type = decode(line, Field::EventType, Some(event_label), EventType::from_label)?
            .ok_or_else(|| missing(Field::EventType))?;

        Ok(DomainRecord {
            time,
            magnitude: raw.magnitude,
            state,
            country,
            place,
            tsunami: raw.tsunami.ok_or_else(|| missing(Field::Tsunami))?,
            significance: raw.significance,
            magnitude_type: decode(line, Field::MagnitudeType, raw.magnitude_type, MagnitudeType::from_code)?,
            event_type,
            // Validated to lie within 0..=i32::MAX
            felt_reports: raw.felt_reports.map(|felt| felt.trunc() as i32),
            cdi: raw.cdi,
            mmi: raw.mmi,
            alert_level: decode(line, Field::AlertLevel, raw.alert_level, AlertLevel::from_label)?,
            source_id: raw.source_id.ok_or_else(|| missing(Field::SourceId))?,
        })
    }
}

/// Blank decodes to `None`; a non-blank value outside the vocabulary is an error
fn decode<T>(
    line: u64,
    field: Field,
    value: Option<String>,
    lookup: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, TransformError> {
    match value {
        Some(v) if !v.trim().is_empty() => lookup(&v)
            .map(Some)
            .ok_or(TransformError::UnknownCode { line, field, value: v }),
        _ => Ok(None),
    }
}
