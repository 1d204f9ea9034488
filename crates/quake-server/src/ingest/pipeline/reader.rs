//! CSV reader producing [`RawRecord`]s
//!
//! The header line is skipped. Rows may be shorter or longer than the
//! layout; missing trailing cells read as `None` and extras are ignored.

use csv::{StringRecord, StringRecordsIntoIter};
use sqlx::types::BigDecimal;
use std::io::Read;
use std::str::FromStr;
use thiserror::Error;

use super::fields::{Field, FieldLayout};
use super::models::RawRecord;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("malformed CSV near line {line}: {source}")]
    Csv {
        line: u64,
        #[source]
        source: csv::Error,
    },

    #[error("line {line}: column '{column}' has unparseable value [{value}], expected {expected}")]
    InvalidValue {
        line: u64,
        column: &'static str,
        value: String,
        expected: &'static str,
    },
}

pub struct RecordReader<'a, R: Read> {
    records: StringRecordsIntoIter<R>,
    layout: &'a FieldLayout,
    last_line: u64,
}

impl<'a, R: Read> RecordReader<'a, R> {
    pub fn new(source: R, layout: &'a FieldLayout) -> Self {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(source);

        Self {
            records: reader.into_records(),
            layout,
            last_line: 1,
        }
    }

    fn decode(&self, line: u64, record: &StringRecord) -> Result<RawRecord, ReadError> {
        let cells = Cells {
            record,
            layout: self.layout,
            line,
        };

        Ok(RawRecord {
            line,
            alert_level: cells.text(Field::AlertLevel),
            cdi: cells.decimal(Field::Cdi)?,
            felt_reports: cells.number(Field::FeltReports)?,
            magnitude: cells.decimal(Field::Magnitude)?,
            magnitude_type: cells.text(Field::MagnitudeType),
            mmi: cells.decimal(Field::Mmi)?,
            place: cells.text(Field::Place),
            significance: cells.int(Field::Significance)?,
            source_id: cells.text(Field::SourceId),
            time: cells.parse(Field::Time, "epoch milliseconds")?,
            tsunami: cells.flag(Field::Tsunami)?,
            event_type: cells.text(Field::EventType),
        })
    }
}

impl<R: Read> Iterator for RecordReader<'_, R> {
    type Item = Result<RawRecord, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        let result = self.records.next()?;

        Some(match result {
            Ok(record) => {
                let line = record.position().map_or(self.last_line + 1, |p| p.line());
                self.last_line = line;
                self.decode(line, &record)
            }
            Err(source) => {
                let line = source.position().map_or(self.last_line + 1, |p| p.line());
                self.last_line = line;
                Err(ReadError::Csv { line, source })
            }
        })
    }
}

/// Typed access to the cells of one row
struct Cells<'r> {
    record: &'r StringRecord,
    layout: &'r FieldLayout,
    line: u64,
}

impl Cells<'_> {
    fn raw(&self, field: Field) -> Option<&str> {
        self.record
            .get(self.layout.position(field))
            .filter(|cell| !cell.trim().is_empty())
    }

    fn text(&self, field: Field) -> Option<String> {
        self.raw(field).map(str::to_string)
    }

    fn invalid(&self, field: Field, value: &str, expected: &'static str) -> ReadError {
        ReadError::InvalidValue {
            line: self.line,
            column: self.layout.header(field),
            value: value.to_string(),
            expected,
        }
    }

    fn parse<T: FromStr>(&self, field: Field, expected: &'static str) -> Result<Option<T>, ReadError> {
        self.raw(field)
            .map(|value| value.trim().parse().map_err(|_| self.invalid(field, value, expected)))
            .transpose()
    }

    fn decimal(&self, field: Field) -> Result<Option<BigDecimal>, ReadError> {
        self.parse(field, "a decimal number")
    }

    fn int(&self, field: Field) -> Result<Option<i32>, ReadError> {
        self.parse(field, "an integer")
    }

    /// Any finite number; range and sign are left to validation
    fn number(&self, field: Field) -> Result<Option<f64>, ReadError> {
        let Some(value) = self.parse::<f64>(field, "a number")? else {
            return Ok(None);
        };
        if !value.is_finite() {
            let raw = self.raw(field).unwrap_or_default();
            return Err(self.invalid(field, raw, "a finite number"));
        }
        Ok(Some(value))
    }

    fn flag(&self, field: Field) -> Result<Option<bool>, ReadError> {
        self.raw(field)
            .map(|value| match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" => Ok(true),
                "0" | "false" => Ok(false),
                _ => Err(self.invalid(field, value, "0, 1, true or false")),
            })
            .transpose()
    }
}
