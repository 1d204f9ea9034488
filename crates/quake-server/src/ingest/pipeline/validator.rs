//! Per-row business rules
//!
//! Every rule is checked and all violations of a row are reported together.

use sqlx::types::BigDecimal;
use std::fmt;
use thiserror::Error;

use super::fields::Field;
use super::models::{AlertLevel, EventType, MagnitudeType, RawRecord};

/// Latest accepted event time: 9999-12-31T23:59:59.999Z.
pub const MAX_EPOCH_MILLIS: i64 = 253_402_300_799_999;
pub const MIN_MAGNITUDE: i64 = -2;
pub const MAX_MAGNITUDE: i64 = 10;
pub const MAX_SIGNIFICANCE: i32 = 3000;
/// Upper bound of the intensity scales (cdi and mmi).
pub const MAX_INTENSITY: i64 = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: Field,
    pub rejected_value: String,
    pub message: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "field '{}' rejected value [{}]: {}",
            self.field, self.rejected_value, self.message
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("line {line} failed validation: {}", join_violations(.violations))]
pub struct ValidationError {
    pub line: u64,
    pub violations: Vec<FieldViolation>,
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecordValidator;

impl RecordValidator {
    pub fn validate(&self, raw: &RawRecord) -> Result<(), ValidationError> {
        let mut check = Checks::default();

        match raw.time {
            None => check.reject(Field::Time, None::<i64>, "must not be null"),
            Some(ms) if !(0..=MAX_EPOCH_MILLIS).contains(&ms) => check.reject(
                Field::Time,
                Some(ms),
                format!("must be between 0 and {}", MAX_EPOCH_MILLIS),
            ),
            Some(_) => {}
        }

        if let Some(mag) = &raw.magnitude {
            if *mag < BigDecimal::from(MIN_MAGNITUDE) || *mag > BigDecimal::from(MAX_MAGNITUDE) {
                check.reject(
                    Field::Magnitude,
                    Some(mag),
                    format!("must be between {} and {}", MIN_MAGNITUDE, MAX_MAGNITUDE),
                );
            }
        }

        if raw.place.as_deref().map_or(true, |p| p.trim().is_empty()) {
            check.reject(Field::Place, raw.place.as_ref(), "must not be blank");
        }

        if raw.tsunami.is_none() {
            check.reject(Field::Tsunami, None::<bool>, "must not be null");
        }

        if let Some(sig) = raw.significance {
            if !(0..=MAX_SIGNIFICANCE).contains(&sig) {
                check.reject(
                    Field::Significance,
                    Some(sig),
                    format!("must be between 0 and {}", MAX_SIGNIFICANCE),
                );
            }
        }

        if let Some(code) = raw.magnitude_type.as_deref().filter(|c| !c.trim().is_empty()) {
            if MagnitudeType::from_code(code).is_none() {
                check.reject(Field::MagnitudeType, Some(code), "is not a known magnitude type");
            }
        }

        match raw.event_type.as_deref() {
            Some(label) if EventType::from_label(label).is_some() => {}
            other => check.reject(
                Field::EventType,
                other,
                "must be one of earthquake, quarry blast, ice quake, explosion, other event",
            ),
        }

        if let Some(felt) = raw.felt_reports {
            if felt < 0.0 {
                check.reject(Field::FeltReports, Some(felt), "must be zero or greater");
            } else if felt.trunc() > f64::from(i32::MAX) {
                check.reject(Field::FeltReports, Some(felt), "must fit a 32-bit count");
            }
        }

        for (field, value) in [(Field::Cdi, &raw.cdi), (Field::Mmi, &raw.mmi)] {
            if let Some(v) = value {
                if *v < BigDecimal::from(0) || *v > BigDecimal::from(MAX_INTENSITY) {
                    check.reject(field, Some(v), format!("must be between 0 and {}", MAX_INTENSITY));
                }
            }
        }

        if let Some(level) = raw.alert_level.as_deref().filter(|l| !l.trim().is_empty()) {
            if AlertLevel::from_label(level).is_none() {
                check.reject(
                    Field::AlertLevel,
                    Some(level),
                    "must be one of green, yellow, orange, red",
                );
            }
        }

        if raw.source_id.as_deref().map_or(true, |s| s.trim().is_empty()) {
            check.reject(Field::SourceId, raw.source_id.as_ref(), "must not be blank");
        }

        check.finish(raw.line)
    }
}

#[derive(Default)]
struct Checks {
    violations: Vec<FieldViolation>,
}

impl Checks {
    fn reject<V: fmt::Display>(&mut self, field: Field, value: Option<V>, message: impl Into<String>) {
        self.violations.push(FieldViolation {
            field,
            rejected_value: value.map_or_else(|| "null".to_string(), |v| v.to_string()),
            message: message.into(),
        });
    }

    fn finish(self, line: u64) -> Result<(), ValidationError> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                line,
                violations: self.violations,
            })
        }
    }
}
