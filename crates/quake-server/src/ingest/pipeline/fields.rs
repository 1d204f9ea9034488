//! Positional layout of the USGS earthquake CSV export
//!
//! The export has 26 columns. Twelve of them feed a [`Field`]; the rest are
//! carried in the file but ignored. The layout is checked once at startup so
//! a mis-edited table fails fast instead of silently shifting every value.

use std::collections::HashMap;
use thiserror::Error;

/// Number of columns in the USGS export.
pub const USGS_COLUMN_COUNT: usize = 26;

/// A column the pipeline reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    AlertLevel,
    Cdi,
    FeltReports,
    Magnitude,
    MagnitudeType,
    Mmi,
    Place,
    Significance,
    SourceId,
    Time,
    Tsunami,
    EventType,
}

impl Field {
    pub const ALL: [Field; 12] = [
        Field::AlertLevel,
        Field::Cdi,
        Field::FeltReports,
        Field::Magnitude,
        Field::MagnitudeType,
        Field::Mmi,
        Field::Place,
        Field::Significance,
        Field::SourceId,
        Field::Time,
        Field::Tsunami,
        Field::EventType,
    ];

    /// Name used in diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Field::AlertLevel => "alert_level",
            Field::Cdi => "cdi",
            Field::FeltReports => "felt_reports",
            Field::Magnitude => "magnitude",
            Field::MagnitudeType => "magnitude_type",
            Field::Mmi => "mmi",
            Field::Place => "place",
            Field::Significance => "significance",
            Field::SourceId => "source_id",
            Field::Time => "time",
            Field::Tsunami => "tsunami",
            Field::EventType => "event_type",
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Column header and, when the pipeline reads it, the field it feeds.
pub type ColumnSpec = (&'static str, Option<Field>);

pub const USGS_COLUMNS: [ColumnSpec; USGS_COLUMN_COUNT] = [
    ("alert", Some(Field::AlertLevel)),
    ("cdi", Some(Field::Cdi)),
    ("code", None),
    ("detail", None),
    ("dmin", None),
    ("felt", Some(Field::FeltReports)),
    ("gap", None),
    ("ids", None),
    ("mag", Some(Field::Magnitude)),
    ("magType", Some(Field::MagnitudeType)),
    ("mmi", Some(Field::Mmi)),
    ("net", None),
    ("nst", None),
    ("place", Some(Field::Place)),
    ("rms", None),
    ("sig", Some(Field::Significance)),
    ("sources", Some(Field::SourceId)),
    ("status", None),
    ("time", Some(Field::Time)),
    ("title", None),
    ("tsunami", Some(Field::Tsunami)),
    ("type", Some(Field::EventType)),
    ("types", None),
    ("tz", None),
    ("updated", None),
    ("url", None),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("layout has {actual} columns, expected {expected}")]
    WrongWidth { expected: usize, actual: usize },

    #[error("field {0} is not mapped to any column")]
    Missing(Field),

    #[error("field {field} is mapped to both column {first} and column {second}")]
    Duplicate { field: Field, first: usize, second: usize },
}

/// Verified mapping from field to column position
#[derive(Debug, Clone)]
pub struct FieldLayout {
    headers: Vec<&'static str>,
    positions: HashMap<Field, usize>,
}

impl FieldLayout {
    pub fn new(columns: &[ColumnSpec], expected_width: usize) -> Result<Self, LayoutError> {
        if columns.len() != expected_width {
            return Err(LayoutError::WrongWidth {
                expected: expected_width,
                actual: columns.len(),
            });
        }

        let mut positions = HashMap::new();
        for (index, (_, field)) in columns.iter().enumerate() {
            let Some(field) = field else { continue };
            if let Some(first) = positions.insert(*field, index) {
                return Err(LayoutError::Duplicate {
                    field: *field,
                    first,
                    second: index,
                });
            }
        }

        if let Some(missing) = Field::ALL.iter().find(|f| !positions.contains_key(f)) {
            return Err(LayoutError::Missing(*missing));
        }

        Ok(Self {
            headers: columns.iter().map(|(header, _)| *header).collect(),
            positions,
        })
    }

    pub fn usgs() -> Result<Self, LayoutError> {
        Self::new(&USGS_COLUMNS, USGS_COLUMN_COUNT)
    }

    pub fn position(&self, field: Field) -> usize {
        // `new` guarantees every field is present
        self.positions.get(&field).copied().unwrap_or(usize::MAX)
    }

    pub fn header(&self, field: Field) -> &'static str {
        self.headers.get(self.position(field)).copied().unwrap_or("?")
    }

    pub fn width(&self) -> usize {
        self.headers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usgs_layout_positions() {
        let layout = FieldLayout::usgs().unwrap();
        assert_eq!(layout.width(), 26);
        assert_eq!(layout.position(Field::AlertLevel), 0);
        assert_eq!(layout.position(Field::FeltReports), 5);
        assert_eq!(layout.position(Field::Magnitude), 8);
        assert_eq!(layout.position(Field::Place), 13);
        assert_eq!(layout.position(Field::SourceId), 16);
        assert_eq!(layout.position(Field::Time), 18);
        assert_eq!(layout.position(Field::EventType), 21);
        assert_eq!(layout.header(Field::EventType), "type");
    }

    #[test]
    fn test_rejects_wrong_width() {
        let err = FieldLayout::new(&USGS_COLUMNS[..25], USGS_COLUMN_COUNT).unwrap_err();
        assert_eq!(err, LayoutError::WrongWidth { expected: 26, actual: 25 });
    }

    #[test]
    fn test_rejects_duplicate_and_missing_fields() {
        let mut columns = USGS_COLUMNS;
        columns[2] = ("code", Some(Field::Magnitude));
        assert_eq!(
            FieldLayout::new(&columns, USGS_COLUMN_COUNT).unwrap_err(),
            LayoutError::Duplicate { field: Field::Magnitude, first: 2, second: 8 }
        );

        let mut columns = USGS_COLUMNS;
        columns[20] = ("tsunami", None);
        assert_eq!(
            FieldLayout::new(&columns, USGS_COLUMN_COUNT).unwrap_err(),
            LayoutError::Missing(Field::Tsunami)
        );
    }
}
