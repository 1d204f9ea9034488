//! Record shapes flowing through the pipeline

use chrono::{DateTime, Utc};
use sqlx::types::BigDecimal;

/// One CSV row, typed but not yet validated
///
/// Blank cells and cells missing from a short row are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    /// 1-based line in the source file
    pub line: u64,
    pub alert_level: Option<String>,
    pub cdi: Option<BigDecimal>,
    /// Kept fractional until validated; exports carry counts as "28.0"
    pub felt_reports: Option<f64>,
    pub magnitude: Option<BigDecimal>,
    pub magnitude_type: Option<String>,
    pub mmi: Option<BigDecimal>,
    pub place: Option<String>,
    pub significance: Option<i32>,
    pub source_id: Option<String>,
    /// Epoch milliseconds
    pub time: Option<i64>,
    pub tsunami: Option<bool>,
    pub event_type: Option<String>,
}

/// A validated, enriched earthquake event ready to be written
#[derive(Debug, Clone, PartialEq)]
pub struct DomainRecord {
    pub time: DateTime<Utc>,
    pub magnitude: Option<BigDecimal>,
    pub place: String,
    pub state: Option<String>,
    pub country: String,
    pub tsunami: bool,
    pub significance: Option<i32>,
    pub magnitude_type: Option<MagnitudeType>,
    pub event_type: EventType,
    pub felt_reports: Option<i32>,
    pub cdi: Option<BigDecimal>,
    pub mmi: Option<BigDecimal>,
    pub alert_level: Option<AlertLevel>,
    pub source_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MagnitudeType {
    Mb,
    MbLg,
    Md,
    Mh,
    Ml,
    Ms,
    Ms20,
    Mw,
    Mwb,
    Mwr,
    Mww,
}

impl MagnitudeType {
    pub const ALL: [MagnitudeType; 11] = [
        MagnitudeType::Mb,
        MagnitudeType::MbLg,
        MagnitudeType::Md,
        MagnitudeType::Mh,
        MagnitudeType::Ml,
        MagnitudeType::Ms,
        MagnitudeType::Ms20,
        MagnitudeType::Mw,
        MagnitudeType::Mwb,
        MagnitudeType::Mwr,
        MagnitudeType::Mww,
    ];

    /// Code as it appears in the export and in storage
    pub fn code(&self) -> &'static str {
        match self {
            MagnitudeType::Mb => "mb",
            MagnitudeType::MbLg => "mb_lg",
            MagnitudeType::Md => "md",
            MagnitudeType::Mh => "mh",
            MagnitudeType::Ml => "ml",
            MagnitudeType::Ms => "ms",
            MagnitudeType::Ms20 => "ms_20",
            MagnitudeType::Mw => "mw",
            MagnitudeType::Mwb => "mwb",
            MagnitudeType::Mwr => "mwr",
            MagnitudeType::Mww => "mww",
        }
    }

    /// Case-sensitive lookup
    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Earthquake,
    QuarryBlast,
    IceQuake,
    Explosion,
    OtherEvent,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::Earthquake,
        EventType::QuarryBlast,
        EventType::IceQuake,
        EventType::Explosion,
        EventType::OtherEvent,
    ];

    /// Label used by the export, e.g. "quarry blast"
    pub fn label(&self) -> &'static str {
        match self {
            EventType::Earthquake => "earthquake",
            EventType::QuarryBlast => "quarry blast",
            EventType::IceQuake => "ice quake",
            EventType::Explosion => "explosion",
            EventType::OtherEvent => "other event",
        }
    }

    /// Stored name, e.g. "QuarryBlast"
    pub fn name(&self) -> &'static str {
        match self {
            EventType::Earthquake => "Earthquake",
            EventType::QuarryBlast => "QuarryBlast",
            EventType::IceQuake => "IceQuake",
            EventType::Explosion => "Explosion",
            EventType::OtherEvent => "OtherEvent",
        }
    }

    /// Case-insensitive lookup by label
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.label().eq_ignore_ascii_case(label.trim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertLevel {
    Green,
    Yellow,
    Orange,
    Red,
}

impl AlertLevel {
    pub const ALL: [AlertLevel; 4] = [
        AlertLevel::Green,
        AlertLevel::Yellow,
        AlertLevel::Orange,
        AlertLevel::Red,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AlertLevel::Green => "Green",
            AlertLevel::Yellow => "Yellow",
            AlertLevel::Orange => "Orange",
            AlertLevel::Red => "Red",
        }
    }

    /// Case-insensitive lookup
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.name().eq_ignore_ascii_case(label.trim()))
    }
}
