use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

/// A single cleaned price bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: DateTime<FixedOffset>,
    pub price: f64,
}

impl Observation {
    pub fn new(timestamp: DateTime<FixedOffset>, price: f64) -> Self {
        Self { timestamp, price }
    }

    /// Wall-clock hour in the timestamp's own offset
    pub fn hour(&self) -> u32 {
        self.timestamp.hour()
    }

    /// Monday = 0 .. Sunday = 6
    pub fn day_of_week(&self) -> u32 {
        self.timestamp.weekday().num_days_from_monday()
    }
}

/// An untyped row as delivered by a data source, before cleaning
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub timestamp: Option<String>,
    pub price: Option<String>,
}

impl RawObservation {
    pub fn new(timestamp: impl Into<String>, price: impl Into<String>) -> Self {
        Self {
            timestamp: Some(timestamp.into()),
            price: Some(price.into()),
        }
    }

    /// Parse into an observation; `None` if either field is null, unparseable or non-finite
    pub fn parse(&self) -> Option<Observation> {
        let timestamp = parse_timestamp(self.timestamp.as_deref()?)?;
        let price: f64 = self.price.as_deref()?.trim().parse().ok()?;
        if !price.is_finite() {
            return None;
        }
        Some(Observation { timestamp, price })
    }
}

const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S%z"];
const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS±HH:MM`, and offset-less forms (read as UTC)
pub fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts);
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(ts) = DateTime::parse_from_str(s, fmt) {
            return Some(ts);
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc().fixed_offset());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().fixed_offset())
}
