use crate::shortcode::ShortCode;
use jiff::civil::Date;
use jiff::tz::TimeZone;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// Returns the UTC calendar day containing `timestamp`.
pub fn utc_date(timestamp: Timestamp) -> Date {
    timestamp.to_zoned(TimeZone::UTC).date()
}

/// Returns the current UTC calendar day.
pub fn today_utc() -> Date {
    utc_date(Timestamp::now())
}

/// A single redirect event, recorded once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessFact {
    pub code: ShortCode,
    /// UTC calendar day the access belongs to.
    pub date: Date,
    /// Event time. Only used to make the fact's storage key unique.
    pub timestamp: Timestamp,
}

impl AccessFact {
    /// Creates a fact dated by the UTC day of `timestamp`.
    pub fn new(code: ShortCode, timestamp: Timestamp) -> Self {
        Self {
            code,
            date: utc_date(timestamp),
            timestamp,
        }
    }

    /// Creates a fact for the current instant.
    pub fn now(code: ShortCode) -> Self {
        Self::new(code, Timestamp::now())
    }
}

/// Per-(code, date) summary written by the aggregation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub code: ShortCode,
    pub date: Date,
    pub access_count: u64,
    pub processed_at: Timestamp,
}
