use std::fmt::{Display, Formatter};
use std::str::FromStr;

use jiff::civil::Date;
use tracing::warn;

use crate::error::TriggerError;

/// Kind of scheduled run. Each kind holds its own fleet-wide lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchType {
    /// Intra-day catch-up over today's facts.
    Hourly,
    /// Reconciliation of the previous day.
    Daily,
}

impl BatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchType::Hourly => "hourly",
            BatchType::Daily => "daily",
        }
    }

    /// Date a run targets when no explicit date is given.
    pub fn default_target_date(&self, today: Date) -> Date {
        match self {
            BatchType::Hourly => today,
            BatchType::Daily => today.yesterday().unwrap_or(today),
        }
    }
}

impl Display for BatchType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchType {
    type Err = TriggerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(BatchType::Hourly),
            "daily" => Ok(BatchType::Daily),
            _ => Err(TriggerError::UnknownBatchType(s.to_string())),
        }
    }
}

/// Parses a trigger's target date, falling back when it is absent or invalid.
///
/// Accepts `YYYY-MM-DD`, `YYYY/MM/DD` and `YYYYMMDD`.
pub fn parse_target_date(input: Option<&str>, fallback: Date) -> Date {
    let Some(raw) = input.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return fallback;
    };

    match parse_date(raw) {
        Some(date) => date,
        None => {
            warn!(input = %raw, fallback = %fallback, "Unrecognized target date, using fallback");
            fallback
        }
    }
}

fn parse_date(raw: &str) -> Option<Date> {
    if let Ok(date) = Date::strptime("%Y/%m/%d", raw) {
        return Some(date);
    }

    if raw.len() == 8 && raw.bytes().all(|b| b.is_ascii_digit()) {
        let year = raw[0..4].parse::<i16>().ok()?;
        let month = raw[4..6].parse::<i8>().ok()?;
        let day = raw[6..8].parse::<i8>().ok()?;
        return Date::new(year, month, day).ok();
    }

    raw.parse::<Date>().ok()
}
