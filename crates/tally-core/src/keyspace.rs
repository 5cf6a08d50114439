//! Key layout for statistics data.
//!
//! Every key that belongs to a calendar date embeds that date inside a
//! `{...}` routing tag. A cluster-aware Redis client hashes only the tag, so
//! all keys of one date land on the same slot and a single script may touch
//! any of them atomically. The short code is always the last segment,
//! outside the tag:
//!
//! ```text
//! url:access:count:{2024-01-01}:abc123
//! batch:processed:{2024-01-01}:abc123
//! url:access:codes:{2024-01-01}
//! ```
//!
//! The inverse helpers ([`extract_code`], [`extract_date`]) also understand
//! the legacy untagged layout (`hitcount:abc123`) and never fail: malformed
//! input falls back to the raw key or to `None`.

use crate::shortcode::ShortCode;
use jiff::civil::Date;
use jiff::Timestamp;

const FACT_PREFIX: &str = "url:access:fact";
const ACCESS_COUNT_PREFIX: &str = "url:access:count";
const ACCESS_CODES_PREFIX: &str = "url:access:codes";
const DAILY_STATS_PREFIX: &str = "url:daily:stats";
const DAILY_CODES_PREFIX: &str = "url:daily:codes";
const TOTAL_ACCESS_PREFIX: &str = "url:total:access";
const LAST_ACCESS_PREFIX: &str = "url:last:access";
const PROCESSED_PREFIX: &str = "batch:processed";
const PROCESSING_PREFIX: &str = "batch:processing";
const LOCK_PREFIX: &str = "batch:lock:aggregation";
const STATS_CACHE_PREFIX: &str = "stats";

/// Returns the routing tag shared by every key of `date`, e.g. `{2024-01-01}`.
pub fn routing_tag(date: Date) -> String {
    format!("{{{date}}}")
}

fn dated(prefix: &str, date: Date, code: &str) -> String {
    format!("{prefix}:{{{date}}}:{code}")
}

/// Key of a single access fact. The timestamp only makes the key unique.
pub fn fact_key(code: &ShortCode, date: Date, timestamp: Timestamp) -> String {
    format!(
        "{FACT_PREFIX}:{{{date}}}:{}:{}",
        timestamp.as_nanosecond(),
        code.as_str()
    )
}

/// Running number of facts recorded for `code` on `date`.
pub fn access_count_key(code: &ShortCode, date: Date) -> String {
    dated(ACCESS_COUNT_PREFIX, date, code.as_str())
}

pub fn daily_aggregate_key(code: &ShortCode, date: Date) -> String {
    dated(DAILY_STATS_PREFIX, date, code.as_str())
}

pub fn total_counter_key(code: &ShortCode, date: Date) -> String {
    dated(TOTAL_ACCESS_PREFIX, date, code.as_str())
}

pub fn last_access_key(code: &ShortCode, date: Date) -> String {
    dated(LAST_ACCESS_PREFIX, date, code.as_str())
}

/// Set of every code that received at least one access on `date`.
pub fn code_index_key(date: Date) -> String {
    format!("{ACCESS_CODES_PREFIX}:{{{date}}}")
}

/// Set of every code with a daily aggregate on `date`.
pub fn daily_codes_key(date: Date) -> String {
    format!("{DAILY_CODES_PREFIX}:{{{date}}}")
}

pub fn processed_marker_key(code: &ShortCode, date: Date) -> String {
    dated(PROCESSED_PREFIX, date, code.as_str())
}

pub fn processing_marker_key(code: &ShortCode, date: Date) -> String {
    dated(PROCESSING_PREFIX, date, code.as_str())
}

pub fn lock_key(date: Date) -> String {
    format!("{LOCK_PREFIX}:{{{date}}}")
}

/// Lock key for one batch type on `date`; hourly and daily runs never contend.
pub fn batch_lock_key(batch_type: &str, date: Date) -> String {
    format!("{}:{batch_type}", lock_key(date))
}

/// Pattern matching every cached statistics entry derived from `code`.
pub fn stats_cache_pattern(code: &ShortCode) -> String {
    format!("{STATS_CACHE_PREFIX}:{}:*", code.as_str())
}

/// Prefix form of [`stats_cache_pattern`], for stores that match on prefixes.
pub fn stats_cache_prefix(code: &ShortCode) -> String {
    format!("{STATS_CACHE_PREFIX}:{}:", code.as_str())
}

/// Returns `true` if the key carries a `{...}` routing tag.
pub fn is_routed_key(key: &str) -> bool {
    key.contains('{') && key.contains('}')
}

/// Byte range of the first routing tag, braces included.
fn tag_bounds(key: &str) -> Option<(usize, usize)> {
    let start = key.find('{')?;
    let end = start + key[start..].find('}')?;
    Some((start, end))
}

/// Best-effort extraction of the short code from a key.
///
/// Tagged keys yield the segment after the last colon following the tag.
/// Other keys yield their second colon-separated segment. Anything else is
/// returned unchanged.
pub fn extract_code(key: &str) -> &str {
    if key.is_empty() {
        return key;
    }

    if let Some((_, end)) = tag_bounds(key) {
        let tail = &key[end + 1..];
        if let Some((_, code)) = tail.rsplit_once(':') {
            if !code.is_empty() {
                return code;
            }
        }
    }

    let mut segments = key.split(':');
    if let (Some(_), Some(second)) = (segments.next(), segments.next()) {
        if !second.is_empty() {
            return second;
        }
    }

    key
}

fn looks_like_iso_date(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

/// Best-effort extraction of the date from a key.
///
/// Reads the routing tag first, then any `YYYY-MM-DD` colon segment.
pub fn extract_date(key: &str) -> Option<Date> {
    if let Some((start, end)) = tag_bounds(key) {
        if let Ok(date) = key[start + 1..end].parse::<Date>() {
            return Some(date);
        }
    }

    key.split(':')
        .filter(|segment| looks_like_iso_date(segment))
        .find_map(|segment| segment.parse::<Date>().ok())
}

/// Rewrites a legacy untagged key into the tagged layout for `date`.
///
/// Tagged keys are returned as-is. Known legacy families map onto their
/// tagged counterpart; unknown ones become `<prefix>:{date}:<code>`.
pub fn to_routed_key(legacy_key: &str, date: Date) -> String {
    if is_routed_key(legacy_key) {
        return legacy_key.to_string();
    }

    let code = ShortCode::new_unchecked(extract_code(legacy_key));

    if legacy_key.contains("hitcount") || legacy_key.contains("access:count") {
        access_count_key(&code, date)
    } else if legacy_key.contains("daily:stats") {
        daily_aggregate_key(&code, date)
    } else if legacy_key.contains("total:access") {
        total_counter_key(&code, date)
    } else if legacy_key.contains("last:access") {
        last_access_key(&code, date)
    } else {
        let prefix = legacy_key.split(':').next().unwrap_or(legacy_key);
        dated(prefix, date, code.as_str())
    }
}
