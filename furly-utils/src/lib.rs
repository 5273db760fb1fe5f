//! Small helpers shared by the furly crates
//!
//! ## Core Features:
//! - **Duration Conversion**: String-to-Duration parsing supporting multiple time units
//! - **Serde Helpers**: (de)serializing durations in their human-readable form
//! - **Timestamp Utilities**: millisecond timestamps and formatting
//! - **Counter**: thread-safe gauge with peak tracking ([`Counter`])
//!
//! ## Usage Examples:
//! ```rust
//! use furly_utils::{to_duration, format_duration};
//!
//! let duration = to_duration("1h30m15s");
//! assert_eq!(duration.as_secs(), 5415);
//! assert_eq!(format_duration(&duration), "5415s");
//! ```

#![deny(unsafe_code)]

use std::time::Duration;

use serde::{
    de::{self, Deserializer},
    ser::Serializer,
    Deserialize,
};

mod counter;

pub use counter::Counter;

/// Timestamp representation in milliseconds since Unix epoch
pub type TimestampMillis = i64;

/// Deserialize Duration from human-readable string format
///
/// Plain integers are accepted as seconds.
#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = DurationRepr::deserialize(deserializer)?;
    v.into_duration().map_err(de::Error::custom)
}

/// Serialize Duration in the format accepted by [`to_duration`]
#[inline]
pub fn serialize_duration<S>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(&format_duration(d))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
    Secs(u64),
    Text(String),
}

impl DurationRepr {
    fn into_duration(self) -> Result<Duration, String> {
        match self {
            DurationRepr::Secs(secs) => Ok(Duration::from_secs(secs)),
            DurationRepr::Text(text) => match text.trim().parse::<u64>() {
                Ok(secs) => Ok(Duration::from_secs(secs)),
                Err(_) => parse_millis(text.trim())
                    .map(Duration::from_millis)
                    .ok_or_else(|| format!("invalid duration `{}`", text)),
            },
        }
    }
}

/// Parses a duration such as `1h30m15s`, `250ms` or `2w3d`.
///
/// Units are `ms`, `s`, `m`, `h`, `d` and `w`. Malformed input, or a number
/// without a unit, yields zero.
///
/// ```
/// assert_eq!(furly_utils::to_duration("1m30s").as_secs(), 90);
/// assert_eq!(furly_utils::to_duration("250ms").as_millis(), 250);
/// ```
pub fn to_duration(text: &str) -> Duration {
    parse_millis(text.trim()).map(Duration::from_millis).unwrap_or_default()
}

fn parse_millis(text: &str) -> Option<u64> {
    let mut total: u64 = 0;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let value = rest[..digits].parse::<u64>().ok()?;
        rest = &rest[digits..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let factor = match rest[..unit_len].to_ascii_lowercase().as_str() {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            "w" => 604_800_000,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total = total.checked_add(value.checked_mul(factor)?)?;
    }
    Some(total)
}

/// Format a duration using the coarsest unit that represents it exactly
///
/// # Example:
/// ```
/// use std::time::Duration;
/// assert_eq!(furly_utils::format_duration(&Duration::from_millis(1500)), "1500ms");
/// assert_eq!(furly_utils::format_duration(&Duration::from_secs(30)), "30s");
/// ```
#[inline]
pub fn format_duration(d: &Duration) -> String {
    if d.subsec_millis() != 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

/// Get current timestamp in milliseconds
#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}

/// Format millisecond timestamp to string
#[inline]
pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    if t <= 0 {
        "".into()
    } else {
        use chrono::TimeZone;
        if let chrono::LocalResult::Single(t) = chrono::Local.timestamp_millis_opt(t) {
            t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
        } else {
            "".into()
        }
    }
}
