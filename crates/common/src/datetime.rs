//! DateTime utilities and the clock abstraction used for audit timestamps.

use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Get the current UTC time.
///
/// # Examples
///
/// ```
/// use datajpa_common::datetime::now_utc;
///
/// let now = now_utc();
/// println!("Current time: {}", now);
/// ```
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_datetime(datetime_str: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(datetime_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("Failed to parse datetime '{}': {}", datetime_str, e))
}

/// Source of "now" for lifecycle callbacks.
///
/// Sessions take a clock instead of calling [`now_utc`] directly so tests can
/// pin and advance time.
pub trait Clock: Send + Sync + Debug {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        now_utc()
    }
}
