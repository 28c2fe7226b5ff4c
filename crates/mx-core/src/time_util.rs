//! Time utilities.
//!
//! Exchanges disagree on timestamp encodings (ms integers, seconds, ISO
//! strings with and without `Z`); the parsers here accept all of them.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};

/// Current time as milliseconds since Unix epoch.
#[inline]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current time as seconds since Unix epoch.
#[inline]
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Milliseconds since epoch to `DateTime`, clamping garbage to the epoch.
pub fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

/// Parse an RFC 3339 / ISO-8601 timestamp such as Bitmex's
/// `2024-01-02T03:04:05.678Z`.
pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

/// Parse a JSON value holding ms since epoch, either as number or string.
pub fn parse_ms_value(v: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    let v = v?;
    let ms = match v {
        serde_json::Value::Number(n) => n.as_i64()?,
        serde_json::Value::String(s) => s.parse::<i64>().ok()?,
        _ => return None,
    };
    DateTime::<Utc>::from_timestamp_millis(ms)
}

/// Next occurrence of `at` (UTC time of day) strictly after `now`.
pub fn next_daily(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = Utc.from_utc_datetime(&now.date_naive().and_time(at));
    if today > now { today } else { today + ChronoDuration::days(1) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bitmex_timestamp() {
        let t = parse_iso("2024-01-02T03:04:05.678Z").unwrap();
        assert_eq!(t.timestamp_millis(), 1_704_164_645_678);
    }

    #[test]
    fn parses_ms_number_and_string() {
        let n = serde_json::json!(1_700_000_000_000i64);
        let s = serde_json::json!("1700000000000");
        assert_eq!(parse_ms_value(Some(&n)), parse_ms_value(Some(&s)));
        assert!(parse_ms_value(Some(&serde_json::json!(null))).is_none());
    }

    #[test]
    fn next_daily_rolls_over() {
        let at = NaiveTime::from_hms_opt(8, 0, 10).unwrap();
        let before = parse_iso("2024-05-01T07:00:00Z").unwrap();
        let after = parse_iso("2024-05-01T09:00:00Z").unwrap();
        assert_eq!(next_daily(before, at), parse_iso("2024-05-01T08:00:10Z").unwrap());
        assert_eq!(next_daily(after, at), parse_iso("2024-05-02T08:00:10Z").unwrap());
    }
}
