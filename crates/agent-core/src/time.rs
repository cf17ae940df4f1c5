//! UTC ISO-8601 timestamp helpers.
//!
//! Every record the agent emits (`events.jsonl`, `status.json`, command
//! responses) stamps itself with the same format, produced here so the
//! rest of the crate never formats a timestamp by hand.

use time::format_description::well_known::Iso8601;
use time::OffsetDateTime;

/// Returns the current UTC time formatted as ISO-8601
/// (e.g. `2026-07-27T10:15:30.123456000Z`).
#[must_use]
pub fn now_iso8601() -> String {
    to_iso8601(OffsetDateTime::now_utc())
}

/// Formats a `SystemTime` as UTC ISO-8601.
#[must_use]
pub fn system_time_iso8601(t: std::time::SystemTime) -> String {
    to_iso8601(OffsetDateTime::from(t))
}

fn to_iso8601(dt: OffsetDateTime) -> String {
    dt.format(&Iso8601::DEFAULT)
        .unwrap_or_else(|_| dt.unix_timestamp().to_string())
}

/// Formats a `SystemTime` as the `YYYY-MM-DD HH:MM:SS,mmm` text-log
/// timestamp used by `events.log` (log4j-style comma millisecond
/// separator, per the spec's exact output format).
#[must_use]
pub fn system_time_log_format(t: std::time::SystemTime) -> String {
    let dt = OffsetDateTime::from(t);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02},{:03}",
        dt.year(),
        u8::from(dt.month()),
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second(),
        dt.millisecond(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso8601_round_trips_through_parser() {
        let s = now_iso8601();
        assert!(time::OffsetDateTime::parse(&s, &Iso8601::DEFAULT).is_ok());
    }

    #[test]
    fn log_format_has_comma_millis() {
        let s = system_time_log_format(std::time::SystemTime::now());
        assert_eq!(s.len(), "2026-07-27 10:15:30,123".len());
        assert_eq!(s.chars().nth(19), Some(','));
    }
}
