//! HTTP-date encoding/decoding (RFC 1123, GMT, second precision) and the
//! monotonic/wall-clock stamps the connection and access-log records need.
//!
//! Grounded on the teacher's own `httpdate` dependency (already in its
//! `Cargo.toml` for exactly this purpose) rather than hand-rolling the
//! RFC 1123 grammar.
use std::time::SystemTime;

/// Formats `t` as an RFC 1123 HTTP-date string, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn format_http_date(t: SystemTime) -> String {
    httpdate::fmt_http_date(t)
}

/// Parses an RFC 1123 (or the other two legacy HTTP-date grammars `httpdate`
/// accepts) string back into a `SystemTime`, truncated to second precision.
pub fn parse_http_date(s: &str) -> Option<SystemTime> {
    httpdate::parse_http_date(s).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn format_then_parse_round_trips_at_second_precision() {
        let t = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let formatted = format_http_date(t);
        let parsed = parse_http_date(&formatted).unwrap();
        assert_eq!(parsed, t);
    }

    #[test]
    fn garbage_fails_to_parse() {
        assert!(parse_http_date("not a date").is_none());
    }
}
