//! Deadline header parsing.
//!
//! Triple carries a plain millisecond count. gRPC and gRPC-Web carry
//! `<value><unit>` where unit is one of `n u m S M H`.

use crate::status::Status;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

static TIMEOUT_MS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,10}$").expect("valid timeout pattern"));

/// Result of parsing a timeout header.
///
/// On a range violation both fields are set: the caller gets the rejected
/// value for logging alongside the error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedTimeout {
    pub timeout_ms: Option<u64>,
    pub error: Option<Status>,
}

impl ParsedTimeout {
    fn none() -> Self {
        Self::default()
    }

    fn checked(timeout_ms: u64, max_ms: u64, raw: &str) -> Self {
        let error = (timeout_ms > max_ms).then(|| {
            Status::invalid_argument(format!(
                "timeout {raw} ({timeout_ms}ms) exceeds maximum of {max_ms}ms"
            ))
        });
        Self {
            timeout_ms: Some(timeout_ms),
            error,
        }
    }

    fn invalid(message: String) -> Self {
        Self {
            timeout_ms: None,
            error: Some(Status::invalid_argument(message)),
        }
    }

    /// The accepted timeout as a duration. `None` when absent or rejected.
    pub fn duration(&self) -> Option<Duration> {
        match self.error {
            Some(_) => None,
            None => self.timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn into_result(self) -> Result<Option<Duration>, Status> {
        match self.error {
            Some(status) => Err(status),
            None => Ok(self.timeout_ms.map(Duration::from_millis)),
        }
    }
}

/// Largest value a millisecond timeout header can carry (ten digits).
pub const MAX_TIMEOUT_MS: u64 = 9_999_999_999;

/// Format a duration for `tri-service-timeout`. Sub-millisecond durations
/// round up to 1 and longer ones are capped at [`MAX_TIMEOUT_MS`].
pub fn format_timeout(timeout: Duration) -> String {
    let ms = timeout.as_millis().clamp(1, u128::from(MAX_TIMEOUT_MS));
    ms.to_string()
}

/// Parse a millisecond timeout header (`tri-service-timeout`).
pub fn parse_timeout(raw: Option<&str>, max_ms: u64) -> ParsedTimeout {
    let Some(raw) = raw else {
        return ParsedTimeout::none();
    };

    if !TIMEOUT_MS.is_match(raw) {
        return ParsedTimeout::invalid(format!("protocol error: invalid timeout value: {raw}"));
    }

    match raw.parse::<u64>() {
        Ok(ms) => ParsedTimeout::checked(ms, max_ms, raw),
        Err(_) => ParsedTimeout::invalid(format!("protocol error: invalid timeout value: {raw}")),
    }
}

/// Parse a gRPC timeout header (`grpc-timeout`) and apply the same bound.
pub fn parse_grpc_timeout(raw: Option<&str>, max_ms: u64) -> ParsedTimeout {
    let Some(raw) = raw else {
        return ParsedTimeout::none();
    };

    match GrpcTimeout::parse(raw) {
        Some(timeout) => {
            let ms = timeout.as_duration().as_millis().min(u64::MAX as u128) as u64;
            ParsedTimeout::checked(ms, max_ms, raw)
        }
        None => ParsedTimeout::invalid(format!("protocol error: invalid grpc-timeout value: {raw}")),
    }
}

/// Standard gRPC timeout format.
///
/// Format: `<value><unit>` where unit is:
/// - `n`: nanoseconds
/// - `u`: microseconds
/// - `m`: milliseconds
/// - `S`: seconds
/// - `M`: minutes
/// - `H`: hours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrpcTimeout {
    nanos: u64,
}

impl GrpcTimeout {
    /// Create a timeout from a duration, saturating at `u64::MAX` nanoseconds.
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            nanos: duration.as_nanos().min(u64::MAX as u128) as u64,
        }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_nanos(self.nanos)
    }

    /// Format as a header value, using the largest exact unit.
    ///
    /// The wire format allows at most 8 digits, so values that would need
    /// more are rounded up to a coarser unit.
    pub fn to_grpc_format(self) -> String {
        const UNITS: [(u64, char); 6] = [
            (3_600_000_000_000, 'H'),
            (60_000_000_000, 'M'),
            (1_000_000_000, 'S'),
            (1_000_000, 'm'),
            (1_000, 'u'),
            (1, 'n'),
        ];

        for (scale, unit) in UNITS {
            if self.nanos >= scale && self.nanos.is_multiple_of(scale) && self.nanos / scale < 100_000_000 {
                return format!("{}{}", self.nanos / scale, unit);
            }
        }
        for (scale, unit) in UNITS.iter().rev() {
            let value = self.nanos.div_ceil(*scale);
            if value < 100_000_000 {
                return format!("{}{}", value, unit);
            }
        }
        "99999999H".to_string()
    }

    /// Parse from a gRPC timeout header value.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() < 2 || s.len() > 9 {
            return None;
        }

        let (value_str, unit) = s.split_at(s.len() - 1);
        if !value_str.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let value: u64 = value_str.parse().ok()?;

        let nanos = match unit {
            "n" => Some(value),
            "u" => value.checked_mul(1_000),
            "m" => value.checked_mul(1_000_000),
            "S" => value.checked_mul(1_000_000_000),
            "M" => value.checked_mul(60_000_000_000),
            "H" => value.checked_mul(3_600_000_000_000),
            _ => None,
        }?;

        Some(Self { nanos })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[test]
    fn test_absent_is_not_an_error() {
        assert_eq!(parse_timeout(None, 0), ParsedTimeout::default());
        assert_eq!(parse_timeout(None, u64::MAX), ParsedTimeout::default());
        assert_eq!(parse_grpc_timeout(None, 10), ParsedTimeout::default());
    }

    #[test]
    fn test_formatted_timeout_always_parses() {
        assert_eq!(format_timeout(Duration::from_millis(250)), "250");
        assert_eq!(format_timeout(Duration::from_micros(10)), "1");
        assert_eq!(format_timeout(Duration::from_secs(400 * 24 * 3600)), "9999999999");
        assert_eq!(format_timeout(Duration::MAX), "9999999999");

        let parsed = parse_timeout(Some(&format_timeout(Duration::MAX)), u64::MAX);
        assert_eq!(parsed.error, None);
        assert_eq!(parsed.timeout_ms, Some(MAX_TIMEOUT_MS));
    }

    #[test]
    fn test_valid_timeout() {
        let parsed = parse_timeout(Some("500"), 30_000);
        assert_eq!(parsed.timeout_ms, Some(500));
        assert!(parsed.error.is_none());
        assert_eq!(parsed.duration(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_eleven_digits_rejected() {
        let parsed = parse_timeout(Some("12345678901"), u64::MAX);
        assert_eq!(parsed.timeout_ms, None);
        assert_eq!(parsed.error.unwrap().code(), Code::InvalidArgument);
    }

    #[test]
    fn test_malformed_values_rejected() {
        for raw in ["", "1.5", "-1", " 10", "10s", "abc", "١٢"] {
            let parsed = parse_timeout(Some(raw), u64::MAX);
            let error = parsed.error.expect(raw);
            assert_eq!(error.code(), Code::InvalidArgument);
            assert!(error.message().unwrap().contains(raw));
        }
    }

    #[test]
    fn test_over_max_keeps_value() {
        let parsed = parse_timeout(Some("100"), 50);
        assert_eq!(parsed.timeout_ms, Some(100));
        assert_eq!(parsed.error.as_ref().unwrap().code(), Code::InvalidArgument);
        assert_eq!(parsed.duration(), None);
        assert!(parsed.into_result().is_err());
    }

    #[test]
    fn test_ten_digit_max() {
        let parsed = parse_timeout(Some("9999999999"), u64::MAX);
        assert_eq!(parsed.timeout_ms, Some(9_999_999_999));
        assert!(parsed.error.is_none());
    }

    #[test]
    fn test_grpc_timeout_parse() {
        assert_eq!(
            GrpcTimeout::parse("500m").unwrap().as_duration(),
            Duration::from_millis(500)
        );
        assert_eq!(GrpcTimeout::parse("2S").unwrap().as_duration(), Duration::from_secs(2));
        assert_eq!(GrpcTimeout::parse("1H").unwrap().as_duration(), Duration::from_secs(3600));
        assert!(GrpcTimeout::parse("m").is_none());
        assert!(GrpcTimeout::parse("10x").is_none());
        assert!(GrpcTimeout::parse("+10m").is_none());
        assert!(GrpcTimeout::parse("123456789m").is_none());
    }

    #[test]
    fn test_grpc_timeout_format() {
        let fmt = |d| GrpcTimeout::from_duration(d).to_grpc_format();
        assert_eq!(fmt(Duration::from_millis(500)), "500m");
        assert_eq!(fmt(Duration::from_secs(120)), "2M");
        assert_eq!(fmt(Duration::from_nanos(1500)), "1500n");
        assert_eq!(fmt(Duration::from_secs(7200)), "2H");
    }

    #[test]
    fn test_grpc_timeout_format_stays_within_eight_digits() {
        let value = GrpcTimeout::from_duration(Duration::from_nanos(123_456_789_123)).to_grpc_format();
        assert!(value.len() <= 9);
        assert!(GrpcTimeout::parse(&value).unwrap().as_duration() >= Duration::from_nanos(123_456_789_123));
    }

    #[test]
    fn test_grpc_timeout_bound() {
        let parsed = parse_grpc_timeout(Some("2S"), 1_000);
        assert_eq!(parsed.timeout_ms, Some(2_000));
        assert_eq!(parsed.error.unwrap().code(), Code::InvalidArgument);

        let parsed = parse_grpc_timeout(Some("bogus"), 1_000);
        assert_eq!(parsed.error.unwrap().code(), Code::InvalidArgument);
    }
}
