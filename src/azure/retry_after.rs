//! `Retry-After` header parsing (delay-seconds or HTTP-date).

use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};

/// Cooldown, in seconds, applied when a 429 carries no usable `Retry-After`.
pub const DEFAULT_COOLDOWN_SECS: i64 = 360;

/// Parse one header value into a delay relative to `now`.
///
/// Dates in the past yield a zero delay.
pub fn parse_value(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return i64::try_from(secs).ok().and_then(Duration::try_seconds);
    }

    // IMF-fixdate ("Wed, 21 Oct 2015 07:28:00 GMT") is a valid RFC 2822 date.
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).max(Duration::zero()))
}

/// Resolve the cooldown deadline for a 429 response.
///
/// The first parseable `Retry-After` value wins; otherwise [`DEFAULT_COOLDOWN_SECS`].
pub fn retry_at(headers: &HeaderMap, now: DateTime<Utc>) -> DateTime<Utc> {
    let delay = headers
        .get_all(RETRY_AFTER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|v| parse_value(v, now))
        .unwrap_or_else(|| Duration::seconds(DEFAULT_COOLDOWN_SECS));
    now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reqwest::header::HeaderValue;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 10, 21, 7, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_value("120", now()), Some(Duration::seconds(120)));
        assert_eq!(parse_value(" 0 ", now()), Some(Duration::zero()));
    }

    #[test]
    fn test_parse_http_date() {
        let delay = parse_value("Wed, 21 Oct 2015 07:28:00 GMT", now()).unwrap();
        assert_eq!(delay, Duration::minutes(28));
    }

    #[test]
    fn test_parse_past_date_is_zero() {
        let delay = parse_value("Wed, 21 Oct 2015 06:00:00 GMT", now()).unwrap();
        assert_eq!(delay, Duration::zero());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_value("soon", now()).is_none());
        assert!(parse_value("-5", now()).is_none());
        assert!(parse_value("", now()).is_none());
    }

    #[test]
    fn test_missing_header_uses_default() {
        let headers = HeaderMap::new();
        assert_eq!(retry_at(&headers, now()), now() + Duration::minutes(6));
    }

    #[test]
    fn test_unparseable_header_uses_default() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("later"));
        assert_eq!(retry_at(&headers, now()), now() + Duration::minutes(6));
    }

    #[test]
    fn test_first_parseable_value_wins() {
        let mut headers = HeaderMap::new();
        headers.append(RETRY_AFTER, HeaderValue::from_static("garbage"));
        headers.append(RETRY_AFTER, HeaderValue::from_static("30"));
        headers.append(RETRY_AFTER, HeaderValue::from_static("90"));
        assert_eq!(retry_at(&headers, now()), now() + Duration::seconds(30));
    }
}
