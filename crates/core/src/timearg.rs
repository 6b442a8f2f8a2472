//! Time argument syntax shared by the CLI and the API: an ISO-8601 duration
//! (`PT30M`) taken relative to now, or an RFC-3339 absolute timestamp with
//! up to nanosecond precision.

use chrono::{DateTime, Duration, Utc};

use crate::{Error, Result};

/// Parses `--since`/`--until` style arguments against the supplied clock.
pub fn parse_time_arg(s: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if s.starts_with('P') || s.starts_with("-P") {
        let dur = parse_iso8601_duration(s.trim_start_matches('-'))?;
        return Ok(now - dur);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::invalid(format!("bad time {s:?}: {e} (want RFC-3339 or ISO-8601 duration)")))
}

/// RFC-3339 nanosecond parser for log-line timestamp tokens. Returns `None`
/// instead of an error: callers drop unparseable lines.
pub fn parse_log_timestamp(token: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(token).ok().map(|t| t.with_timezone(&Utc))
}

/// ISO-8601 duration subset: `P[nW][nD][T[nH][nM][nS]]` with fractional
/// seconds. Years and months are rejected: they have no fixed length.
pub fn parse_iso8601_duration(s: &str) -> Result<Duration> {
    let bad = || Error::invalid(format!("bad ISO-8601 duration {s:?}"));
    let rest = s.strip_prefix('P').ok_or_else(bad)?;
    if rest.is_empty() {
        return Err(bad());
    }

    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) if !t.is_empty() => (d, Some(t)),
        Some(_) => return Err(bad()),
        None => (rest, None),
    };

    let mut total = Duration::zero();
    let mut eat = |part: &str, units: &[(char, i64)]| -> Result<()> {
        let mut num = String::new();
        for ch in part.chars() {
            if ch.is_ascii_digit() || ch == '.' {
                num.push(ch);
                continue;
            }
            let scale = units
                .iter()
                .find(|(u, _)| *u == ch.to_ascii_uppercase())
                .map(|(_, s)| *s)
                .ok_or_else(bad)?;
            let value: f64 = num.parse().map_err(|_| bad())?;
            num.clear();
            total = total
                + Duration::nanoseconds((value * scale as f64 * 1e9).round() as i64);
        }
        if num.is_empty() { Ok(()) } else { Err(bad()) }
    };

    eat(date_part, &[('W', 7 * 86_400), ('D', 86_400)])?;
    if let Some(t) = time_part {
        eat(t, &[('H', 3_600), ('M', 60), ('S', 1)])?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn durations() {
        assert_eq!(parse_iso8601_duration("PT30M").unwrap(), Duration::minutes(30));
        assert_eq!(parse_iso8601_duration("PT1H30M").unwrap(), Duration::minutes(90));
        assert_eq!(parse_iso8601_duration("P2D").unwrap(), Duration::days(2));
        assert_eq!(parse_iso8601_duration("P1W").unwrap(), Duration::days(7));
        assert_eq!(parse_iso8601_duration("P1DT12H").unwrap(), Duration::hours(36));
        assert_eq!(
            parse_iso8601_duration("PT0.5S").unwrap(),
            Duration::milliseconds(500)
        );
    }

    #[test]
    fn duration_rejects_months_and_garbage() {
        assert!(parse_iso8601_duration("P1M").is_err());
        assert!(parse_iso8601_duration("P").is_err());
        assert!(parse_iso8601_duration("PT").is_err());
        assert!(parse_iso8601_duration("30M").is_err());
        assert!(parse_iso8601_duration("PT5").is_err());
    }

    #[test]
    fn time_arg_duration_is_relative_to_now() {
        let t = parse_time_arg("PT30M", now()).unwrap();
        assert_eq!(now() - t, Duration::minutes(30));
    }

    #[test]
    fn time_arg_absolute() {
        let t = parse_time_arg("2023-11-14T22:13:20.000000123Z", now()).unwrap();
        assert_eq!(t.timestamp(), 1_700_000_000);
        assert_eq!(t.timestamp_subsec_nanos(), 123);
    }

    #[test]
    fn log_timestamp_token() {
        let t = parse_log_timestamp("2023-11-14T22:13:20.123456789Z").unwrap();
        assert_eq!(t.timestamp_subsec_nanos(), 123_456_789);
        assert!(parse_log_timestamp("not-a-time").is_none());
    }
}
