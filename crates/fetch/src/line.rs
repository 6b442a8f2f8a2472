use chrono::{DateTime, Utc};
use tracing::debug;

use kubetail_core::timearg::parse_log_timestamp;
use kubetail_core::{LogRecord, LogSource};

/// Sentinel emitted by the mock cluster; only honored under `test_hooks`.
const FAKE_LOGS_SENTINEL: &str = "fake logs";

/// Parses one `timestamps=true` log line into a record: the first
/// whitespace-delimited token is the RFC-3339 nanosecond timestamp, the rest
/// is the message. Unparseable lines are dropped.
pub fn parse_line(
    line: &str,
    source: &LogSource,
    test_hooks: bool,
    now: DateTime<Utc>,
) -> Option<LogRecord> {
    if test_hooks && line == FAKE_LOGS_SENTINEL {
        return Some(LogRecord {
            timestamp: now,
            message: line.to_string(),
            source: source.clone(),
            approximate: true,
        });
    }
    let (token, rest) = match line.split_once(' ') {
        Some((t, r)) => (t, r),
        None => (line, ""),
    };
    match parse_log_timestamp(token) {
        Some(ts) => Some(LogRecord {
            timestamp: ts,
            message: rest.to_string(),
            source: source.clone(),
            approximate: false,
        }),
        None => {
            let prefix: String = line.chars().take(40).collect();
            debug!(source = %source, line_prefix = %prefix, "dropping line without parseable timestamp");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubetail_core::SourceMeta;

    fn src() -> LogSource {
        LogSource {
            namespace: "default".into(),
            pod_name: "web".into(),
            container_name: "nginx".into(),
            container_id: "docker://abc".into(),
            meta: SourceMeta::default(),
        }
    }

    #[test]
    fn parses_timestamped_line() {
        let r = parse_line(
            "2023-11-14T22:13:20.123456789Z GET /healthz 200",
            &src(),
            false,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(r.message, "GET /healthz 200");
        assert_eq!(r.timestamp.timestamp_subsec_nanos(), 123_456_789);
        assert!(!r.approximate);
    }

    #[test]
    fn drops_unparseable_line() {
        assert!(parse_line("no timestamp here", &src(), false, Utc::now()).is_none());
    }

    #[test]
    fn sentinel_requires_test_hooks() {
        assert!(parse_line("fake logs", &src(), false, Utc::now()).is_none());
        let now = Utc::now();
        let r = parse_line("fake logs", &src(), true, now).unwrap();
        assert_eq!(r.timestamp, now);
        assert!(r.approximate);
    }

    #[test]
    fn timestamp_only_line_has_empty_message() {
        let r = parse_line("2023-11-14T22:13:20Z", &src(), false, Utc::now()).unwrap();
        assert_eq!(r.message, "");
    }
}
