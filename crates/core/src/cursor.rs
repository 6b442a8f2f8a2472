//! Opaque paging cursors: base64-wrapped JSON, enough to resume a paged read
//! without any server-side state.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Forward-paging cursor: the last emitted timestamp in epoch nanoseconds.
pub fn encode_head_cursor(ts: DateTime<Utc>) -> String {
    let nanos = ts.timestamp_nanos_opt().unwrap_or(0);
    B64.encode(nanos.to_string())
}

pub fn decode_head_cursor(token: &str) -> Result<DateTime<Utc>> {
    let raw = B64
        .decode(token)
        .map_err(|e| Error::invalid(format!("bad cursor: {e}")))?;
    let nanos: i64 = std::str::from_utf8(&raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::invalid("bad cursor: not a nanosecond timestamp"))?;
    DateTime::from_timestamp(nanos.div_euclid(1_000_000_000), nanos.rem_euclid(1_000_000_000) as u32)
        .ok_or_else(|| Error::invalid("bad cursor: timestamp out of range"))
}

/// Backward-paging cursor carrying the back-scan replay state (see the
/// Kube-API fetcher): how many lines the last request asked for, the upper
/// bound of the next window, and the first timestamp of the whole log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailCursor {
    #[serde(rename = "tailLines")]
    pub tail_lines: i64,
    #[serde(rename = "windowTime")]
    pub window_time: DateTime<Utc>,
    #[serde(rename = "firstTS")]
    pub first_ts: DateTime<Utc>,
}

pub fn encode_tail_cursor(c: &TailCursor) -> Result<String> {
    let json = serde_json::to_vec(c).map_err(|e| Error::fatal(format!("cursor encode: {e}")))?;
    Ok(B64.encode(json))
}

pub fn decode_tail_cursor(token: &str) -> Result<TailCursor> {
    let raw = B64
        .decode(token)
        .map_err(|e| Error::invalid(format!("bad tail cursor: {e}")))?;
    serde_json::from_slice(&raw).map_err(|e| Error::invalid(format!("bad tail cursor: {e}")))
}

/// Continuation state for a multi-namespace list: per-namespace resource
/// versions plus the exclusive lower bound for the next page's name-sorted
/// keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiListCursor {
    #[serde(rename = "resourceVersions")]
    pub resource_versions: BTreeMap<String, String>,
    #[serde(rename = "startKey", default, skip_serializing_if = "String::is_empty")]
    pub start_key: String,
}

pub fn encode_multi_rv(resource_versions: &BTreeMap<String, String>) -> Result<String> {
    encode_multi_continue(resource_versions, "")
}

pub fn decode_multi_rv(token: &str) -> Result<BTreeMap<String, String>> {
    Ok(decode_multi_continue(token)?.resource_versions)
}

pub fn encode_multi_continue(
    resource_versions: &BTreeMap<String, String>,
    start_key: &str,
) -> Result<String> {
    let cursor = MultiListCursor {
        resource_versions: resource_versions.clone(),
        start_key: start_key.to_string(),
    };
    let json = serde_json::to_vec(&cursor).map_err(|e| Error::fatal(format!("cursor encode: {e}")))?;
    Ok(B64.encode(json))
}

pub fn decode_multi_continue(token: &str) -> Result<MultiListCursor> {
    let raw = B64
        .decode(token)
        .map_err(|e| Error::invalid(format!("bad continue token: {e}")))?;
    serde_json::from_slice(&raw).map_err(|e| Error::invalid(format!("bad continue token: {e}")))
}

/// Rebuilds a standard apiserver continue token: "continue at the key after
/// `start_key`, as of `rv`". The apiserver accepts this shape on any
/// paginated list call.
pub fn k8s_continue_token(rv: &str, start_key: &str) -> String {
    let payload = serde_json::json!({
        "v": "meta.k8s.io/v1",
        "rv": rv.parse::<i64>().unwrap_or(0),
        "start": format!("{start_key}\u{0}"),
    });
    B64.encode(payload.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn head_cursor_round_trip_keeps_nanos() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let token = encode_head_cursor(ts);
        assert_eq!(decode_head_cursor(&token).unwrap(), ts);
    }

    #[test]
    fn tail_cursor_round_trip() {
        let c = TailCursor {
            tail_lines: 150,
            window_time: Utc.timestamp_opt(1_700_000_000, 999_999_999).unwrap(),
            first_ts: Utc.timestamp_opt(1_600_000_000, 1).unwrap(),
        };
        let token = encode_tail_cursor(&c).unwrap();
        assert_eq!(decode_tail_cursor(&token).unwrap(), c);
    }

    #[test]
    fn multi_continue_round_trip() {
        let mut rvs = BTreeMap::new();
        rvs.insert("ns1".to_string(), "1001".to_string());
        rvs.insert("ns2".to_string(), "2002".to_string());
        let token = encode_multi_continue(&rvs, "pod-041").unwrap();
        let c = decode_multi_continue(&token).unwrap();
        assert_eq!(c.resource_versions, rvs);
        assert_eq!(c.start_key, "pod-041");
    }

    #[test]
    fn multi_rv_is_continue_without_start_key() {
        let mut rvs = BTreeMap::new();
        rvs.insert("ns1".to_string(), "7".to_string());
        let token = encode_multi_rv(&rvs).unwrap();
        assert_eq!(decode_multi_rv(&token).unwrap(), rvs);
        assert_eq!(decode_multi_continue(&token).unwrap().start_key, "");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_head_cursor("%%%").is_err());
        assert!(decode_tail_cursor("bm90IGpzb24=").is_err());
        assert!(decode_multi_continue("bm90IGpzb24=").is_err());
    }

    #[test]
    fn k8s_token_embeds_rv_and_key() {
        let token = k8s_continue_token("42", "pod-a");
        let raw = B64.decode(token).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(v["rv"], 42);
        assert_eq!(v["start"], "pod-a\u{0}");
    }
}
