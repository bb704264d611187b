//! Log Event Data Structure
//!
//! This module defines `LogEvent` - the fundamental unit of data in Loghouse.
//!
//! ## Structure
//! Each event contains:
//! - **ts**: caller-supplied timestamp in milliseconds since epoch (may be 0)
//! - **msg**: the log line payload (arbitrary bytes)
//! - **fields**: optional key/value pairs attached by the producer
//!
//! ## Design Decisions
//! - Uses `bytes::Bytes` for the payload so events can be sliced and cloned
//!   without copying
//! - Fields are a plain sorted vector: events carry few fields and a vector
//!   keeps the codec simple and the ordering deterministic
//! - `ts` is i64 to match wire formats that allow pre-epoch timestamps

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single record in a journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Timestamp in milliseconds since epoch. Caller-supplied, may be 0.
    pub ts: i64,

    /// The log message payload.
    pub msg: Bytes,

    /// Optional key/value fields, sorted by key.
    pub fields: Vec<(String, String)>,
}

impl LogEvent {
    pub fn new(ts: i64, msg: impl Into<Bytes>) -> Self {
        Self {
            ts,
            msg: msg.into(),
            fields: Vec::new(),
        }
    }

    /// Attaches fields, normalizing them to sorted-by-key order.
    pub fn with_fields(mut self, mut fields: Vec<(String, String)>) -> Self {
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        self.fields = fields;
        self
    }

    /// Looks up a field value by key.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Estimate the size of this event in bytes.
    pub fn estimated_size(&self) -> usize {
        8 + self.msg.len()
            + self
                .fields
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        let ev = LogEvent::new(1_700_000_000_000, "hello");
        assert_eq!(ev.ts, 1_700_000_000_000);
        assert_eq!(ev.msg, Bytes::from("hello"));
        assert!(ev.fields.is_empty());
    }

    #[test]
    fn test_zero_timestamp_allowed() {
        let ev = LogEvent::new(0, Bytes::new());
        assert_eq!(ev.ts, 0);
        assert!(ev.msg.is_empty());
    }

    #[test]
    fn test_with_fields_sorts() {
        let ev = LogEvent::new(1, "m").with_fields(vec![
            ("pod".to_string(), "p1".to_string()),
            ("app".to_string(), "a1".to_string()),
        ]);
        assert_eq!(ev.fields[0].0, "app");
        assert_eq!(ev.fields[1].0, "pod");
    }

    #[test]
    fn test_field_lookup() {
        let ev = LogEvent::new(1, "m")
            .with_fields(vec![("level".to_string(), "warn".to_string())]);
        assert_eq!(ev.field("level"), Some("warn"));
        assert_eq!(ev.field("missing"), None);
    }

    #[test]
    fn test_estimated_size() {
        let ev = LogEvent::new(0, "12345");
        // 8 (ts) + 5 (msg) = 13
        assert_eq!(ev.estimated_size(), 13);

        let ev = ev.with_fields(vec![("ab".to_string(), "cde".to_string())]);
        assert_eq!(ev.estimated_size(), 18);
    }

    #[test]
    fn test_serde_roundtrip() {
        let ev = LogEvent::new(42, "payload")
            .with_fields(vec![("k".to_string(), "v".to_string())]);
        let json = serde_json::to_string(&ev).expect("serialize");
        let back: LogEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(ev, back);
    }
}
