//! Payload decoder
//!
//! Overview
//! --------
//! Turns a raw message payload into a [`WorkItem`]. The structured form is a
//! JSON object `{"sleepTime": <u64>, "message": <string|null>}`; missing
//! fields take their defaults and unknown fields are rejected. When the
//! structured parse fails, the whole payload is read as a bare integer
//! number of seconds. Anything else is a `ConsumerError::Decode`.
//!
//! Decoding is pure and deterministic for a given input.

use bytes::Bytes;
use serde::Deserialize;

use crate::errors::ConsumerError;

/// Decoded unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkItem {
    pub sleep_seconds: u64,
    /// Non-empty means the work must fail with this text as the cause.
    pub failure_message: String,
}

impl WorkItem {
    pub fn new(sleep_seconds: u64, failure_message: impl Into<String>) -> Self {
        Self {
            sleep_seconds,
            failure_message: failure_message.into(),
        }
    }

    pub fn failure(&self) -> Option<&str> {
        (!self.failure_message.is_empty()).then_some(self.failure_message.as_str())
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WirePayload {
    #[serde(rename = "sleepTime", default)]
    sleep_time: u64,
    #[serde(default)]
    message: Option<String>,
}

impl From<WirePayload> for WorkItem {
    fn from(w: WirePayload) -> Self {
        WorkItem {
            sleep_seconds: w.sleep_time,
            failure_message: w.message.unwrap_or_default(),
        }
    }
}

pub fn decode_work_item(payload: &Bytes) -> Result<WorkItem, ConsumerError> {
    let structured = match serde_json::from_slice::<WirePayload>(payload) {
        Ok(w) => return Ok(w.into()),
        Err(e) => e,
    };

    let text = std::str::from_utf8(payload)
        .map_err(|e| ConsumerError::Decode(format!("payload is not UTF-8: {e}")))?;
    text.parse::<u64>()
        .map(|secs| WorkItem::new(secs, ""))
        .map_err(|fallback| {
            ConsumerError::Decode(format!(
                "not a work item ({structured}) nor an integer ({fallback})"
            ))
        })
}
