//! Aggregation Policy
//!
//! The pluggable strategy deciding how messages correlate, how they merge
//! into an aggregate, and when the aggregate is complete. Policies are pure
//! with respect to engine state: they see the aggregate blob and the
//! message in hand, nothing else.

use chrono::{DateTime, Utc};
use cx_common::Message;
use serde_json::{json, Value};
use std::time::Duration;

pub trait AggregationPolicy: Send + Sync {
    /// Correlation key for a message. `None` (or an empty string) means the
    /// message cannot be aggregated and is rejected back to the caller.
    fn correlation_id(&self, message: &Message) -> anyhow::Result<Option<String>>;

    /// The empty aggregate a new key starts from.
    fn create_aggregate(&self, key: &str) -> anyhow::Result<Value>;

    /// Merges a message into the aggregate. Returns true once the aggregate
    /// is complete and ready to forward.
    fn add_message(&self, aggregate: &mut Value, message: &Message) -> anyhow::Result<bool>;

    /// Builds the message forwarded downstream. `timed_out` marks results
    /// finalized by the completion timeout rather than the predicate.
    fn build_result(&self, key: &str, aggregate: &Value, timed_out: bool)
        -> anyhow::Result<Message>;

    /// Wall-clock moment to stop waiting for more messages, evaluated
    /// against the current aggregate. `None` disables the timeout.
    fn timeout_at(&self, aggregate: &Value) -> Option<DateTime<Utc>>;
}

/// Completes after a fixed number of messages, collecting payloads in
/// merge order
pub struct CountPolicy {
    expected: usize,
    window: Option<Duration>,
}

impl CountPolicy {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            window: None,
        }
    }

    /// Adds a completion timeout, counted from the moment the deadline is
    /// (re)computed.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }
}

impl AggregationPolicy for CountPolicy {
    fn correlation_id(&self, message: &Message) -> anyhow::Result<Option<String>> {
        Ok(message.correlation_key().map(str::to_string))
    }

    fn create_aggregate(&self, _key: &str) -> anyhow::Result<Value> {
        Ok(json!({ "parts": [] }))
    }

    fn add_message(&self, aggregate: &mut Value, message: &Message) -> anyhow::Result<bool> {
        let parts = aggregate
            .get_mut("parts")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| anyhow::anyhow!("aggregate has no 'parts' array"))?;
        parts.push(message.payload.clone());
        Ok(parts.len() >= self.expected)
    }

    fn build_result(
        &self,
        key: &str,
        aggregate: &Value,
        timed_out: bool,
    ) -> anyhow::Result<Message> {
        let parts = aggregate
            .get("parts")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow::anyhow!("aggregate has no 'parts' array"))?;
        Ok(Message::new(json!({
            "key": key,
            "parts": parts,
            "count": parts.len(),
            "timed_out": timed_out,
        })))
    }

    fn timeout_at(&self, _aggregate: &Value) -> Option<DateTime<Utc>> {
        let window = self.window?;
        let delta = chrono::Duration::from_std(window).ok()?;
        Some(Utc::now() + delta)
    }
}
