use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header carrying the correlation key. Stamped on every aggregated result
/// before it is forwarded downstream, so hosts can route delivery reports
/// back to the right aggregation.
pub const CORRELATION_KEY_HEADER: &str = "x-conflux-correlation-key";

// ============================================================================
// Core Message Types
// ============================================================================

/// The core message structure that flows through the system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub headers: HashMap<String, String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            headers: HashMap::new(),
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Correlation key from the standard header, if present
    pub fn correlation_key(&self) -> Option<&str> {
        self.header(CORRELATION_KEY_HEADER)
    }
}

/// A message bundled with the channel its sender is waiting on
#[derive(Debug)]
pub struct InboundMessage {
    pub message: Message,
    pub ack_tx: tokio::sync::oneshot::Sender<SenderOutcome>,
}

impl InboundMessage {
    /// Wraps a message with a fresh ack channel. The returned receiver
    /// resolves when the engine decides this sender's fate.
    pub fn new(message: Message) -> (Self, tokio::sync::oneshot::Receiver<SenderOutcome>) {
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        (Self { message, ack_tx }, ack_rx)
    }
}

// ============================================================================
// Outcome Types
// ============================================================================

/// Resolution sent back to a waiting sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderOutcome {
    /// Message was absorbed (or silently discarded) without incident
    Done,
    /// Message arrived for an already-closed correlation key
    RejectedClosed,
    /// The aggregation this message joined timed out before completing
    TimedOut,
    /// Downstream delivery (or the engine itself) failed
    Fault(String),
}

/// Result of forwarding an aggregated message downstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownstreamOutcome {
    Delivered,
    Fault(String),
}
