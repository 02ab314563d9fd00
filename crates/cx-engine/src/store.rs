//! Aggregate Store
//!
//! Keyed blob persistence behind the engine. Two independent instances are
//! wired in: one holds in-progress aggregates, the other the closed-key set.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Durable state of one in-progress aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAggregate {
    pub key: String,
    /// Policy-owned accumulator; the engine never looks inside
    pub aggregate: Value,
    /// Message ids whose senders are waiting for a terminal outcome,
    /// in lock-acquisition order
    pub pending_senders: IndexSet<String>,
    /// Wall-clock deadline for the completion timeout, if one is armed
    pub deadline: Option<DateTime<Utc>>,
    pub message_count: u32,
    pub created_at: DateTime<Utc>,
}

impl StoredAggregate {
    pub fn new(key: impl Into<String>, aggregate: Value, deadline: Option<DateTime<Utc>>) -> Self {
        Self {
            key: key.into(),
            aggregate,
            pending_senders: IndexSet::new(),
            deadline,
            message_count: 0,
            created_at: Utc::now(),
        }
    }
}

/// Why a correlation key was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseCause {
    Completed,
    TimedOut,
}

/// Tombstone marking a correlation key as finalized. Never removed by
/// normal operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedKey {
    pub key: String,
    pub cause: CloseCause,
    pub closed_at: DateTime<Utc>,
}

impl ClosedKey {
    pub fn new(key: impl Into<String>, cause: CloseCause) -> Self {
        Self {
            key: key.into(),
            cause,
            closed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn load(&self, key: &str) -> anyhow::Result<Option<Value>>;
    async fn store(&self, key: &str, blob: Value) -> anyhow::Result<()>;
    async fn remove(&self, key: &str) -> anyhow::Result<()>;
}

/// In-memory store for tests and single-process deployments
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn load(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn store(&self, key: &str, blob: Value) -> anyhow::Result<()> {
        self.entries.insert(key.to_string(), blob);
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
