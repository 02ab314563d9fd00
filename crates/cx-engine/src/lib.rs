//! Conflux Aggregation Engine
//!
//! This crate provides correlation-based message aggregation with:
//! - AggregationEngine: per-key orchestration of merge, completion, and timeout
//! - AggregationPolicy: pluggable correlation/merge/completion strategy
//! - AggregateStore: keyed blob persistence for live aggregates and closed keys
//! - LockManager: per-key mutual exclusion between arrivals and timeouts
//! - TimerService: one-shot timeout callbacks carrying their own handle
//! - Downstream: delivery contract for finalized results

pub mod config;
pub mod downstream;
pub mod engine;
pub mod error;
pub mod lock;
pub mod policy;
pub mod store;
pub mod timer;

pub use config::EngineConfig;
pub use downstream::{ChannelDownstream, Downstream};
pub use engine::{AggregationEngine, EngineStats};
pub use error::EngineError;
pub use lock::{KeyLock, KeyLockManager, LockManager};
pub use policy::{AggregationPolicy, CountPolicy};
pub use store::{AggregateStore, CloseCause, ClosedKey, MemoryStore, StoredAggregate};
pub use timer::{TimerCallback, TimerHandle, TimerService, TokioTimerService};

pub use error::Result;
