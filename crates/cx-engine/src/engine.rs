//! AggregationEngine - Central orchestrator for correlation-based aggregation
//!
//! Collects independently-arriving messages that share a correlation key
//! into one combined result:
//! - Per-key critical sections via the lock manager; different keys run in parallel
//! - Aggregate state loaded from and persisted to the store between arrivals
//! - Completion detected by the policy, or forced by a scheduled timeout
//! - Exactly one finalized result forwarded downstream per key, guarded by
//!   the closed-key tombstone plus the timer-handle identity check
//! - Optional error reporting that holds every contributor's ack until the
//!   aggregation reaches a terminal outcome

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use cx_common::{DownstreamOutcome, InboundMessage, Message, SenderOutcome, CORRELATION_KEY_HEADER};

use crate::config::EngineConfig;
use crate::downstream::Downstream;
use crate::error::EngineError;
use crate::lock::LockManager;
use crate::policy::AggregationPolicy;
use crate::store::{AggregateStore, CloseCause, ClosedKey, StoredAggregate};
use crate::timer::{TimerHandle, TimerService};
use crate::Result;

/// Central orchestrator for correlation-based aggregation.
///
/// Cheap to clone; all clones share the same state. Timer callbacks and
/// spawned forwards each hold their own clone.
#[derive(Clone)]
pub struct AggregationEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,

    /// Domain logic: correlation, merge, completion, result building
    policy: Arc<dyn AggregationPolicy>,

    /// In-progress aggregates by correlation key
    store: Arc<dyn AggregateStore>,

    /// Tombstones for finalized keys, kept separately from live state
    closed_keys: Arc<dyn AggregateStore>,

    /// Per-key mutual exclusion
    locks: Arc<dyn LockManager>,

    /// Completion timeout scheduling
    timers: Arc<dyn TimerService>,

    /// Destination for finalized results
    downstream: Arc<dyn Downstream>,

    /// Currently registered timer handle per key. A firing callback is
    /// honored only if its handle is still the one in this map.
    armed_timers: DashMap<String, TimerHandle>,

    /// Deferred ack channels by message id (error-reporting mode)
    waiting_acks: DashMap<String, oneshot::Sender<SenderOutcome>>,

    /// Sender ids per key whose outcome arrives with the downstream verdict
    awaiting_downstream: DashMap<String, Vec<String>>,
}

impl AggregationEngine {
    pub fn new(
        config: EngineConfig,
        policy: Arc<dyn AggregationPolicy>,
        store: Arc<dyn AggregateStore>,
        closed_keys: Arc<dyn AggregateStore>,
        locks: Arc<dyn LockManager>,
        timers: Arc<dyn TimerService>,
        downstream: Arc<dyn Downstream>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                policy,
                store,
                closed_keys,
                locks,
                timers,
                downstream,
                armed_timers: DashMap::new(),
                waiting_acks: DashMap::new(),
                awaiting_downstream: DashMap::new(),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Handle one inbound message.
    ///
    /// Returns an error for messages without a usable correlation key and
    /// propagates policy failures; everything else is resolved into the
    /// sender's ack channel.
    pub async fn on_message(&self, inbound: InboundMessage) -> Result<()> {
        let InboundMessage { message, ack_tx } = inbound;

        let key = match self
            .inner
            .policy
            .correlation_id(&message)
            .map_err(|e| EngineError::correlation(&message.id, e))?
        {
            Some(key) if !key.is_empty() => key,
            _ => return Err(EngineError::invalid_correlation(&message.id)),
        };

        debug!(key = %key, message_id = %message.id, "Handling inbound message");
        let guard = self.inner.locks.acquire(&key).await;
        // Errors below unwind through `?`; dropping the guard releases the key

        // Phase 1: load the current aggregate, or decide what a missing one means
        let mut entry = match self.inner.load_entry(&key).await? {
            Some(mut entry) => {
                if self.inner.config.reschedule_timeouts {
                    entry.deadline = self.inner.policy.timeout_at(&entry.aggregate);
                }
                entry
            }
            None => {
                if self.inner.is_closed(&key).await? {
                    // Late arrival for a correlation that already finalized
                    debug!(key = %key, message_id = %message.id, "Message for closed key");
                    counter!("conflux_closed_key_arrivals").increment(1);
                    let outcome = if self.inner.config.report_closed_as_errors {
                        SenderOutcome::RejectedClosed
                    } else {
                        SenderOutcome::Done
                    };
                    let _ = ack_tx.send(outcome);
                    drop(guard);
                    self.inner.locks.remove(&key);
                    return Ok(());
                }

                let aggregate = self
                    .inner
                    .policy
                    .create_aggregate(&key)
                    .map_err(|e| EngineError::policy(&key, e))?;
                let deadline = self.inner.policy.timeout_at(&aggregate);
                StoredAggregate::new(key.clone(), aggregate, deadline)
            }
        };

        // Phase 2: with error reporting on, this sender's ack is deferred
        // until the aggregation reaches a terminal outcome
        let mut ack = Some(ack_tx);
        if self.inner.config.report_errors {
            entry.pending_senders.insert(message.id.clone());
            if let Some(tx) = ack.take() {
                self.inner.waiting_acks.insert(message.id.clone(), tx);
            }
        }

        // Phase 3: merge
        let complete = match self.inner.policy.add_message(&mut entry.aggregate, &message) {
            Ok(complete) => complete,
            Err(e) => {
                // Nothing was persisted this round; the sender learns of the
                // failure through the propagated error, not a deferred ack
                self.inner.waiting_acks.remove(&message.id);
                return Err(EngineError::policy(&key, e));
            }
        };
        entry.message_count += 1;
        counter!("conflux_messages_merged").increment(1);

        // Phase 4: finalize, or persist the still-open aggregate
        if complete {
            if let Err(e) = self.finalize(&key, entry, false).await {
                self.inner.waiting_acks.remove(&message.id);
                return Err(e);
            }
            if let Some(tx) = ack {
                let _ = tx.send(SenderOutcome::Done);
            }
            drop(guard);
            self.inner.locks.remove(&key);
        } else {
            if let Err(e) = self.persist_open(&key, entry).await {
                self.inner.waiting_acks.remove(&message.id);
                return Err(e);
            }
            if let Some(tx) = ack {
                let _ = tx.send(SenderOutcome::Done);
            }
        }

        Ok(())
    }

    /// Handle a timeout callback from the timer service.
    ///
    /// `fired` is the handle the callback was scheduled under. A callback
    /// whose handle is no longer the registered one was superseded by a
    /// finalize or a reschedule and has no effect.
    pub async fn on_timeout(&self, key: &str, fired: TimerHandle) -> Result<()> {
        let guard = self.inner.locks.acquire(key).await;

        let current = self.inner.armed_timers.get(key).map(|entry| *entry.value());
        if current != Some(fired) {
            debug!(key = %key, handle = %fired, "Ignoring stale timeout callback");
            counter!("conflux_stale_timers_ignored").increment(1);
            return Ok(());
        }
        self.inner.armed_timers.remove(key);

        match self.inner.load_entry(key).await? {
            Some(entry) => {
                if self.inner.config.report_timeout_as_errors {
                    let pending: Vec<String> = entry.pending_senders.iter().cloned().collect();
                    info!(
                        key = %key,
                        senders = pending.len(),
                        "Aggregation timed out; notifying senders"
                    );
                    self.inner.resolve_senders(pending, SenderOutcome::TimedOut);
                    self.inner.write_tombstone(key, CloseCause::TimedOut).await?;
                    self.inner
                        .store
                        .remove(key)
                        .await
                        .map_err(|e| EngineError::store(key, "remove", e))?;
                    counter!("conflux_aggregates_timed_out").increment(1);
                } else {
                    self.finalize(key, entry, true).await?;
                }
                drop(guard);
                self.inner.locks.remove(key);
            }
            None => {
                if self.inner.is_closed(key).await? {
                    // The acquire above re-created a lock entry for a key
                    // that is already finished; take it back out
                    debug!(key = %key, "Timeout fired for an already-closed key");
                    drop(guard);
                    self.inner.locks.remove(key);
                } else {
                    error!(key = %key, "Aggregate missing without a closed-key record");
                }
            }
        }

        Ok(())
    }

    /// Feed the downstream verdict for a forwarded result back into the
    /// engine (error-reporting mode). The key is the correlation header
    /// stamped on the result. With no senders registered this is a no-op,
    /// so hosts may call it unconditionally.
    pub fn on_downstream_outcome(&self, key: &str, outcome: DownstreamOutcome) {
        let pending = match self.inner.awaiting_downstream.remove(key) {
            Some((_, pending)) => pending,
            None => {
                debug!(key = %key, "No senders awaiting a downstream outcome");
                return;
            }
        };

        debug!(
            key = %key,
            senders = pending.len(),
            "Resolving senders with downstream outcome"
        );
        self.inner
            .resolve_senders(pending, EngineInner::sender_outcome(&outcome));
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            armed_timers: self.inner.armed_timers.len(),
            waiting_acks: self.inner.waiting_acks.len(),
            keys_awaiting_downstream: self.inner.awaiting_downstream.len(),
        }
    }

    /// Produce the result, forward it, tombstone the key, and drop its state.
    /// Caller holds the key lock and releases the lock resource afterwards.
    async fn finalize(&self, key: &str, entry: StoredAggregate, timed_out: bool) -> Result<()> {
        let mut result = self
            .inner
            .policy
            .build_result(key, &entry.aggregate, timed_out)
            .map_err(|e| EngineError::policy(key, e))?;
        result
            .headers
            .insert(CORRELATION_KEY_HEADER.to_string(), key.to_string());

        let pending: Vec<String> = entry.pending_senders.iter().cloned().collect();

        // The forward goes out (or is launched) before the tombstone is
        // written; the downstream verdict never blocks closing the key.
        let sync_outcome = if self.inner.config.synchronous_forward {
            Some(self.inner.forward_now(key, result).await)
        } else {
            if self.inner.config.report_errors {
                self.inner
                    .awaiting_downstream
                    .insert(key.to_string(), pending.clone());
            }
            self.spawn_forward(key.to_string(), result);
            None
        };

        let cause = if timed_out {
            CloseCause::TimedOut
        } else {
            CloseCause::Completed
        };
        self.inner.write_tombstone(key, cause).await?;
        self.inner
            .store
            .remove(key)
            .await
            .map_err(|e| EngineError::store(key, "remove", e))?;
        self.inner.armed_timers.remove(key);

        if timed_out {
            counter!("conflux_aggregates_timed_out").increment(1);
        } else {
            counter!("conflux_aggregates_completed").increment(1);
        }
        info!(
            key = %key,
            messages = entry.message_count,
            timed_out = timed_out,
            "Aggregate finalized"
        );

        if let Some(outcome) = sync_outcome {
            if self.inner.config.report_errors {
                self.inner
                    .resolve_senders(pending, EngineInner::sender_outcome(&outcome));
            } else if let DownstreamOutcome::Fault(reason) = outcome {
                // Deliberate fire-and-forget: without error reporting there
                // is nobody left to hand the failure to
                warn!(key = %key, reason = %reason, "Dropping downstream failure");
            }
        }

        Ok(())
    }

    fn spawn_forward(&self, key: String, result: Message) {
        let engine = self.clone();
        tokio::spawn(async move {
            let outcome = engine.inner.forward_now(&key, result).await;
            if engine.inner.config.report_errors {
                engine.on_downstream_outcome(&key, outcome);
            }
        });
    }

    /// Persist a not-yet-complete aggregate and keep its timeout armed.
    async fn persist_open(&self, key: &str, entry: StoredAggregate) -> Result<()> {
        let deadline = entry.deadline;
        self.inner.persist_entry(key, &entry).await?;

        match deadline {
            Some(deadline) => {
                if self.inner.config.reschedule_timeouts
                    || !self.inner.armed_timers.contains_key(key)
                {
                    self.arm_timer(key, deadline);
                }
            }
            None => {
                if self.inner.config.reschedule_timeouts {
                    // Window recomputed to nothing; disarm so an already
                    // scheduled firing reads as stale
                    self.inner.armed_timers.remove(key);
                }
            }
        }

        Ok(())
    }

    /// Schedule a timeout and register its handle as the current one for
    /// the key. Any previously registered handle is superseded, not
    /// cancelled; its firing fails the identity check in `on_timeout`.
    fn arm_timer(&self, key: &str, deadline: DateTime<Utc>) {
        let engine = self.clone();
        let timer_key = key.to_string();
        let handle = self.inner.timers.schedule(
            deadline,
            Box::new(move |fired| {
                Box::pin(async move {
                    if let Err(e) = engine.on_timeout(&timer_key, fired).await {
                        error!(key = %timer_key, error = %e, "Timeout handling failed");
                    }
                })
            }),
        );
        self.inner.armed_timers.insert(key.to_string(), handle);
        debug!(key = %key, handle = %handle, deadline = %deadline, "Timeout armed");
    }
}

impl EngineInner {
    async fn forward_now(&self, key: &str, result: Message) -> DownstreamOutcome {
        match self.downstream.forward(result).await {
            Ok(()) => DownstreamOutcome::Delivered,
            Err(e) => {
                counter!("conflux_forward_failures").increment(1);
                warn!(key = %key, error = %e, "Downstream forward failed");
                DownstreamOutcome::Fault(e.to_string())
            }
        }
    }

    fn resolve_senders(&self, ids: Vec<String>, outcome: SenderOutcome) {
        for id in ids {
            if let Some((_, tx)) = self.waiting_acks.remove(&id) {
                let _ = tx.send(outcome.clone());
            }
        }
    }

    fn sender_outcome(outcome: &DownstreamOutcome) -> SenderOutcome {
        match outcome {
            DownstreamOutcome::Delivered => SenderOutcome::Done,
            DownstreamOutcome::Fault(reason) => SenderOutcome::Fault(reason.clone()),
        }
    }

    async fn load_entry(&self, key: &str) -> Result<Option<StoredAggregate>> {
        let blob = self
            .store
            .load(key)
            .await
            .map_err(|e| EngineError::store(key, "load", e))?;
        match blob {
            Some(blob) => {
                let entry = serde_json::from_value(blob)
                    .map_err(|e| EngineError::store(key, "load", e.into()))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn persist_entry(&self, key: &str, entry: &StoredAggregate) -> Result<()> {
        let blob = serde_json::to_value(entry)
            .map_err(|e| EngineError::store(key, "store", e.into()))?;
        self.store
            .store(key, blob)
            .await
            .map_err(|e| EngineError::store(key, "store", e))
    }

    async fn is_closed(&self, key: &str) -> Result<bool> {
        let record = self
            .closed_keys
            .load(key)
            .await
            .map_err(|e| EngineError::store(key, "load", e))?;
        Ok(record.is_some())
    }

    async fn write_tombstone(&self, key: &str, cause: CloseCause) -> Result<()> {
        let record = ClosedKey::new(key, cause);
        let blob = serde_json::to_value(&record)
            .map_err(|e| EngineError::store(key, "store", e.into()))?;
        self.closed_keys
            .store(key, blob)
            .await
            .map_err(|e| EngineError::store(key, "store", e))
    }
}

/// Point-in-time view of the engine's in-process registries
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Keys with a live timeout registered
    pub armed_timers: usize,
    /// Senders whose acks are deferred until their aggregation resolves
    pub waiting_acks: usize,
    /// Keys forwarded asynchronously, awaiting the downstream verdict
    pub keys_awaiting_downstream: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::KeyLockManager;
    use crate::policy::CountPolicy;
    use crate::store::MemoryStore;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Timer service that records schedules without ever firing them.
    /// Tests drive `on_timeout` by hand with the captured handles.
    #[derive(Default)]
    struct ManualTimerService {
        scheduled: Mutex<Vec<(DateTime<Utc>, TimerHandle)>>,
    }

    impl ManualTimerService {
        fn new() -> Self {
            Self::default()
        }

        fn scheduled_count(&self) -> usize {
            self.scheduled.lock().len()
        }

        fn last_handle(&self) -> Option<TimerHandle> {
            self.scheduled.lock().last().map(|(_, handle)| *handle)
        }
    }

    impl TimerService for ManualTimerService {
        fn schedule(
            &self,
            deadline: DateTime<Utc>,
            _callback: crate::timer::TimerCallback,
        ) -> TimerHandle {
            let handle = TimerHandle::new();
            self.scheduled.lock().push((deadline, handle));
            handle
        }
    }

    /// Downstream that counts forwards and optionally fails them
    struct RecordingDownstream {
        forwards: AtomicUsize,
        received: Mutex<Vec<Message>>,
        fail: bool,
    }

    impl RecordingDownstream {
        fn new() -> Self {
            Self {
                forwards: AtomicUsize::new(0),
                received: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        fn forward_count(&self) -> usize {
            self.forwards.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Downstream for RecordingDownstream {
        async fn forward(&self, result: Message) -> anyhow::Result<()> {
            self.forwards.fetch_add(1, Ordering::SeqCst);
            self.received.lock().push(result);
            if self.fail {
                Err(anyhow::anyhow!("simulated downstream failure"))
            } else {
                Ok(())
            }
        }
    }

    struct TestHarness {
        engine: AggregationEngine,
        store: Arc<MemoryStore>,
        closed: Arc<MemoryStore>,
        timers: Arc<ManualTimerService>,
        downstream: Arc<RecordingDownstream>,
    }

    fn build_engine(
        config: EngineConfig,
        policy: CountPolicy,
        downstream: RecordingDownstream,
    ) -> TestHarness {
        let store = Arc::new(MemoryStore::new());
        let closed = Arc::new(MemoryStore::new());
        let timers = Arc::new(ManualTimerService::new());
        let downstream = Arc::new(downstream);
        let engine = AggregationEngine::new(
            config,
            Arc::new(policy),
            store.clone(),
            closed.clone(),
            Arc::new(KeyLockManager::new()),
            timers.clone(),
            downstream.clone(),
        )
        .unwrap();
        TestHarness {
            engine,
            store,
            closed,
            timers,
            downstream,
        }
    }

    fn keyed_message(key: &str, payload: serde_json::Value) -> Message {
        Message::new(payload).with_header(CORRELATION_KEY_HEADER, key)
    }

    async fn send(engine: &AggregationEngine, message: Message) -> SenderOutcome {
        let (inbound, ack_rx) = InboundMessage::new(message);
        engine.on_message(inbound).await.unwrap();
        ack_rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_message_without_key_is_rejected() {
        let harness = build_engine(
            EngineConfig::default(),
            CountPolicy::new(2),
            RecordingDownstream::new(),
        );
        let (inbound, _ack_rx) = InboundMessage::new(Message::new(json!("a")));

        let err = harness.engine.on_message(inbound).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidCorrelation { .. }));
    }

    #[tokio::test]
    async fn test_partial_aggregate_is_persisted_between_arrivals() {
        let harness = build_engine(
            EngineConfig::default(),
            CountPolicy::new(3),
            RecordingDownstream::new(),
        );

        let outcome = send(&harness.engine, keyed_message("k1", json!("a"))).await;
        assert_eq!(outcome, SenderOutcome::Done);
        assert_eq!(harness.store.len(), 1);
        assert_eq!(harness.downstream.forward_count(), 0);
    }

    #[tokio::test]
    async fn test_completion_forwards_once_and_tombstones() {
        let harness = build_engine(
            EngineConfig {
                synchronous_forward: true,
                ..Default::default()
            },
            CountPolicy::new(2),
            RecordingDownstream::new(),
        );

        send(&harness.engine, keyed_message("k1", json!("a"))).await;
        send(&harness.engine, keyed_message("k1", json!("b"))).await;

        assert_eq!(harness.downstream.forward_count(), 1);
        assert!(harness.store.is_empty());
        assert_eq!(harness.closed.len(), 1);

        let result = harness.downstream.received.lock()[0].clone();
        assert_eq!(result.header(CORRELATION_KEY_HEADER), Some("k1"));
        assert_eq!(result.payload["parts"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_closed_key_acknowledges_without_new_aggregate() {
        let harness = build_engine(
            EngineConfig {
                synchronous_forward: true,
                ..Default::default()
            },
            CountPolicy::new(1),
            RecordingDownstream::new(),
        );

        send(&harness.engine, keyed_message("k1", json!("a"))).await;
        let late = send(&harness.engine, keyed_message("k1", json!("b"))).await;

        assert_eq!(late, SenderOutcome::Done);
        assert!(harness.store.is_empty());
        assert_eq!(harness.downstream.forward_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_key_reports_error_when_configured() {
        let harness = build_engine(
            EngineConfig {
                synchronous_forward: true,
                report_closed_as_errors: true,
                ..Default::default()
            },
            CountPolicy::new(1),
            RecordingDownstream::new(),
        );

        send(&harness.engine, keyed_message("k1", json!("a"))).await;
        let late = send(&harness.engine, keyed_message("k1", json!("b"))).await;
        assert_eq!(late, SenderOutcome::RejectedClosed);
    }

    #[tokio::test]
    async fn test_stale_timer_handle_has_no_effect() {
        let harness = build_engine(
            EngineConfig {
                synchronous_forward: true,
                ..Default::default()
            },
            CountPolicy::new(2).with_window(std::time::Duration::from_secs(60)),
            RecordingDownstream::new(),
        );

        send(&harness.engine, keyed_message("k1", json!("a"))).await;
        let armed = harness.timers.last_handle().unwrap();

        // Completion supersedes the armed timer
        send(&harness.engine, keyed_message("k1", json!("b"))).await;
        assert_eq!(harness.downstream.forward_count(), 1);

        harness.engine.on_timeout("k1", armed).await.unwrap();
        assert_eq!(harness.downstream.forward_count(), 1);
        assert_eq!(harness.closed.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_finalizes_partial_aggregate() {
        let harness = build_engine(
            EngineConfig {
                synchronous_forward: true,
                ..Default::default()
            },
            CountPolicy::new(3).with_window(std::time::Duration::from_millis(100)),
            RecordingDownstream::new(),
        );

        send(&harness.engine, keyed_message("k1", json!("a"))).await;
        let handle = harness.timers.last_handle().unwrap();

        harness.engine.on_timeout("k1", handle).await.unwrap();

        assert_eq!(harness.downstream.forward_count(), 1);
        let result = harness.downstream.received.lock()[0].clone();
        assert_eq!(result.payload["timed_out"], json!(true));
        assert_eq!(result.payload["count"], json!(1));
        assert!(harness.store.is_empty());
        assert_eq!(harness.closed.len(), 1);
    }

    #[tokio::test]
    async fn test_downstream_outcome_without_waiters_is_noop() {
        let harness = build_engine(
            EngineConfig::default(),
            CountPolicy::new(2),
            RecordingDownstream::new(),
        );
        harness
            .engine
            .on_downstream_outcome("k1", DownstreamOutcome::Delivered);
        assert_eq!(harness.engine.stats().waiting_acks, 0);
    }

    #[tokio::test]
    async fn test_stats_reflect_armed_timers() {
        let harness = build_engine(
            EngineConfig::default(),
            CountPolicy::new(2).with_window(std::time::Duration::from_secs(60)),
            RecordingDownstream::new(),
        );

        send(&harness.engine, keyed_message("k1", json!("a"))).await;
        assert_eq!(harness.engine.stats().armed_timers, 1);
        assert_eq!(harness.timers.scheduled_count(), 1);
    }
}
