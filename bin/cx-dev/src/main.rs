//! Conflux Development Runner
//!
//! All-in-one binary for local development containing:
//! - Aggregation engine with the in-memory store and lock manager
//! - Tokio-backed timeout scheduling
//! - Channel downstream with a logging consumer
//! - Sample traffic: one batch that completes, one that times out

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cx_common::{InboundMessage, Message, CORRELATION_KEY_HEADER};
use cx_engine::{
    AggregationEngine, ChannelDownstream, CountPolicy, EngineConfig, KeyLockManager, MemoryStore,
    TokioTimerService,
};

/// Conflux Development Server
#[derive(Parser, Debug)]
#[command(name = "cx-dev")]
#[command(about = "Conflux development runner - aggregation engine in one binary")]
struct Args {
    /// Messages per correlation key before the batch completes
    #[arg(long, env = "CX_BATCH_SIZE", default_value = "3")]
    batch_size: usize,

    /// Completion window in milliseconds
    #[arg(long, env = "CX_TIMEOUT_MS", default_value = "2000")]
    timeout_ms: u64,

    /// Recompute the completion deadline on every arrival
    #[arg(long, env = "CX_RESCHEDULE_TIMEOUTS", default_value = "false")]
    reschedule_timeouts: bool,

    /// Forward results inline instead of on a spawned task
    #[arg(long, env = "CX_SYNCHRONOUS_FORWARD", default_value = "false")]
    synchronous_forward: bool,

    /// Hold sender acks until the aggregation resolves
    #[arg(long, env = "CX_REPORT_ERRORS", default_value = "false")]
    report_errors: bool,

    /// Reject messages arriving for closed keys
    #[arg(long, env = "CX_REPORT_CLOSED_AS_ERRORS", default_value = "false")]
    report_closed_as_errors: bool,

    /// Resolve senders with a timeout instead of forwarding partial results
    #[arg(long, env = "CX_REPORT_TIMEOUT_AS_ERRORS", default_value = "false")]
    report_timeout_as_errors: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    info!("Starting Conflux Dev Runner");
    info!(
        "Batch size: {}, timeout: {}ms, reschedule: {}",
        args.batch_size, args.timeout_ms, args.reschedule_timeouts
    );

    // 1. Engine configuration from flags (invalid combinations are rejected
    //    by the constructor below)
    let config = EngineConfig {
        reschedule_timeouts: args.reschedule_timeouts,
        synchronous_forward: args.synchronous_forward,
        report_errors: args.report_errors,
        report_closed_as_errors: args.report_closed_as_errors,
        report_timeout_as_errors: args.report_timeout_as_errors,
    };

    // 2. In-memory collaborators
    let store = Arc::new(MemoryStore::new());
    let closed_keys = Arc::new(MemoryStore::new());
    let locks = Arc::new(KeyLockManager::new());
    let timers = Arc::new(TokioTimerService::new());
    let (downstream, mut results_rx) = ChannelDownstream::new(64);

    // 3. Count-based policy: complete after N messages or when the window
    //    elapses
    let policy = Arc::new(
        CountPolicy::new(args.batch_size).with_window(Duration::from_millis(args.timeout_ms)),
    );

    // 4. Assemble the engine
    let engine = AggregationEngine::new(
        config,
        policy,
        store,
        closed_keys,
        locks,
        timers.clone(),
        Arc::new(downstream),
    )?;
    info!("Aggregation engine initialized");

    // 5. Consume forwarded results
    let consumer = tokio::spawn(async move {
        while let Some(result) = results_rx.recv().await {
            info!(
                key = result.header(CORRELATION_KEY_HEADER).unwrap_or("<none>"),
                payload = %result.payload,
                "Result forwarded"
            );
        }
    });

    // 6. Sample traffic: a full batch on one key, a lone message on another.
    //    The first completes by count, the second by timeout.
    info!("Publishing a completing batch on key order-1001");
    for line in 0..args.batch_size {
        publish(
            &engine,
            "order-1001",
            json!({ "line": line, "sku": format!("SKU-{line}") }),
        )
        .await?;
    }

    info!("Publishing a lone message on key order-2002 (will time out)");
    publish(&engine, "order-2002", json!({ "line": 0, "sku": "SKU-LONE" })).await?;

    info!("Conflux Dev Runner started successfully");
    info!("Press Ctrl+C to shutdown");

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    // Abort outstanding timers, then drop the engine so the downstream
    // channel closes and the consumer drains out
    timers.shutdown();
    drop(engine);
    let _ = tokio::time::timeout(Duration::from_secs(5), consumer).await;

    info!("Conflux Dev Runner shutdown complete");
    Ok(())
}

/// Send one message into the engine and log its ack when it resolves
async fn publish(engine: &AggregationEngine, key: &str, payload: serde_json::Value) -> Result<()> {
    let message = Message::new(payload).with_header(CORRELATION_KEY_HEADER, key);
    let message_id = message.id.clone();
    let (inbound, ack_rx) = InboundMessage::new(message);
    engine.on_message(inbound).await?;

    let key = key.to_string();
    tokio::spawn(async move {
        match ack_rx.await {
            Ok(outcome) => info!(key = %key, message_id = %message_id, outcome = ?outcome, "Sender resolved"),
            Err(_) => warn!(key = %key, message_id = %message_id, "Ack channel dropped"),
        }
    });
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
