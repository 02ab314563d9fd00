//! Downstream Delivery

use async_trait::async_trait;
use cx_common::Message;
use tokio::sync::mpsc;

/// Destination for finalized aggregates. Implementations own the transport;
/// the engine only needs a delivered-or-failed verdict.
#[async_trait]
pub trait Downstream: Send + Sync {
    async fn forward(&self, result: Message) -> anyhow::Result<()>;
}

/// Downstream that hands results to an in-process channel
pub struct ChannelDownstream {
    tx: mpsc::Sender<Message>,
}

impl ChannelDownstream {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Downstream for ChannelDownstream {
    async fn forward(&self, result: Message) -> anyhow::Result<()> {
        self.tx
            .send(result)
            .await
            .map_err(|_| anyhow::anyhow!("downstream channel closed"))
    }
}
