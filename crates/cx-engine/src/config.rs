//! Engine Configuration

use crate::error::{EngineError, Result};

/// Behavior switches for the aggregation engine
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineConfig {
    /// Restart the completion timeout on every arrival instead of keeping
    /// the deadline computed for the first message
    pub reschedule_timeouts: bool,
    /// Forward finalized results on the caller's task and wait for the
    /// downstream verdict, instead of spawning the send
    pub synchronous_forward: bool,
    /// Hold sender acknowledgements until the aggregation resolves, then
    /// fan the terminal outcome out to every contributor
    pub report_errors: bool,
    /// Resolve senders that hit an already-closed key with `RejectedClosed`
    /// instead of silently consuming the message
    pub report_closed_as_errors: bool,
    /// On timeout, resolve pending senders with `TimedOut` instead of
    /// forwarding a partial result downstream
    pub report_timeout_as_errors: bool,
}

impl EngineConfig {
    /// Rejects option combinations that cannot work together. Timeout
    /// errors can only reach senders whose acks are being held, so
    /// `report_timeout_as_errors` without `report_errors` is a hard
    /// configuration error, not a runtime fallback.
    pub fn validate(&self) -> Result<()> {
        if self.report_timeout_as_errors && !self.report_errors {
            return Err(EngineError::configuration(
                "report_timeout_as_errors requires report_errors",
            ));
        }
        Ok(())
    }
}
