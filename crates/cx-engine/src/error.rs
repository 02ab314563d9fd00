//! Engine Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Message {message_id} has no usable correlation key")]
    InvalidCorrelation { message_id: String },

    #[error("Correlation extraction failed for message {message_id}: {source}")]
    Correlation {
        message_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Aggregation policy failed for key '{key}': {source}")]
    Policy {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Store {operation} failed for key '{key}': {source}")]
    Store {
        key: String,
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl EngineError {
    pub fn invalid_correlation(message_id: impl Into<String>) -> Self {
        Self::InvalidCorrelation {
            message_id: message_id.into(),
        }
    }

    pub fn correlation(message_id: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Correlation {
            message_id: message_id.into(),
            source,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn policy(key: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Policy {
            key: key.into(),
            source,
        }
    }

    pub fn store(key: impl Into<String>, operation: &'static str, source: anyhow::Error) -> Self {
        Self::Store {
            key: key.into(),
            operation,
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
