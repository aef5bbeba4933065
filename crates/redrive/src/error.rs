// Error types for the redelivery coordinator
use thiserror::Error;

use crate::broker::BrokerError;

/// Errors that can occur while configuring or driving the coordinator
///
/// Configuration problems are raised eagerly at construction time; broker
/// failures propagate unchanged. The coordinator never retries its own broker
/// operations — that would compound with the message-level retry semantics it
/// exists to provide.
#[derive(Debug, Error)]
pub enum RedriveError {
    /// No delay strategy was supplied to the configuration builder.
    #[error("no delay strategy configured")]
    MissingDelayStrategy,

    /// The configuration is structurally invalid (empty exchange name,
    /// missing dead-letter arguments, zero retry budget).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A broker operation failed. Declaration conflicts and transport
    /// failures both surface here.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Result type for coordinator operations
pub type RedriveResult<T> = Result<T, RedriveError>;
