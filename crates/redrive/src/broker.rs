//! Broker client contract consumed by the retry coordinator.
//!
//! The coordinator never opens connections or consumes from the network. It
//! reacts to host-framework callbacks and issues declarative and publish
//! commands through the [`BrokerChannel`] trait, which a broker client
//! adapter (or the in-process [`crate::testing::MemoryBroker`]) implements.
//! All exchanges declared through this contract are topic exchanges.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Message header table.
///
/// Owned by the broker for the lifetime of a message in flight: the broker
/// appends death-history entries, application code only reads them.
pub type Headers = BTreeMap<String, Value>;

/// Queue declaration argument table (`x-message-ttl`, `x-expires`,
/// dead-letter arguments, ...).
pub type QueueArguments = BTreeMap<String, Value>;

/// Errors surfaced by a broker channel
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A resource was re-declared with arguments diverging from the ones it
    /// already carries on the broker. Fatal: the coordinator does not attempt
    /// reconciliation.
    #[error("precondition failed for {name}: {detail}")]
    PreconditionFailed { name: String, detail: String },

    /// A queue, exchange, or delivery tag the operation referred to does not
    /// exist on the broker.
    #[error("not found: {0}")]
    NotFound(String),

    /// The underlying channel is no longer usable.
    #[error("channel closed")]
    Closed,

    /// Transport-level failure.
    #[error("broker i/o error: {0}")]
    Io(String),
}

impl BrokerError {
    /// Create a precondition failure for a named resource.
    pub fn precondition(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::PreconditionFailed { name: name.into(), detail: detail.into() }
    }
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Per-delivery metadata handed to the coordinator's callbacks.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped tag identifying this delivery for ack/reject.
    pub delivery_tag: u64,
    /// Exchange the message was published to (empty for the default
    /// exchange).
    pub exchange: String,
    /// Routing key the message was delivered under.
    pub routing_key: String,
    /// Whether the broker has delivered this message before on this channel.
    pub redelivered: bool,
}

impl Delivery {
    pub fn new(delivery_tag: u64, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered: false,
        }
    }
}

/// Message properties handed to the coordinator's callbacks.
///
/// Only the header table matters to the retry machinery; it carries the
/// broker-written `x-death` history.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    pub headers: Option<Headers>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_headers(headers: Headers) -> Self {
        Self { headers: Some(headers) }
    }
}

/// The subset of a broker channel the coordinator needs.
///
/// Implementations must make declarations idempotent the way AMQP declares
/// are: identical arguments are a no-op, divergent arguments fail with
/// [`BrokerError::PreconditionFailed`]. The broker serializes declarations by
/// name, so racing identical declares from multiple processes is safe.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a topic exchange.
    async fn declare_exchange(&self, name: &str, durable: bool) -> BrokerResult<()>;

    /// Declare a queue with the given argument table.
    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        arguments: &QueueArguments,
    ) -> BrokerResult<()>;

    /// Bind a queue to an exchange under a routing-key pattern.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()>;

    /// Publish a message. An empty exchange name addresses the default
    /// exchange, which routes directly to the queue named by the routing key.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: Option<&Headers>,
    ) -> BrokerResult<()>;

    /// Positively acknowledge a single delivery.
    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    /// Reject a single delivery. With `requeue` false the broker dead-letters
    /// the message if the source queue carries dead-letter arguments.
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;
}
