//! Retry-with-backoff redelivery coordination on broker-native primitives.
//!
//! When a consumer fails to process a message, the coordinator either
//! reschedules it for a delayed retry or routes it permanently to a
//! dead-letter destination — using nothing but per-message TTL,
//! dead-lettering, and topic exchanges. The delay is realized entirely by
//! the broker: a failed message is republished onto an ephemeral per-delay
//! retry queue whose TTL dead-letters it back to the primary queue, with the
//! attempt count carried in the broker's own `x-death` header. No external
//! scheduler, no counter store, no in-process timers.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use redrive::{CoordinatorConfig, RetryCoordinator};
//!
//! let config = CoordinatorConfig::conventional("events")
//!     .queue_argument("x-dead-letter-exchange", "events.dlx")
//!     .queue_argument("x-dead-letter-routing-key", "orders")
//!     .max_retries(10)
//!     .build()?;
//!
//! // `channel` is any Arc<dyn BrokerChannel>; the host framework owns the
//! // consume loop and invokes one callback per processing outcome.
//! let coordinator = RetryCoordinator::new(channel, "orders", config).await?;
//! coordinator.timeout(&delivery, &properties, &payload).await?;
//! ```
//!
//! Delay strategies are pluggable through [`DelayStrategy`]; see
//! [`Configurable`], [`PowerLaw`], and [`ConventionalExponential`].

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod broker;
pub mod config;
pub mod coordinator;
pub mod death;
pub mod delay;
pub mod error;
pub mod testing;
pub mod topology;

// Re-export commonly used types and traits for convenience
// ------------------------
pub use broker::{
    BrokerChannel, BrokerError, BrokerResult, Delivery, Headers, Properties, QueueArguments,
};
pub use config::{
    CoordinatorConfig, CoordinatorConfigBuilder, RetryRouting, DEAD_LETTER_EXCHANGE_ARG,
    DEAD_LETTER_ROUTING_KEY_ARG, DEFAULT_MAX_RETRIES,
};
pub use coordinator::RetryCoordinator;
pub use death::{attributed_to, failure_count, DeathRecord, DEATH_HEADER};
pub use delay::{delay_token, Configurable, ConventionalExponential, DelayStrategy, PowerLaw};
pub use error::{RedriveError, RedriveResult};
pub use topology::{TopologyManager, MESSAGE_TTL_ARG, QUEUE_EXPIRES_ARG};
