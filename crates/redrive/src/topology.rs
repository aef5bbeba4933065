//! Idempotent broker topology management.
//!
//! The coordinator creates its topology on demand: the primary exchange, the
//! dead-letter destination, and one ephemeral retry queue per distinct delay.
//! Declares are memoized locally so the hot retry path normally issues no
//! broker commands, with one deliberate exception: retry queues carry
//! `x-expires` and can vanish broker-side while still cached here, so their
//! cache entries are invalidated before every creation attempt and the queue
//! is re-declared each time it is needed. A declare that conflicts with
//! different arguments already on the broker surfaces as a fatal
//! [`BrokerError::PreconditionFailed`]; the manager never reconciles.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::broker::{BrokerChannel, QueueArguments};
use crate::config::{
    CoordinatorConfig, RetryRouting, DEAD_LETTER_EXCHANGE_ARG, DEAD_LETTER_ROUTING_KEY_ARG,
};
use crate::delay::delay_token;
use crate::error::RedriveResult;

/// Queue argument holding the per-message TTL in milliseconds.
pub const MESSAGE_TTL_ARG: &str = "x-message-ttl";

/// Queue argument holding the queue idle-expiry window in milliseconds.
pub const QUEUE_EXPIRES_ARG: &str = "x-expires";

#[derive(Default)]
struct Declared {
    exchanges: HashSet<String>,
    queues: HashSet<String>,
    bindings: HashSet<(String, String, String)>,
}

/// Lazily creates and memoizes the coordinator's exchanges, queues, and
/// bindings.
///
/// The memoization is a per-instance cache only; across instances and
/// processes the broker itself deduplicates declarations by name, so racing
/// identical declares is safe.
pub struct TopologyManager {
    channel: Arc<dyn BrokerChannel>,
    queue_name: String,
    config: CoordinatorConfig,
    declared: Mutex<Declared>,
}

impl TopologyManager {
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        queue_name: impl Into<String>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            channel,
            queue_name: queue_name.into(),
            config,
            declared: Mutex::new(Declared::default()),
        }
    }

    /// Declare the primary exchange.
    pub async fn ensure_primary_exchange(&self) -> RedriveResult<()> {
        self.ensure_exchange(self.config.exchange(), self.config.exchange_durable()).await
    }

    /// Declare the dedicated retry exchange (key-preserving topology).
    pub async fn ensure_retry_exchange(&self) -> RedriveResult<String> {
        let name = self.config.retry_exchange();
        self.ensure_exchange(&name, self.config.exchange_durable()).await?;
        Ok(name)
    }

    /// Declare a topic exchange once; later calls are local no-ops.
    pub async fn ensure_exchange(&self, name: &str, durable: bool) -> RedriveResult<()> {
        if self.declared.lock().exchanges.contains(name) {
            return Ok(());
        }

        debug!(exchange = name, durable, "declaring topic exchange");
        self.channel.declare_exchange(name, durable).await?;
        self.declared.lock().exchanges.insert(name.to_string());
        Ok(())
    }

    /// Declare the dead-letter exchange, the `<queue>.error` queue, and the
    /// binding that routes exhausted messages into it.
    ///
    /// The dead-letter exchange and routing key come from the primary queue's
    /// argument table — the same arguments the broker consults when the
    /// coordinator rejects a message past its retry budget.
    pub async fn ensure_error_destination(&self) -> RedriveResult<()> {
        let exchange = self.config.dead_letter_exchange().to_string();
        self.ensure_exchange(&exchange, self.config.exchange_durable()).await?;

        let error_queue = format!("{}.error", self.queue_name);
        self.ensure_queue(&error_queue, self.config.queue_durable(), &QueueArguments::new())
            .await?;
        self.ensure_binding(&error_queue, &exchange, self.config.dead_letter_routing_key()).await
    }

    /// Name of the retry queue realizing the given delay.
    pub fn retry_queue_name(&self, delay: Duration) -> String {
        format!("{}.retry.{}", self.queue_name, delay_token(delay))
    }

    /// Argument table of the retry queue realizing the given delay: messages
    /// expire back to the primary exchange after `delay`, and the queue
    /// itself expires after twice that when idle.
    ///
    /// The uniform topology pins the dead-letter routing key to the primary
    /// queue name; the key-preserving topology omits it so the broker's
    /// return hop keeps the delay-suffixed semantic key.
    pub fn retry_queue_arguments(&self, delay: Duration) -> QueueArguments {
        let ttl = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);

        let mut arguments = QueueArguments::new();
        arguments
            .insert(DEAD_LETTER_EXCHANGE_ARG.to_string(), Value::from(self.config.exchange()));
        if self.config.routing() == RetryRouting::Uniform {
            arguments
                .insert(DEAD_LETTER_ROUTING_KEY_ARG.to_string(), Value::from(self.queue_name.as_str()));
        }
        arguments.insert(MESSAGE_TTL_ARG.to_string(), Value::from(ttl));
        arguments.insert(QUEUE_EXPIRES_ARG.to_string(), Value::from(ttl.saturating_mul(2)));
        arguments
    }

    /// Declare the retry queue for the given delay and return its name.
    ///
    /// The local cache entry for the queue (and its bindings) is invalidated
    /// first: the queue carries `x-expires` and may have already been removed
    /// broker-side, so a cached "exists" answer is never trusted.
    pub async fn ensure_retry_queue(&self, delay: Duration) -> RedriveResult<String> {
        let name = self.retry_queue_name(delay);
        self.invalidate_queue(&name);

        let arguments = self.retry_queue_arguments(delay);
        self.ensure_queue(&name, self.config.queue_durable(), &arguments).await?;
        Ok(name)
    }

    /// Bind a queue to an exchange once; later identical calls are local
    /// no-ops.
    pub async fn ensure_binding(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> RedriveResult<()> {
        let entry =
            (queue.to_string(), exchange.to_string(), routing_key.to_string());
        if self.declared.lock().bindings.contains(&entry) {
            return Ok(());
        }

        debug!(queue, exchange, routing_key, "binding queue");
        self.channel.bind_queue(queue, exchange, routing_key).await?;
        self.declared.lock().bindings.insert(entry);
        Ok(())
    }

    async fn ensure_queue(
        &self,
        name: &str,
        durable: bool,
        arguments: &QueueArguments,
    ) -> RedriveResult<()> {
        if self.declared.lock().queues.contains(name) {
            return Ok(());
        }

        debug!(queue = name, durable, ?arguments, "declaring queue");
        self.channel.declare_queue(name, durable, arguments).await?;
        self.declared.lock().queues.insert(name.to_string());
        Ok(())
    }

    /// Forget a queue and every binding that references it. A queue that
    /// expired broker-side takes its bindings with it, so both must be
    /// re-declared together.
    fn invalidate_queue(&self, name: &str) {
        let mut declared = self.declared.lock();
        declared.queues.remove(name);
        declared.bindings.retain(|(queue, _, _)| queue != name);
    }
}

impl std::fmt::Debug for TopologyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyManager")
            .field("queue_name", &self.queue_name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
