//! The retry coordinator: the callback surface the host framework drives.
//!
//! Per message instance the states are
//! `Delivered -> {Acknowledged | Failed}` and
//! `Failed -> {RetryScheduled | DeadLettered}`. The three failure callbacks
//! ([`reject`](RetryCoordinator::reject), [`error`](RetryCoordinator::error),
//! [`timeout`](RetryCoordinator::timeout)) funnel into one decision path and
//! differ only in the reason recorded in the log line. A scheduled retry
//! republishes payload and headers unchanged onto a TTL-bearing retry queue
//! and acknowledges the original delivery — the retry queue, not
//! redelivery-without-ack, is what preserves at-least-once semantics. Past
//! the retry budget the message is rejected without requeue and the broker's
//! own dead-letter routing moves it to the error destination.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broker::{BrokerChannel, Delivery, Properties};
use crate::config::{CoordinatorConfig, RetryRouting};
use crate::death;
use crate::delay::delay_token;
use crate::error::RedriveResult;
use crate::topology::TopologyManager;

/// Retry-with-backoff redelivery coordinator for one primary queue.
///
/// Construction declares the primary exchange, the error destination, and
/// the primary-queue bindings; per-delay retry queues are created lazily on
/// first need. One instance handles one logical delivery at a time; the only
/// state shared with other instances is the broker-side topology, whose
/// consistency the broker's own declare semantics guarantee.
pub struct RetryCoordinator {
    channel: Arc<dyn BrokerChannel>,
    queue_name: String,
    config: CoordinatorConfig,
    topology: TopologyManager,
}

impl RetryCoordinator {
    /// Build a coordinator for `queue_name` and declare its standing
    /// topology.
    ///
    /// The primary queue itself is declared by the caller (its dead-letter
    /// arguments are consumed as configuration); everything else — primary
    /// exchange, error destination, bindings, retry exchange in the
    /// key-preserving topology — is declared here. Broker failures and
    /// declaration conflicts propagate as fatal.
    pub async fn new(
        channel: Arc<dyn BrokerChannel>,
        queue_name: impl Into<String>,
        config: CoordinatorConfig,
    ) -> RedriveResult<Self> {
        let queue_name = queue_name.into();
        let topology = TopologyManager::new(Arc::clone(&channel), queue_name.clone(), config.clone());

        topology.ensure_primary_exchange().await?;
        topology.ensure_error_destination().await?;

        match config.routing() {
            RetryRouting::Uniform => {
                topology.ensure_binding(&queue_name, config.exchange(), &queue_name).await?;
            }
            RetryRouting::KeyPreserving => {
                topology.ensure_retry_exchange().await?;
                // A `#` tail matches zero segments, so these bindings route
                // both the caller's plain keys and the delay-suffixed keys
                // coming back from retry queues.
                topology
                    .ensure_binding(&queue_name, config.exchange(), &format!("{queue_name}.#"))
                    .await?;
                for key in config.routing_keys() {
                    topology
                        .ensure_binding(&queue_name, config.exchange(), &format!("{key}.#"))
                        .await?;
                }
            }
        }

        Ok(Self { channel, queue_name, config, topology })
    }

    /// Primary queue this coordinator serves.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Successful processing: positively acknowledge this delivery tag only.
    pub async fn acknowledge(
        &self,
        delivery: &Delivery,
        _properties: &Properties,
        _payload: &[u8],
    ) -> RedriveResult<()> {
        self.channel.ack(delivery.delivery_tag).await?;
        Ok(())
    }

    /// Explicit rejection by the processing function. The `requeue` hint is
    /// ignored: redelivery goes through a delayed retry queue instead of an
    /// immediate broker requeue.
    pub async fn reject(
        &self,
        delivery: &Delivery,
        properties: &Properties,
        payload: &[u8],
        _requeue: bool,
    ) -> RedriveResult<()> {
        self.retry_message(delivery, properties, payload, "reject").await
    }

    /// Processing raised an application error.
    pub async fn error(
        &self,
        delivery: &Delivery,
        properties: &Properties,
        payload: &[u8],
        error: &(dyn std::error::Error + Send + Sync),
    ) -> RedriveResult<()> {
        debug!(queue = %self.queue_name, error = %error, "consumer reported an error");
        self.retry_message(delivery, properties, payload, "error").await
    }

    /// Processing exceeded its deadline.
    pub async fn timeout(
        &self,
        delivery: &Delivery,
        properties: &Properties,
        payload: &[u8],
    ) -> RedriveResult<()> {
        self.retry_message(delivery, properties, payload, "timeout").await
    }

    /// Deliberate absorb-and-discard: no acknowledgment, no retry
    /// bookkeeping. Exists so the host framework can route outcomes such as
    /// duplicate deliveries away from the retry machinery entirely.
    pub fn noop(&self, _delivery: &Delivery, _properties: &Properties, _payload: &[u8]) {}

    async fn retry_message(
        &self,
        delivery: &Delivery,
        properties: &Properties,
        payload: &[u8],
        reason: &'static str,
    ) -> RedriveResult<()> {
        let failures = death::failure_count(properties.headers.as_ref(), &self.queue_name);
        let attempt = failures.saturating_add(1);

        if attempt <= u64::from(self.config.max_retries()) {
            let attempt = u32::try_from(attempt).unwrap_or(u32::MAX);
            let delay = self.config.delay_for(attempt);
            let token = delay_token(delay);
            let routing_key = self.retry_routing_key(&delivery.routing_key, &token);

            let retry_queue = self.topology.ensure_retry_queue(delay).await?;
            let exchange = match self.config.routing() {
                RetryRouting::Uniform => {
                    self.topology
                        .ensure_binding(&retry_queue, self.config.exchange(), &routing_key)
                        .await?;
                    self.config.exchange().to_string()
                }
                RetryRouting::KeyPreserving => {
                    let retry_exchange = self.topology.ensure_retry_exchange().await?;
                    self.topology
                        .ensure_binding(&retry_queue, &retry_exchange, &format!("#.{token}"))
                        .await?;
                    retry_exchange
                }
            };

            info!(
                queue = %self.queue_name,
                reason,
                attempt,
                delay_ms = delay.as_millis() as u64,
                routing_key = %routing_key,
                "scheduling delayed redelivery"
            );

            self.channel
                .publish(&exchange, &routing_key, payload, properties.headers.as_ref())
                .await?;
            self.channel.ack(delivery.delivery_tag).await?;
        } else {
            warn!(
                queue = %self.queue_name,
                reason,
                attempt,
                max_retries = self.config.max_retries(),
                "retries exhausted, dead-lettering"
            );
            self.channel.reject(delivery.delivery_tag, false).await?;
        }

        Ok(())
    }

    fn retry_routing_key(&self, original: &str, token: &str) -> String {
        match self.config.routing() {
            RetryRouting::Uniform => format!("{}.{}", self.queue_name, token),
            RetryRouting::KeyPreserving => preserved_routing_key(original, token),
        }
    }
}

impl std::fmt::Debug for RetryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryCoordinator")
            .field("queue_name", &self.queue_name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Rebuild a semantic routing key for the next retry hop: strip any delay
/// segments a previous hop appended, then append the new delay token.
///
/// Trailing segments are stripped while they parse as numbers because a
/// fractional delay token (`0.5`) spans two key segments. A purely numeric
/// semantic key therefore degenerates to the token alone — same limitation
/// as appending to it would eventually create.
fn preserved_routing_key(original: &str, token: &str) -> String {
    let mut segments: Vec<&str> =
        original.split('.').filter(|segment| !segment.is_empty()).collect();
    while segments.last().is_some_and(|segment| segment.parse::<f64>().is_ok()) {
        segments.pop();
    }
    segments.push(token);
    segments.join(".")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::broker::{Headers, QueueArguments};
    use crate::config::{DEAD_LETTER_EXCHANGE_ARG, DEAD_LETTER_ROUTING_KEY_ARG};
    use crate::death::DEATH_HEADER;
    use crate::testing::MemoryBroker;

    async fn coordinator(broker: &MemoryBroker, max_retries: u32) -> RetryCoordinator {
        let mut arguments = QueueArguments::new();
        arguments.insert(DEAD_LETTER_EXCHANGE_ARG.to_string(), json!("events.dlx"));
        arguments.insert(DEAD_LETTER_ROUTING_KEY_ARG.to_string(), json!("orders"));
        broker.declare_queue("orders", false, &arguments).await.expect("primary queue");

        let config = CoordinatorConfig::builder("events")
            .delay_fn(|_| Duration::from_secs(1))
            .max_retries(max_retries)
            .queue_arguments(arguments)
            .build()
            .expect("valid config");
        RetryCoordinator::new(Arc::new(broker.clone()), "orders", config)
            .await
            .expect("coordinator")
    }

    fn deaths(count: u64) -> Headers {
        let mut headers = Headers::new();
        headers.insert(
            DEATH_HEADER.to_string(),
            json!([{ "queue": "orders.retry.1", "reason": "expired", "count": count }]),
        );
        headers
    }

    /// Validates that the retry decision is driven purely by the recorded
    /// death counts: a message with `max_retries` prior failures is
    /// dead-lettered, one short of that is rescheduled.
    #[tokio::test]
    async fn test_death_count_drives_the_decision() {
        let broker = MemoryBroker::new();
        let handler = coordinator(&broker, 2).await;

        // Two prior failures recorded: the next one exceeds the budget.
        broker
            .publish("", "orders", b"worn-out", Some(&deaths(2)))
            .await
            .expect("publish");
        let (delivery, properties, payload) = broker.fetch("orders").expect("delivery");
        handler.timeout(&delivery, &properties, &payload).await.expect("decision");
        assert_eq!(broker.message_count("orders.error"), 1);
        assert_eq!(broker.message_count("orders.retry.1"), 0);

        // One prior failure: still within budget, rescheduled.
        broker
            .publish("", "orders", b"one-more-chance", Some(&deaths(1)))
            .await
            .expect("publish");
        let (delivery, properties, payload) = broker.fetch("orders").expect("delivery");
        handler.timeout(&delivery, &properties, &payload).await.expect("decision");
        assert_eq!(broker.message_count("orders.retry.1"), 1);
        assert_eq!(broker.message_count("orders.error"), 1);
    }

    /// Validates `preserved_routing_key` for the first and subsequent retry
    /// hops.
    ///
    /// Assertions:
    /// - Confirms the delay token is appended to a fresh key.
    /// - Confirms a previously appended integer token is replaced.
    /// - Confirms a previously appended fractional token (two segments) is
    ///   fully replaced.
    #[test]
    fn test_preserved_routing_key() {
        assert_eq!(preserved_routing_key("queue.lifecycle.created", "7"), "queue.lifecycle.created.7");
        assert_eq!(preserved_routing_key("queue.lifecycle.created.7", "15.5"), "queue.lifecycle.created.15.5");
        assert_eq!(preserved_routing_key("queue.lifecycle.created.15.5", "31.5"), "queue.lifecycle.created.31.5");
        assert_eq!(preserved_routing_key("queue.lifecycle.created.0.5", "1"), "queue.lifecycle.created.1");
    }

    /// Validates `preserved_routing_key` edge cases.
    #[test]
    fn test_preserved_routing_key_edges() {
        // Direct publishes addressed by queue name.
        assert_eq!(preserved_routing_key("orders", "0.5"), "orders.0.5");
        // Empty key: only the token survives.
        assert_eq!(preserved_routing_key("", "1"), "1");
        // Purely numeric semantic keys degenerate (documented limitation).
        assert_eq!(preserved_routing_key("123", "1"), "1");
    }
}
