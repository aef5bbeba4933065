//! In-memory broker with virtual-clock TTL semantics.

// Unwraps and casts are acceptable in test infrastructure; failures abort the
// test run with a clear panic.
#![allow(clippy::cast_possible_truncation)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::broker::{
    BrokerChannel, BrokerError, BrokerResult, Delivery, Headers, Properties, QueueArguments,
};
use crate::config::{DEAD_LETTER_EXCHANGE_ARG, DEAD_LETTER_ROUTING_KEY_ARG};
use crate::death::{DeathRecord, DEATH_HEADER};
use crate::topology::{MESSAGE_TTL_ARG, QUEUE_EXPIRES_ARG};

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    headers: Option<Headers>,
    exchange: String,
    routing_key: String,
    expires_at_ms: Option<u64>,
}

#[derive(Debug, Clone)]
struct QueueState {
    durable: bool,
    arguments: QueueArguments,
    messages: VecDeque<StoredMessage>,
    expires_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    pattern: String,
}

#[derive(Debug, Default)]
struct BrokerState {
    now_ms: u64,
    exchanges: HashMap<String, bool>,
    bindings: HashMap<String, Vec<Binding>>,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, (String, StoredMessage)>,
    next_tag: u64,
}

/// An in-process broker implementing [`BrokerChannel`].
///
/// Time is virtual: nothing expires until [`advance`](Self::advance) is
/// called, which fires per-message TTL dead-lettering (reason `expired`) and
/// queue idle expiry in chronological order, cascading through dead-letter
/// routes exactly like the real thing. Deliveries are handed out with
/// [`fetch`](Self::fetch) and stay unacknowledged until acked or rejected.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move virtual time forward, firing every TTL and expiry event that
    /// falls inside the window, in order.
    pub fn advance(&self, duration: Duration) {
        let mut state = self.state.lock();
        let target = state.now_ms.saturating_add(duration.as_millis() as u64);

        while let Some(at) = next_event_ms(&state).filter(|&at| at <= target) {
            state.now_ms = state.now_ms.max(at);
            fire_due_events(&mut state);
        }
        state.now_ms = target;
    }

    /// Pop the next message off a queue as an unacknowledged delivery.
    ///
    /// Stands in for the host framework's consume loop; the returned triple
    /// is exactly what the host hands to a coordinator callback.
    pub fn fetch(&self, queue: &str) -> Option<(Delivery, Properties, Vec<u8>)> {
        let mut state = self.state.lock();
        let now = state.now_ms;

        let queue_state = state.queues.get_mut(queue)?;
        let message = queue_state.messages.pop_front()?;
        touch_queue(queue_state, now);

        state.next_tag += 1;
        let tag = state.next_tag;

        let delivery = Delivery {
            delivery_tag: tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.headers.as_ref().is_some_and(|h| h.contains_key(DEATH_HEADER)),
        };
        let properties = Properties { headers: message.headers.clone() };
        let payload = message.payload.clone();

        state.unacked.insert(tag, (queue.to_string(), message));
        Some((delivery, properties, payload))
    }

    /// Number of messages currently sitting in a queue; 0 when the queue
    /// does not exist (it may have expired).
    pub fn message_count(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, |q| q.messages.len())
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.lock().queues.contains_key(name)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.lock().exchanges.contains_key(name)
    }

    /// Routing key of the message at the front of a queue, if any.
    pub fn front_routing_key(&self, queue: &str) -> Option<String> {
        self.state
            .lock()
            .queues
            .get(queue)
            .and_then(|q| q.messages.front())
            .map(|m| m.routing_key.clone())
    }

    /// Deliveries fetched but neither acked nor rejected yet.
    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }
}

#[async_trait]
impl BrokerChannel for MemoryBroker {
    async fn declare_exchange(&self, name: &str, durable: bool) -> BrokerResult<()> {
        let mut state = self.state.lock();
        if let Some(&existing) = state.exchanges.get(name) {
            if existing != durable {
                return Err(BrokerError::precondition(
                    name,
                    format!("exchange already declared with durable={existing}"),
                ));
            }
            return Ok(());
        }
        state.exchanges.insert(name.to_string(), durable);
        state.bindings.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        arguments: &QueueArguments,
    ) -> BrokerResult<()> {
        let mut state = self.state.lock();
        let now = state.now_ms;

        if let Some(existing) = state.queues.get_mut(name) {
            if existing.durable != durable || existing.arguments != *arguments {
                return Err(BrokerError::precondition(
                    name,
                    "queue already declared with different arguments",
                ));
            }
            // Re-declaring counts as use: the idle-expiry window restarts.
            touch_queue(existing, now);
            return Ok(());
        }

        let mut queue = QueueState {
            durable,
            arguments: arguments.clone(),
            messages: VecDeque::new(),
            expires_at_ms: None,
        };
        touch_queue(&mut queue, now);
        state.queues.insert(name.to_string(), queue);
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        let mut state = self.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("queue {queue}")));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("exchange {exchange}")));
        }

        let binding = Binding { queue: queue.to_string(), pattern: routing_key.to_string() };
        let bindings = state.bindings.entry(exchange.to_string()).or_default();
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: Option<&Headers>,
    ) -> BrokerResult<()> {
        let mut state = self.state.lock();
        publish_message(&mut state, exchange, routing_key, payload.to_vec(), headers.cloned())
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        let mut state = self.state.lock();
        state
            .unacked
            .remove(&delivery_tag)
            .map(|_| ())
            .ok_or_else(|| BrokerError::NotFound(format!("delivery tag {delivery_tag}")))
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        let mut state = self.state.lock();
        let (queue, message) = state
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| BrokerError::NotFound(format!("delivery tag {delivery_tag}")))?;

        if requeue {
            let now = state.now_ms;
            if let Some(queue_state) = state.queues.get_mut(&queue) {
                queue_state.messages.push_front(message);
                touch_queue(queue_state, now);
            }
        } else {
            dead_letter(&mut state, &queue, message, "rejected");
        }
        Ok(())
    }
}

fn touch_queue(queue: &mut QueueState, now_ms: u64) {
    queue.expires_at_ms =
        queue.arguments.get(QUEUE_EXPIRES_ARG).and_then(Value::as_u64).map(|w| now_ms + w);
}

fn next_event_ms(state: &BrokerState) -> Option<u64> {
    let message_expiry = state
        .queues
        .values()
        .flat_map(|q| q.messages.iter().filter_map(|m| m.expires_at_ms))
        .min();
    let queue_expiry = state.queues.values().filter_map(|q| q.expires_at_ms).min();
    [message_expiry, queue_expiry].into_iter().flatten().min()
}

fn fire_due_events(state: &mut BrokerState) {
    let now = state.now_ms;

    // Per-message TTL: expired messages dead-letter back through the queue's
    // configured route, in arrival order.
    let queue_names: Vec<String> = state.queues.keys().cloned().collect();
    for name in &queue_names {
        let mut expired = Vec::new();
        if let Some(queue) = state.queues.get_mut(name) {
            let mut index = 0;
            while index < queue.messages.len() {
                if queue.messages[index].expires_at_ms.is_some_and(|at| at <= now) {
                    if let Some(message) = queue.messages.remove(index) {
                        expired.push(message);
                    }
                } else {
                    index += 1;
                }
            }
        }
        for message in expired {
            dead_letter(state, name, message, "expired");
        }
    }

    // Queue idle expiry: the queue vanishes with its bindings; any messages
    // still inside are dropped, not dead-lettered.
    let expired_queues: Vec<String> = state
        .queues
        .iter()
        .filter(|(_, q)| q.expires_at_ms.is_some_and(|at| at <= now))
        .map(|(name, _)| name.clone())
        .collect();
    for name in expired_queues {
        state.queues.remove(&name);
        for bindings in state.bindings.values_mut() {
            bindings.retain(|b| b.queue != name);
        }
    }
}

fn dead_letter(state: &mut BrokerState, source_queue: &str, mut message: StoredMessage, reason: &str) {
    let Some(queue) = state.queues.get(source_queue) else { return };
    let arguments = queue.arguments.clone();

    // No dead-letter exchange configured: the broker discards the message.
    let Some(exchange) =
        arguments.get(DEAD_LETTER_EXCHANGE_ARG).and_then(Value::as_str).map(str::to_string)
    else {
        return;
    };
    let routing_key = arguments
        .get(DEAD_LETTER_ROUTING_KEY_ARG)
        .and_then(Value::as_str)
        .map_or_else(|| message.routing_key.clone(), str::to_string);

    record_death(&mut message, source_queue, reason);

    // Unroutable dead-letters are dropped, like any other publish.
    let _ = publish_message(state, &exchange, &routing_key, message.payload, message.headers);
}

fn record_death(message: &mut StoredMessage, queue: &str, reason: &str) {
    let headers = message.headers.get_or_insert_with(Headers::new);
    let mut records: Vec<DeathRecord> = headers
        .get(DEATH_HEADER)
        .and_then(Value::as_array)
        .map(|entries| {
            entries.iter().filter_map(|e| serde_json::from_value(e.clone()).ok()).collect()
        })
        .unwrap_or_default();

    if let Some(existing) =
        records.iter_mut().find(|r| r.queue == queue && r.reason == reason)
    {
        existing.count += 1;
    } else {
        records.insert(
            0,
            DeathRecord {
                queue: queue.to_string(),
                reason: reason.to_string(),
                count: 1,
                exchange: message.exchange.clone(),
                routing_keys: vec![message.routing_key.clone()],
            },
        );
    }

    let value = serde_json::to_value(&records).expect("death records serialize");
    headers.insert(DEATH_HEADER.to_string(), value);
}

fn publish_message(
    state: &mut BrokerState,
    exchange: &str,
    routing_key: &str,
    payload: Vec<u8>,
    headers: Option<Headers>,
) -> BrokerResult<()> {
    // The default exchange routes straight to the queue named by the key.
    if exchange.is_empty() {
        enqueue(state, routing_key, exchange, routing_key, payload, headers);
        return Ok(());
    }

    if !state.exchanges.contains_key(exchange) {
        return Err(BrokerError::NotFound(format!("exchange {exchange}")));
    }

    let targets: BTreeSet<String> = state
        .bindings
        .get(exchange)
        .map(|bindings| {
            bindings
                .iter()
                .filter(|b| topic_match(&b.pattern, routing_key))
                .map(|b| b.queue.clone())
                .collect()
        })
        .unwrap_or_default();

    for queue in targets {
        enqueue(state, &queue, exchange, routing_key, payload.clone(), headers.clone());
    }
    Ok(())
}

fn enqueue(
    state: &mut BrokerState,
    queue_name: &str,
    exchange: &str,
    routing_key: &str,
    payload: Vec<u8>,
    headers: Option<Headers>,
) {
    let now = state.now_ms;
    let Some(queue) = state.queues.get_mut(queue_name) else { return };

    let ttl = queue.arguments.get(MESSAGE_TTL_ARG).and_then(Value::as_u64);
    queue.messages.push_back(StoredMessage {
        payload,
        headers,
        exchange: exchange.to_string(),
        routing_key: routing_key.to_string(),
        expires_at_ms: ttl.map(|t| now + t),
    });
    touch_queue(queue, now);
}

/// AMQP topic matching: `*` matches exactly one segment, `#` matches zero or
/// more.
fn topic_match(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        let Some((head, rest)) = pattern.split_first() else {
            return key.is_empty();
        };
        match *head {
            "#" => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            "*" => !key.is_empty() && matches(rest, &key[1..]),
            literal => key.first() == Some(&literal) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}
