//! Coordinator configuration.
//!
//! A [`CoordinatorConfig`] is immutable once built. The builder validates
//! eagerly: a missing delay strategy or a queue argument table without the
//! dead-letter pair is a construction-time error, never deferred to the
//! first failed message.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::broker::QueueArguments;
use crate::delay::{Configurable, ConventionalExponential, DelayStrategy, PowerLaw};
use crate::error::{RedriveError, RedriveResult};

/// Default number of retries before a message is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 25;

/// Queue argument naming the exchange rejected messages are dead-lettered to.
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// Queue argument naming the routing key used for dead-lettered messages.
pub const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";

/// How retry publishes are routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryRouting {
    /// One routing key per distinct delay (`<queue>.<delay>`) on the primary
    /// exchange, independent of how the message originally arrived.
    #[default]
    Uniform,
    /// Redeliveries keep the original multi-segment routing key with the
    /// delay appended as a fresh tail segment, published through a dedicated
    /// `<exchange>.retry` exchange.
    KeyPreserving,
}

/// Immutable, validated configuration of a [`crate::RetryCoordinator`].
#[derive(Clone)]
pub struct CoordinatorConfig {
    exchange: String,
    exchange_durable: bool,
    queue_durable: bool,
    queue_arguments: QueueArguments,
    dead_letter_exchange: String,
    dead_letter_routing_key: String,
    max_retries: u32,
    strategy: Arc<dyn DelayStrategy>,
    routing: RetryRouting,
    routing_keys: Vec<String>,
}

impl CoordinatorConfig {
    /// Start building a configuration for the given primary exchange.
    ///
    /// The builder carries no delay strategy; [`build`](CoordinatorConfigBuilder::build)
    /// fails until one is supplied.
    pub fn builder(exchange: impl Into<String>) -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder {
            exchange: exchange.into(),
            exchange_durable: false,
            queue_durable: false,
            queue_arguments: QueueArguments::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            strategy: None,
            routing: RetryRouting::default(),
            routing_keys: Vec::new(),
        }
    }

    /// Builder pre-seeded with a [`PowerLaw`] strategy.
    pub fn power_law(exchange: impl Into<String>, scale: f64, exponent: f64) -> CoordinatorConfigBuilder {
        Self::builder(exchange).delay_strategy(PowerLaw::new(scale, exponent))
    }

    /// Builder pre-seeded with the [`ConventionalExponential`] strategy.
    pub fn conventional(exchange: impl Into<String>) -> CoordinatorConfigBuilder {
        Self::builder(exchange).delay_strategy(ConventionalExponential)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Name of the dedicated retry exchange used by the key-preserving
    /// topology.
    pub fn retry_exchange(&self) -> String {
        format!("{}.retry", self.exchange)
    }

    pub fn exchange_durable(&self) -> bool {
        self.exchange_durable
    }

    pub fn queue_durable(&self) -> bool {
        self.queue_durable
    }

    /// Argument table the caller declared the primary queue with.
    pub fn queue_arguments(&self) -> &QueueArguments {
        &self.queue_arguments
    }

    pub fn dead_letter_exchange(&self) -> &str {
        &self.dead_letter_exchange
    }

    pub fn dead_letter_routing_key(&self) -> &str {
        &self.dead_letter_routing_key
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn routing(&self) -> RetryRouting {
        self.routing
    }

    /// Consumer routing keys (key-preserving topology only).
    pub fn routing_keys(&self) -> &[String] {
        &self.routing_keys
    }

    /// Delay for the given attempt, as computed by the configured strategy.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.strategy.delay(attempt)
    }
}

impl fmt::Debug for CoordinatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorConfig")
            .field("exchange", &self.exchange)
            .field("exchange_durable", &self.exchange_durable)
            .field("queue_durable", &self.queue_durable)
            .field("queue_arguments", &self.queue_arguments)
            .field("max_retries", &self.max_retries)
            .field("strategy", &"<strategy>")
            .field("routing", &self.routing)
            .field("routing_keys", &self.routing_keys)
            .finish()
    }
}

/// Builder for [`CoordinatorConfig`]; validation happens in [`build`](Self::build).
pub struct CoordinatorConfigBuilder {
    exchange: String,
    exchange_durable: bool,
    queue_durable: bool,
    queue_arguments: QueueArguments,
    max_retries: u32,
    strategy: Option<Arc<dyn DelayStrategy>>,
    routing: RetryRouting,
    routing_keys: Vec<String>,
}

impl CoordinatorConfigBuilder {
    pub fn exchange_durable(mut self, durable: bool) -> Self {
        self.exchange_durable = durable;
        self
    }

    pub fn queue_durable(mut self, durable: bool) -> Self {
        self.queue_durable = durable;
        self
    }

    /// Add one primary-queue argument. The table must end up containing the
    /// dead-letter exchange and routing-key pair.
    pub fn queue_argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.queue_arguments.insert(key.into(), value.into());
        self
    }

    /// Replace the primary-queue argument table.
    pub fn queue_arguments(mut self, arguments: QueueArguments) -> Self {
        self.queue_arguments = arguments;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Supply the delay strategy. Mandatory: there is no default.
    pub fn delay_strategy(mut self, strategy: impl DelayStrategy + 'static) -> Self {
        self.strategy = Some(Arc::new(strategy));
        self
    }

    /// Supply the delay strategy as a bare function.
    pub fn delay_fn<F>(self, delay_fn: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.delay_strategy(Configurable::new(delay_fn))
    }

    pub fn routing(mut self, routing: RetryRouting) -> Self {
        self.routing = routing;
        self
    }

    /// Consumer routing keys bound at construction (key-preserving topology).
    pub fn routing_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routing_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> RedriveResult<CoordinatorConfig> {
        let Some(strategy) = self.strategy else {
            return Err(RedriveError::MissingDelayStrategy);
        };

        if self.exchange.is_empty() {
            return Err(RedriveError::InvalidConfig("exchange name must not be empty".into()));
        }

        if self.max_retries == 0 {
            return Err(RedriveError::InvalidConfig("max_retries must be at least 1".into()));
        }

        let dead_letter_exchange = required_string_argument(&self.queue_arguments, DEAD_LETTER_EXCHANGE_ARG)?;
        let dead_letter_routing_key =
            required_string_argument(&self.queue_arguments, DEAD_LETTER_ROUTING_KEY_ARG)?;

        Ok(CoordinatorConfig {
            exchange: self.exchange,
            exchange_durable: self.exchange_durable,
            queue_durable: self.queue_durable,
            queue_arguments: self.queue_arguments,
            dead_letter_exchange,
            dead_letter_routing_key,
            max_retries: self.max_retries,
            strategy,
            routing: self.routing,
            routing_keys: self.routing_keys,
        })
    }
}

impl fmt::Debug for CoordinatorConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorConfigBuilder")
            .field("exchange", &self.exchange)
            .field("max_retries", &self.max_retries)
            .field("strategy", &self.strategy.as_ref().map(|_| "<strategy>"))
            .field("routing", &self.routing)
            .finish_non_exhaustive()
    }
}

fn required_string_argument(arguments: &QueueArguments, key: &str) -> RedriveResult<String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            RedriveError::InvalidConfig(format!("queue arguments must carry a non-empty {key}"))
        })
}
