//! Backoff delay strategies.
//!
//! A strategy maps a failure attempt number (1-based) to the delay the
//! message should wait before redelivery. Strategies must be pure and
//! deterministic for a fixed configuration: the delay value is baked into
//! retry queue names, so a wandering strategy would leak one broker queue per
//! produced value instead of reusing the queue per attempt number.
//!
//! New strategies are added by implementing [`DelayStrategy`]; the
//! coordinator is never modified for a new backoff shape.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Maps an attempt number to a redelivery delay.
pub trait DelayStrategy: Send + Sync {
    /// Delay to apply before the given attempt is redelivered.
    ///
    /// `attempt` is 1-based: the first failure asks for `delay(1)`. Must be
    /// deterministic and non-negative for a fixed configuration. Strategies
    /// producing values outside the representable range are the caller's
    /// responsibility; such values collapse to zero.
    fn delay(&self, attempt: u32) -> Duration;
}

/// Wraps a caller-supplied delay function.
///
/// This is the extension point for ad-hoc backoff shapes:
///
/// ```
/// use std::time::Duration;
/// use redrive::{Configurable, DelayStrategy};
///
/// // wait 1 minute on the first retry, 2 on the next, then 3, ...
/// let strategy = Configurable::new(|attempt| Duration::from_secs(u64::from(attempt) * 60));
/// assert_eq!(strategy.delay(2), Duration::from_secs(120));
/// ```
#[derive(Clone)]
pub struct Configurable {
    delay_fn: Arc<dyn Fn(u32) -> Duration + Send + Sync>,
}

impl Configurable {
    pub fn new<F>(delay_fn: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self { delay_fn: Arc::new(delay_fn) }
    }
}

impl DelayStrategy for Configurable {
    fn delay(&self, attempt: u32) -> Duration {
        (self.delay_fn)(attempt)
    }
}

impl fmt::Debug for Configurable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Configurable(<function>)")
    }
}

/// Power-law backoff: `delay(n) = scale * n^exponent` seconds.
///
/// With the defaults (`scale = 1`, `exponent = 2`) the delays are 1, 4, 9,
/// 16, ... seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerLaw {
    scale: f64,
    exponent: f64,
}

impl Default for PowerLaw {
    fn default() -> Self {
        Self { scale: 1.0, exponent: 2.0 }
    }
}

impl PowerLaw {
    pub fn new(scale: f64, exponent: f64) -> Self {
        Self { scale, exponent }
    }
}

impl DelayStrategy for PowerLaw {
    fn delay(&self, attempt: u32) -> Duration {
        duration_secs(self.scale * f64::from(attempt).powf(self.exponent))
    }
}

/// Conventional exponential backoff: `delay(n) = (2^n - 1) / 2` seconds.
///
/// Produces the canonical 0.5, 1.5, 3.5, 7.5, 15.5, 31.5, ... sequence,
/// doubling the prior cumulative wait on each attempt. At the default retry
/// budget of 25 the final delay is a bit over 194 days.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConventionalExponential;

impl DelayStrategy for ConventionalExponential {
    fn delay(&self, attempt: u32) -> Duration {
        let attempt = i32::try_from(attempt).unwrap_or(i32::MAX);
        duration_secs((2f64.powi(attempt) - 1.0) / 2.0)
    }
}

/// Canonical text rendering of a delay for queue names and routing keys.
///
/// Decimal seconds with the fractional part trimmed: `0.5`, `1`, `1.5`, `7`.
/// Derived from whole milliseconds so it agrees exactly with the
/// `x-message-ttl` argument of the queue it names; sub-millisecond precision
/// is truncated for both.
pub fn delay_token(delay: Duration) -> String {
    let millis = delay.as_millis();
    if millis % 1_000 == 0 {
        (millis / 1_000).to_string()
    } else {
        format!("{}", millis as f64 / 1_000.0)
    }
}

fn duration_secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
