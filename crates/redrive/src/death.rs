//! Death-history metadata and the attempt counter.
//!
//! Every time the broker dead-letters a message (TTL expiry in a retry
//! queue, rejection past the retry budget) it records the event in the
//! message's `x-death` header: one entry per (queue, reason) pair with a
//! cumulative count. The coordinator derives the retry attempt number purely
//! from this metadata — there is no external counter store — and never writes
//! the header itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::Headers;

/// Header key under which the broker records dead-lettering events.
pub const DEATH_HEADER: &str = "x-death";

/// One dead-lettering record: a (queue, reason) pair with a cumulative count.
///
/// Entries accumulate monotonically and are owned by the broker; application
/// code only reads them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathRecord {
    /// Queue the message was dead-lettered from.
    pub queue: String,
    /// Why it was dead-lettered (`"expired"`, `"rejected"`, ...).
    pub reason: String,
    /// How many times this (queue, reason) pair has occurred.
    pub count: u64,
    /// Exchange the message had been published to.
    #[serde(default)]
    pub exchange: String,
    /// Routing keys the message carried when it was dead-lettered.
    #[serde(default, rename = "routing-keys")]
    pub routing_keys: Vec<String>,
}

/// Whether a death-history entry counts against the given primary queue.
///
/// Prefix matching is deliberate policy, not string-matching convenience:
/// retry-queue expiries report the *retry* queue's name
/// (`<queue>.retry.<delay>`), which nests the primary name as a prefix, so an
/// exact match would miss every retry hop. The flip side is a known
/// limitation: two distinct logical queues sharing a name prefix (`orders`
/// and `orders-archive`) mis-attribute each other's failures.
pub fn attributed_to(entry_queue: &str, primary_queue: &str) -> bool {
    entry_queue.starts_with(primary_queue)
}

/// Number of prior failed deliveries attributed to the given primary queue.
///
/// Sums the counts of all `x-death` entries whose queue name matches
/// [`attributed_to`]. Returns 0 when the header is absent, not an array, or
/// holds no attributable entries. Entries that fail to deserialize are
/// skipped, not fatal — the broker owns the format and unknown shapes must
/// not wedge the consumer.
pub fn failure_count(headers: Option<&Headers>, primary_queue: &str) -> u64 {
    let Some(entries) = headers.and_then(|h| h.get(DEATH_HEADER)).and_then(Value::as_array)
    else {
        return 0;
    };

    entries
        .iter()
        .filter_map(|entry| serde_json::from_value::<DeathRecord>(entry.clone()).ok())
        .filter(|record| attributed_to(&record.queue, primary_queue))
        .map(|record| record.count)
        .sum()
}
