//! Testing utilities.
//!
//! Provides [`MemoryBroker`], an in-process [`crate::BrokerChannel`]
//! implementation with topic routing, dead-letter semantics, and
//! virtual-clock TTL expiry, so retry flows can be exercised end-to-end
//! without a broker and without sleeping. Exported for downstream test
//! suites as well as this crate's own.

mod broker;

pub use broker::MemoryBroker;
