//! Read caches shared with other threads
//!
//! Written only from the calculation graph; cloned handles read them
//! concurrently under a reader/writer lock.

pub mod endpoints;
pub mod nflog;

pub use endpoints::{EndpointData, EndpointLookupsCache};
pub use nflog::{Direction, NflogLookupsCache, NflogPrefix, RuleId, RuleIndex};
