//! Metrics registry for strata observability
//!
//! Provides OpenTelemetry metrics for:
//! - Datastore updates fed into the calculation graph
//! - Dataplane messages flushed by the event sequencer
//! - Flush latency
//! - Invariant violations

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for strata metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("strata"));

// ============================================================================
// Calculation Graph Metrics
// ============================================================================

/// Counter of datastore updates processed by the graph
///
/// Labels:
/// - `kind`: workload_endpoint, policy, tier, profile, ...
pub static UPDATES_PROCESSED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("strata_updates_processed_total")
        .with_description("Total number of datastore updates processed by the calculation graph")
        .with_unit("{updates}")
        .build()
});

/// Counter of invariant violations reported by the graph
///
/// Labels:
/// - `error_type`: refcount_underflow, lifecycle, invalid_selector, ...
pub static INVARIANT_VIOLATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("strata_invariant_violations_total")
        .with_description("Total number of fatal invariant violations")
        .with_unit("{errors}")
        .build()
});

// ============================================================================
// Sequencer Metrics
// ============================================================================

/// Counter of dataplane messages emitted by flushes
///
/// Labels:
/// - `type`: ip_set_update, active_policy_update, route_remove, ...
pub static MESSAGES_FLUSHED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("strata_messages_flushed_total")
        .with_description("Total number of dataplane messages emitted by the sequencer")
        .with_unit("{messages}")
        .build()
});

/// Histogram of sequencer flush duration
pub static FLUSH_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("strata_flush_duration_seconds")
        .with_description("Duration of sequencer flushes in seconds")
        .with_unit("s")
        .build()
});

// ============================================================================
// Helper Functions
// ============================================================================

/// Record one processed update of the given kind
pub fn record_update(kind: &'static str) {
    UPDATES_PROCESSED.add(1, &[KeyValue::new("kind", kind)]);
}

/// Record one flushed message of the given type
pub fn record_message(message_type: &'static str) {
    MESSAGES_FLUSHED.add(1, &[KeyValue::new("type", message_type)]);
}

/// Record an invariant violation
pub fn record_violation(error_type: &'static str) {
    INVARIANT_VIOLATIONS.add(1, &[KeyValue::new("error_type", error_type)]);
}

/// Record a sequencer flush with timing
pub struct FlushTimer {
    start: std::time::Instant,
}

impl FlushTimer {
    /// Start timing a flush
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Record completion, labelled with the number of messages emitted
    pub fn finish(self, messages: usize) {
        let duration = self.start.elapsed().as_secs_f64();
        FLUSH_DURATION.record(
            duration,
            &[KeyValue::new("empty", messages == 0)],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_provider_is_noop() {
        record_update("policy");
        record_message("ip_set_update");
        record_violation("lifecycle");
        FlushTimer::start().finish(3);
    }
}
