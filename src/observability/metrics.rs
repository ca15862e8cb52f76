//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `gitops_events_processed_total` - Events processed by the worker
//! - `gitops_event_errors_total` - Events that ended in the error status
//! - `gitops_event_processing_duration_seconds` - Duration of event dispatch
//! - `gitops_writes_total` - Commits pushed to the gitops repository
//! - `gitops_release_state` - One sample per (env, app) release

use anyhow::Result;
use prometheus::{GaugeVec, Histogram, IntCounter, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static EVENTS_PROCESSED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitops_events_processed_total",
        "Total number of events processed by the worker",
    )
    .expect("Failed to create EVENTS_PROCESSED_TOTAL metric - this should never happen")
});

static EVENT_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitops_event_errors_total",
        "Total number of events that ended in the error status",
    )
    .expect("Failed to create EVENT_ERRORS_TOTAL metric - this should never happen")
});

static EVENT_PROCESSING_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "gitops_event_processing_duration_seconds",
            "Duration of event dispatch in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create EVENT_PROCESSING_DURATION metric - this should never happen")
});

static WRITES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "gitops_writes_total",
        "Total number of commits pushed to the gitops repository",
    )
    .expect("Failed to create WRITES_TOTAL metric - this should never happen")
});

static RELEASE_STATE: LazyLock<GaugeVec> = LazyLock::new(|| {
    GaugeVec::new(
        prometheus::Opts::new(
            "gitops_release_state",
            "Current release of every (env, app) pair",
        ),
        &["env", "app", "source_url", "commit_message", "gitops_ref", "created"],
    )
    .expect("Failed to create RELEASE_STATE metric - this should never happen")
});

/// Registers all metrics with the registry. Call once at startup.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(EVENTS_PROCESSED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(EVENT_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(EVENT_PROCESSING_DURATION.clone()))?;
    REGISTRY.register(Box::new(WRITES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RELEASE_STATE.clone()))?;
    Ok(())
}

pub fn increment_events_processed() {
    EVENTS_PROCESSED_TOTAL.inc();
}

pub fn increment_event_errors() {
    EVENT_ERRORS_TOTAL.inc();
}

pub fn observe_event_processing_duration(seconds: f64) {
    EVENT_PROCESSING_DURATION.observe(seconds);
}

pub fn increment_writes(count: u64) {
    WRITES_TOTAL.inc_by(count);
}

/// Clears all release-state samples before a fresh export round.
pub fn reset_release_state() {
    RELEASE_STATE.reset();
}

pub fn set_release_state(
    env: &str,
    app: &str,
    source_url: &str,
    commit_message: &str,
    gitops_ref: &str,
    created: &str,
) {
    RELEASE_STATE
        .with_label_values(&[env, app, source_url, commit_message, gitops_ref, created])
        .set(1.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Registration happens once per process; every test goes through
    // this guard so test ordering does not matter.
    static REGISTERED: LazyLock<bool> = LazyLock::new(|| register_metrics().is_ok());

    #[test]
    fn test_register_metrics() {
        assert!(*REGISTERED);
    }

    #[test]
    fn test_increment_events_processed() {
        let before = EVENTS_PROCESSED_TOTAL.get();
        increment_events_processed();
        let after = EVENTS_PROCESSED_TOTAL.get();
        assert_eq!(after, before + 1u64);
    }

    #[test]
    fn test_observe_event_processing_duration() {
        observe_event_processing_duration(1.5);
        // Just verify it doesn't panic - histogram observation doesn't return a value
    }

    #[test]
    fn test_release_state_reset() {
        assert!(*REGISTERED);
        set_release_state("staging", "my-app", "https://example.com", "msg", "abc", "now");
        let encoded = encode_registry();
        assert!(encoded.contains("my-app"));

        reset_release_state();
        let encoded = encode_registry();
        assert!(!encoded.contains("my-app"));
    }

    fn encode_registry() -> String {
        use prometheus::Encoder;

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&REGISTRY.gather(), &mut buffer)
            .unwrap();
        String::from_utf8(buffer).unwrap()
    }
}
