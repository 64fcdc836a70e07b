use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and describe all metrics
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    init_metric_descriptions();

    Ok(handle)
}

/// Describe metrics (can be called multiple times safely)
fn init_metric_descriptions() {
    describe_counter!(
        "profileboard_profiles_total",
        "Profiles assembled, by outcome"
    );
    describe_counter!(
        "profileboard_dropped_events_total",
        "Events dropped because their request context was missing or finalizing"
    );
    describe_counter!(
        "profileboard_invariant_violations_total",
        "Events excluded because they referenced state from another request"
    );
    describe_counter!(
        "profileboard_diagnostics_total",
        "Diagnostics produced by the analyzer"
    );
    describe_counter!(
        "profileboard_subscriber_drops_total",
        "Profiles dropped from full live-stream subscriber queues"
    );
    describe_counter!(
        "profileboard_persistence_failures_total",
        "Failed attempts to persist a profile batch"
    );
    describe_counter!(
        "profileboard_persistence_discarded_total",
        "Profiles given up on for persistence"
    );
    describe_histogram!(
        "profileboard_request_duration_seconds",
        "Duration of profiled requests"
    );
    describe_gauge!(
        "profileboard_active_contexts",
        "Requests currently being profiled"
    );

    gauge!("profileboard_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

pub fn record_profile(outcome: &'static str, duration: Duration) {
    counter!("profileboard_profiles_total", "outcome" => outcome).increment(1);
    histogram!("profileboard_request_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_dropped_event(kind: &'static str) {
    counter!("profileboard_dropped_events_total", "kind" => kind).increment(1);
}

pub fn record_invariant_violation() {
    counter!("profileboard_invariant_violations_total").increment(1);
}

pub fn record_diagnostic(kind: &'static str) {
    counter!("profileboard_diagnostics_total", "kind" => kind).increment(1);
}

pub fn record_subscriber_drop() {
    counter!("profileboard_subscriber_drops_total").increment(1);
}

pub fn record_persistence_failure() {
    counter!("profileboard_persistence_failures_total").increment(1);
}

pub fn record_persistence_discarded(count: u64) {
    counter!("profileboard_persistence_discarded_total").increment(count);
}

pub fn set_active_contexts(count: usize) {
    gauge!("profileboard_active_contexts").set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_metrics() {
        init_metric_descriptions();

        // Without an installed recorder these are no-ops; they must not panic
        record_profile("completed", Duration::from_millis(120));
        record_dropped_event("query");
        record_invariant_violation();
        record_diagnostic("n_plus_one");
        record_subscriber_drop();
        record_persistence_failure();
        record_persistence_discarded(3);
        set_active_contexts(2);
    }
}
