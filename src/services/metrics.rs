use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Safe to call more than once; later
/// calls are no-ops (tests spin up several applications per process).
pub fn init_metrics() {
    if METRICS_HANDLE.get().is_some() {
        return;
    }
    if let Ok(handle) = PrometheusBuilder::new().install_recorder() {
        let _ = METRICS_HANDLE.set(handle);
    }
}

pub fn render_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string())
}

/// Count a payment lifecycle transition.
pub fn record_payment_transition(status: &'static str) {
    metrics::counter!("payment_transitions_total", "status" => status).increment(1);
}

/// Count a webhook event by type and processing outcome.
pub fn record_webhook_event(event: &str, outcome: &'static str) {
    metrics::counter!(
        "webhook_events_total",
        "event" => event.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Count a subscription lifecycle event.
pub fn record_subscription_event(kind: &'static str) {
    metrics::counter!("subscription_events_total", "kind" => kind).increment(1);
}

/// Count documents touched by a reconciliation sweep.
pub fn record_sweep(sweep: &'static str, count: u64) {
    metrics::counter!("reconciliation_sweep_actions_total", "sweep" => sweep).increment(count);
}
