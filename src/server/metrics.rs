//! Prometheus metrics for the InstallPlan controller
//!
//! All collectors live in a private registry served on `/metrics`.

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Controller metrics shared between the reconciler and the health server
pub type SharedMetrics = Arc<ControllerMetrics>;

pub struct ControllerMetrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    reconcile_duration: HistogramVec,
    skipped: IntCounter,
    transitions: IntCounterVec,
    dispatches: IntCounterVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new(
                "kubext_reconciliations_total",
                "InstallPlan reconciliations by result",
            ),
            &["result"],
        )?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "kubext_reconcile_duration_seconds",
                "Time spent reconciling one InstallPlan",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["result"],
        )?;
        let skipped = IntCounter::new(
            "kubext_reconciliations_skipped_total",
            "Reconciliations skipped because this replica is not the leader",
        )?;
        let transitions = IntCounterVec::new(
            Opts::new(
                "kubext_state_transitions_total",
                "Committed installation state transitions",
            ),
            &["target", "state"],
        )?;
        let dispatches = IntCounterVec::new(
            Opts::new("kubext_executions_dispatched_total", "Execution jobs launched"),
            &["action"],
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(skipped.clone()))?;
        registry.register(Box::new(transitions.clone()))?;
        registry.register(Box::new(dispatches.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            reconcile_duration,
            skipped,
            transitions,
            dispatches,
        })
    }

    pub fn record_reconciliation_success(&self, duration_secs: f64) {
        self.record_reconciliation("success", duration_secs);
    }

    pub fn record_reconciliation_error(&self, duration_secs: f64) {
        self.record_reconciliation("error", duration_secs);
    }

    fn record_reconciliation(&self, result: &str, duration_secs: f64) {
        self.reconciliations.with_label_values(&[result]).inc();
        self.reconcile_duration
            .with_label_values(&[result])
            .observe(duration_secs);
    }

    pub fn record_reconciliation_skipped(&self) {
        self.skipped.inc();
    }

    /// `target` is `host` or `member`, never the cluster name
    pub fn record_transition(&self, target: &str, state: &str) {
        self.transitions.with_label_values(&[target, state]).inc();
    }

    pub fn record_dispatch(&self, action: &str) {
        self.dispatches.with_label_values(&[action]).inc();
    }

    /// Text exposition format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_recorded_series() {
        let metrics = create_metrics().unwrap();
        metrics.record_reconciliation_success(0.2);
        metrics.record_reconciliation_error(0.0);
        metrics.record_transition("host", "Installing");
        metrics.record_dispatch("install");

        let body = metrics.encode().unwrap();
        assert!(body.contains("kubext_reconciliations_total{result=\"success\"} 1"));
        assert!(body.contains("kubext_reconciliations_total{result=\"error\"} 1"));
        assert!(body.contains("kubext_state_transitions_total{state=\"Installing\",target=\"host\"} 1"));
        assert!(body.contains("kubext_executions_dispatched_total{action=\"install\"} 1"));
    }

    #[test]
    fn test_skipped_counter() {
        let metrics = create_metrics().unwrap();
        metrics.record_reconciliation_skipped();
        metrics.record_reconciliation_skipped();

        assert!(metrics
            .encode()
            .unwrap()
            .contains("kubext_reconciliations_skipped_total 2"));
    }

    #[test]
    fn test_registries_are_independent() {
        let first = create_metrics().unwrap();
        let second = create_metrics().unwrap();
        first.record_dispatch("upgrade");

        assert!(!second.encode().unwrap().contains("action=\"upgrade\""));
    }
}
