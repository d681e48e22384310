use async_trait::async_trait;
use prometheus::{
    register_counter_with_registry, register_gauge_with_registry, register_histogram_with_registry,
    Counter, Gauge, Histogram, Registry,
};
use std::sync::Arc;

use zrc_broker::audit::{AuditError, AuditEvent, AuditSink};
use zrc_broker::relay::RelayStats;

pub struct BrokerMetrics {
    pub open_signal_queues: Gauge,
    pub queued_signals: Gauge,
    pub signals_posted: Counter,
    pub signals_delivered: Counter,
    pub signals_evicted: Counter,
    pub agent_polls: Counter,
    pub sessions_created: Counter,
    pub session_activations: Counter,
    pub sessions_ended: Counter,
    pub auth_failures: Counter,
    pub rate_limit_hits: Counter,
    pub error_counts: Counter,
    pub request_latency: Histogram,
    pub registry: Arc<Registry>,
}

impl BrokerMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let open_signal_queues = register_gauge_with_registry!(
            "zrc_broker_open_signal_queues",
            "Number of sessions with a signal queue",
            registry
        )?;

        let queued_signals = register_gauge_with_registry!(
            "zrc_broker_queued_signals",
            "Total number of signals held across all queues",
            registry
        )?;

        let signals_posted = register_counter_with_registry!(
            "zrc_broker_signals_posted_total",
            "Total number of signals posted",
            registry
        )?;

        let signals_delivered = register_counter_with_registry!(
            "zrc_broker_signals_delivered_total",
            "Total number of signals returned by polls",
            registry
        )?;

        let signals_evicted = register_counter_with_registry!(
            "zrc_broker_signals_evicted_total",
            "Total number of signals dropped by the length cap or TTL sweep",
            registry
        )?;

        let agent_polls = register_counter_with_registry!(
            "zrc_broker_agent_polls_total",
            "Total number of agent poll requests",
            registry
        )?;

        let sessions_created = register_counter_with_registry!(
            "zrc_broker_sessions_created_total",
            "Total number of sessions created",
            registry
        )?;

        let session_activations = register_counter_with_registry!(
            "zrc_broker_session_activations_total",
            "Total number of pending sessions moved to active",
            registry
        )?;

        let sessions_ended = register_counter_with_registry!(
            "zrc_broker_sessions_ended_total",
            "Total number of sessions ended",
            registry
        )?;

        let auth_failures = register_counter_with_registry!(
            "zrc_broker_auth_failures_total",
            "Total number of requests rejected with 401 or 403",
            registry
        )?;

        let rate_limit_hits = register_counter_with_registry!(
            "zrc_broker_rate_limit_hits_total",
            "Total number of rate limit hits",
            registry
        )?;

        let error_counts = register_counter_with_registry!(
            "zrc_broker_errors_total",
            "Total number of error responses",
            registry
        )?;

        let request_latency = register_histogram_with_registry!(
            "zrc_broker_request_latency_seconds",
            "Request latency in seconds",
            registry
        )?;

        Ok(Self {
            open_signal_queues,
            queued_signals,
            signals_posted,
            signals_delivered,
            signals_evicted,
            agent_polls,
            sessions_created,
            session_activations,
            sessions_ended,
            auth_failures,
            rate_limit_hits,
            error_counts,
            request_latency,
            registry,
        })
    }

    pub fn observe_relay(&self, stats: RelayStats) {
        self.open_signal_queues.set(stats.queues as f64);
        self.queued_signals.set(stats.messages as f64);
    }

    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %e, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Lifecycle counters are driven by the audit stream, so they count exactly what was audited.
#[async_trait]
impl AuditSink for BrokerMetrics {
    async fn emit(&self, event: AuditEvent) -> Result<(), AuditError> {
        match event {
            AuditEvent::SessionCreated { .. } => self.sessions_created.inc(),
            AuditEvent::AgentConnected { .. } => self.session_activations.inc(),
            AuditEvent::SessionEnded { .. } => self.sessions_ended.inc(),
            AuditEvent::AuthenticationFailed { .. } => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_audit_events_drive_lifecycle_counters() {
        let metrics = BrokerMetrics::new().unwrap();
        metrics
            .emit(AuditEvent::AgentConnected {
                session_id: "s1".into(),
                org_id: "org".into(),
                asset_id: "a".into(),
                agent_id: None,
                timestamp: 0,
            })
            .await
            .unwrap();
        assert_eq!(metrics.session_activations.get(), 1.0);
        assert_eq!(metrics.sessions_created.get(), 0.0);
    }

    #[test]
    fn test_export_contains_metric_names() {
        let metrics = BrokerMetrics::new().unwrap();
        metrics.signals_posted.inc();
        metrics.observe_relay(RelayStats { queues: 2, messages: 5 });

        let text = metrics.export_prometheus();
        assert!(text.contains("zrc_broker_signals_posted_total 1"));
        assert!(text.contains("zrc_broker_queued_signals 5"));
    }
}
