use prometheus::{
    register_counter_with_registry, register_gauge_with_registry, register_histogram_with_registry,
    Counter, Gauge, Histogram, Registry,
};
use std::sync::Arc;

use pairgate_core::{FailureKind, SessionPhase, SessionReport};

pub struct PairingMetrics {
    pub active_sessions: Gauge,
    pub sessions_started: Counter,
    pub codes_issued: Counter,
    pub sessions_paired: Counter,
    pub sessions_failed: Counter,
    pub sessions_timed_out: Counter,
    pub onboarding_payloads_sent: Counter,
    pub onboarding_failures: Counter,
    pub rate_limit_hits: Counter,
    pub time_to_code: Histogram,
    pub registry: Arc<Registry>,
}

impl PairingMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let active_sessions = register_gauge_with_registry!(
            "pairgate_active_sessions",
            "Number of pairing sessions still running",
            registry
        )?;

        let sessions_started = register_counter_with_registry!(
            "pairgate_sessions_started_total",
            "Total number of pairing sessions started",
            registry
        )?;

        let codes_issued = register_counter_with_registry!(
            "pairgate_codes_issued_total",
            "Total number of pairing codes returned to a caller",
            registry
        )?;

        let sessions_paired = register_counter_with_registry!(
            "pairgate_sessions_paired_total",
            "Total number of sessions approved by the remote party",
            registry
        )?;

        let sessions_failed = register_counter_with_registry!(
            "pairgate_sessions_failed_total",
            "Total number of sessions that ended unpaired, excluding timeouts",
            registry
        )?;

        let sessions_timed_out = register_counter_with_registry!(
            "pairgate_sessions_timed_out_total",
            "Total number of sessions that hit the pairing deadline",
            registry
        )?;

        let onboarding_payloads_sent = register_counter_with_registry!(
            "pairgate_onboarding_payloads_sent_total",
            "Total number of onboarding payloads sent",
            registry
        )?;

        let onboarding_failures = register_counter_with_registry!(
            "pairgate_onboarding_failures_total",
            "Total number of onboarding sequences aborted by a failed send",
            registry
        )?;

        let rate_limit_hits = register_counter_with_registry!(
            "pairgate_rate_limit_hits_total",
            "Total number of rate limit hits",
            registry
        )?;

        let time_to_code = register_histogram_with_registry!(
            "pairgate_time_to_code_seconds",
            "Time from session start to the first pairing code",
            registry
        )?;

        Ok(Self {
            active_sessions,
            sessions_started,
            codes_issued,
            sessions_paired,
            sessions_failed,
            sessions_timed_out,
            onboarding_payloads_sent,
            onboarding_failures,
            rate_limit_hits,
            time_to_code,
            registry,
        })
    }

    /// Fold a finished session into the counters.
    pub fn record_report(&self, report: &SessionReport) {
        if let Some(elapsed) = report.time_to_code {
            self.codes_issued.inc();
            self.time_to_code.observe(elapsed.as_secs_f64());
        }

        if report.paired {
            self.sessions_paired.inc();
        } else if report.phase == SessionPhase::Failed(FailureKind::TimedOut) {
            self.sessions_timed_out.inc();
        } else {
            self.sessions_failed.inc();
        }

        if let Some(delivery) = &report.delivery {
            self.onboarding_payloads_sent.inc_by(delivery.sent.len() as f64);
            if !delivery.is_complete() {
                self.onboarding_failures.inc();
            }
        }
    }

    pub fn export_prometheus(&self) -> anyhow::Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
