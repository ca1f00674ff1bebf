// Alert / metric sink: the narrow boundary the RPO controller reports
// through. None of these implementations are authoritative — the
// controller keeps its own bounded violation history independent of
// whatever the sink does with `record_violation`.

use crate::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Major,
    Critical,
    Emergency,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp_millis: u64,
}

#[derive(Debug, Clone)]
pub struct RpoMetric {
    pub timestamp_millis: u64,
    pub current_rpo_millis: u64,
    pub ceiling_millis: u64,
    pub checkpoint_age_millis: u64,
    pub wal_sync_age_millis: u64,
    pub active_violations: usize,
    pub compliance_ratio: f64,
}

#[derive(Debug, Clone)]
pub struct ViolationRecord {
    pub timestamp_millis: u64,
    pub measured_rpo_millis: u64,
    pub ceiling_millis: u64,
    pub severity: AlertSeverity,
    pub resolved: bool,
    pub resolved_at_millis: Option<u64>,
    pub cause: String,
}

/// Boundary the RPO controller reports violations, alerts, and metrics
/// through. Implementations are expected to be non-blocking; anything
/// that might take real time (network delivery, disk writes) should
/// happen asynchronously from the caller's point of view.
pub trait AlertSink: Send + Sync {
    fn send_alert(&self, alert: &Alert) -> Result<()>;
    fn record_metric(&self, metric: &RpoMetric) -> Result<()>;
    fn record_violation(&self, violation: &ViolationRecord) -> Result<()>;
}

/// Default sink: routes everything through `tracing`, the same as the
/// rest of the engine's operational logging.
#[derive(Default)]
pub struct LoggingAlertSink;

impl AlertSink for LoggingAlertSink {
    fn send_alert(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            AlertSeverity::Emergency | AlertSeverity::Critical => {
                error!(severity = ?alert.severity, "{}", alert.message)
            }
            AlertSeverity::Major | AlertSeverity::Warning => {
                warn!(severity = ?alert.severity, "{}", alert.message)
            }
            AlertSeverity::Info => info!(severity = ?alert.severity, "{}", alert.message),
        }
        Ok(())
    }

    fn record_metric(&self, metric: &RpoMetric) -> Result<()> {
        info!(
            current_rpo_millis = metric.current_rpo_millis,
            ceiling_millis = metric.ceiling_millis,
            active_violations = metric.active_violations,
            compliance_ratio = metric.compliance_ratio,
            "rpo metrics tick"
        );
        Ok(())
    }

    fn record_violation(&self, violation: &ViolationRecord) -> Result<()> {
        warn!(
            severity = ?violation.severity,
            measured_rpo_millis = violation.measured_rpo_millis,
            ceiling_millis = violation.ceiling_millis,
            resolved = violation.resolved,
            "{}", violation.cause
        );
        Ok(())
    }
}

/// In-memory sink for tests and embedders that want to assert on what
/// was reported without parsing log output.
#[derive(Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<VecDeque<Alert>>,
    metrics: Mutex<VecDeque<RpoMetric>>,
    violations: Mutex<VecDeque<ViolationRecord>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().iter().cloned().collect()
    }

    pub fn metrics(&self) -> Vec<RpoMetric> {
        self.metrics.lock().iter().cloned().collect()
    }

    pub fn violations(&self) -> Vec<ViolationRecord> {
        self.violations.lock().iter().cloned().collect()
    }
}

impl AlertSink for RecordingAlertSink {
    fn send_alert(&self, alert: &Alert) -> Result<()> {
        self.alerts.lock().push_back(alert.clone());
        Ok(())
    }

    fn record_metric(&self, metric: &RpoMetric) -> Result<()> {
        self.metrics.lock().push_back(metric.clone());
        Ok(())
    }

    fn record_violation(&self, violation: &ViolationRecord) -> Result<()> {
        self.violations.lock().push_back(violation.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_accumulates() {
        let sink = RecordingAlertSink::new();
        sink.send_alert(&Alert { severity: AlertSeverity::Major, message: "x".into(), timestamp_millis: 0 })
            .unwrap();
        assert_eq!(sink.alerts().len(), 1);
    }

    #[test]
    fn logging_sink_never_errors() {
        let sink = LoggingAlertSink;
        sink.send_alert(&Alert { severity: AlertSeverity::Info, message: "ok".into(), timestamp_millis: 0 })
            .unwrap();
    }
}
