//! Telemetry publication
//!
//! Fire-and-forget: a sink never reports failure back into the control loop.
//! Each cycle publishes one health summary and one alert per sensor whose
//! alert is due.

use parking_lot::Mutex;

use ht_protocol::{HealthSummary, SensorAlert};

pub trait TelemetrySink: Send + Sync {
    fn publish_health(&self, cycle: u64, summary: &HealthSummary);
    fn publish_alert(&self, alert: &SensorAlert);
}

/// Sink that drops everything
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn publish_health(&self, _cycle: u64, _summary: &HealthSummary) {}
    fn publish_alert(&self, _alert: &SensorAlert) {}
}

/// Publish one cycle's messages: the summary always, alerts only when due
pub fn publish_cycle(sink: &dyn TelemetrySink, cycle: u64, summary: &HealthSummary, alerts: &[SensorAlert]) {
    sink.publish_health(cycle, summary);
    for alert in alerts {
        sink.publish_alert(alert);
    }
}

/// In-memory sink for tests and local inspection
#[derive(Default)]
pub struct MemoryTelemetry {
    health: Mutex<Vec<(u64, HealthSummary)>>,
    alerts: Mutex<Vec<SensorAlert>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn health_messages(&self) -> Vec<(u64, HealthSummary)> {
        self.health.lock().clone()
    }

    pub fn alerts(&self) -> Vec<SensorAlert> {
        self.alerts.lock().clone()
    }
}

impl TelemetrySink for MemoryTelemetry {
    fn publish_health(&self, cycle: u64, summary: &HealthSummary) {
        self.health.lock().push((cycle, summary.clone()));
    }

    fn publish_alert(&self, alert: &SensorAlert) {
        self.alerts.lock().push(alert.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ht_protocol::SensorStatus;

    #[test]
    fn test_publish_cycle_sends_summary_and_alerts() {
        let sink = MemoryTelemetry::new();
        let alert = SensorAlert {
            sensor_id: "collector".into(),
            status: SensorStatus::Failed,
            consecutive_errors: 5,
            timestamp: Utc::now(),
        };
        publish_cycle(&sink, 7, &HealthSummary::default(), &[alert.clone()]);
        publish_cycle(&sink, 8, &HealthSummary::default(), &[]);

        let health = sink.health_messages();
        assert_eq!(health.len(), 2);
        assert_eq!(health[0].0, 7);
        assert_eq!(sink.alerts(), vec![alert]);
    }
}
