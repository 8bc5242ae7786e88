//! Telemetry Sink
//!
//! Emits the per-cycle health summary and due alerts as JSON payloads on the
//! `telemetry` tracing target, where a log shipper or MQTT bridge can pick
//! them up.

use serde::Serialize;
use tracing::{info, warn};

use ht_core::TelemetrySink;
use ht_protocol::{HealthSummary, SensorAlert};

pub struct LogTelemetry;

fn to_json<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!("TELEMETRY: failed to serialize payload: {}", e);
            None
        }
    }
}

impl TelemetrySink for LogTelemetry {
    fn publish_health(&self, cycle: u64, summary: &HealthSummary) {
        if let Some(payload) = to_json(summary) {
            info!(target: "telemetry", event = "health_summary", cycle, %payload);
        }
    }

    fn publish_alert(&self, alert: &SensorAlert) {
        if let Some(payload) = to_json(alert) {
            warn!(target: "telemetry", event = "sensor_alert", sensor = %alert.sensor_id, %payload);
        }
    }
}
