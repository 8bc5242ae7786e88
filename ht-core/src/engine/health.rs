//! Sensor health tracking
//!
//! One record per known sensor, updated once per cycle:
//!
//! - a reading arrives: HEALTHY, becomes the new last-known-good value
//! - no reading, last-known-good younger than the stale threshold: DEGRADED,
//!   the fallback value is used
//! - no reading and nothing fresh to fall back on: FAILED, no value
//!
//! Alerts are a pure function of the consecutive error counter: due when it
//! first reaches the alert threshold and every repeat interval after that.

use std::collections::BTreeMap;

use chrono::TimeDelta;
use ht_protocol::{HealthSummary, SensorAlert, SensorHealthView, SensorStatus, TemperatureSnapshot, Timestamp};
use tracing::{error, info, warn};

use crate::settings::HealthSettings;

#[derive(Debug, Clone, PartialEq)]
pub struct SensorHealthRecord {
    pub sensor_id: String,
    pub status: SensorStatus,
    pub last_good_value: Option<f64>,
    pub last_good_time: Option<Timestamp>,
    pub consecutive_errors: u32,
    pub total_errors: u64,
}

impl SensorHealthRecord {
    fn new(sensor_id: &str) -> Self {
        // No reading yet means nothing usable.
        Self {
            sensor_id: sensor_id.to_string(),
            status: SensorStatus::Failed,
            last_good_value: None,
            last_good_time: None,
            consecutive_errors: 0,
            total_errors: 0,
        }
    }
}

/// Status and the value callers should use for this cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthOutcome {
    pub status: SensorStatus,
    pub value: Option<f64>,
}

/// Whether an alert is due at this consecutive error count
pub fn alert_due(consecutive_errors: u32, alert_threshold: u32, repeat_interval: u32) -> bool {
    if alert_threshold == 0 || consecutive_errors < alert_threshold {
        return false;
    }
    (consecutive_errors - alert_threshold) % repeat_interval.max(1) == 0
}

pub struct HealthTracker {
    stale_threshold: TimeDelta,
    alert_threshold: u32,
    alert_repeat_interval: u32,
    records: BTreeMap<String, SensorHealthRecord>,
}

impl HealthTracker {
    pub fn new<I, S>(sensor_ids: I, settings: &HealthSettings) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let records = sensor_ids
            .into_iter()
            .map(|id| {
                let id = id.as_ref();
                (id.to_string(), SensorHealthRecord::new(id))
            })
            .collect();

        Self {
            stale_threshold: settings.stale_threshold(),
            alert_threshold: settings.alert_threshold,
            alert_repeat_interval: settings.alert_repeat_interval,
            records,
        }
    }

    /// Fold one cycle's reading (or its absence) into the sensor's record.
    ///
    /// # Panics
    ///
    /// Panics if `sensor_id` was not registered at construction; feeding an
    /// unknown sensor is a wiring bug, not a hardware condition.
    pub fn process(&mut self, sensor_id: &str, reading: Option<f64>, now: Timestamp) -> HealthOutcome {
        let stale_threshold = self.stale_threshold;
        let record = self.record_mut(sensor_id);
        let previous = record.status;

        let outcome = match reading {
            Some(value) => {
                record.last_good_value = Some(value);
                record.last_good_time = Some(now);
                record.consecutive_errors = 0;
                record.status = SensorStatus::Healthy;
                HealthOutcome {
                    status: SensorStatus::Healthy,
                    value: Some(value),
                }
            }
            None => {
                record.consecutive_errors = record.consecutive_errors.saturating_add(1);
                record.total_errors = record.total_errors.saturating_add(1);

                let fresh = match (record.last_good_value, record.last_good_time) {
                    (Some(value), Some(at)) if now - at < stale_threshold => Some(value),
                    _ => None,
                };

                match fresh {
                    Some(value) => {
                        record.status = SensorStatus::Degraded;
                        HealthOutcome {
                            status: SensorStatus::Degraded,
                            value: Some(value),
                        }
                    }
                    None => {
                        record.status = SensorStatus::Failed;
                        HealthOutcome {
                            status: SensorStatus::Failed,
                            value: None,
                        }
                    }
                }
            }
        };

        if previous != outcome.status {
            let errors = record.consecutive_errors;
            match outcome.status {
                SensorStatus::Healthy => info!(sensor = %sensor_id, "HEALTH: sensor recovered"),
                SensorStatus::Degraded => warn!(
                    sensor = %sensor_id,
                    consecutive_errors = errors,
                    fallback = ?record.last_good_value,
                    "HEALTH: sensor degraded, using last known good value"
                ),
                SensorStatus::Failed => error!(
                    sensor = %sensor_id,
                    consecutive_errors = errors,
                    "HEALTH: sensor failed, no usable value"
                ),
            }
        }

        outcome
    }

    /// Process every known sensor against one cycle's raw values and return
    /// the sanitized snapshot. Sensors missing from `raw` count as absent.
    pub fn sanitize(&mut self, raw: &TemperatureSnapshot, now: Timestamp) -> TemperatureSnapshot {
        let ids: Vec<String> = self.records.keys().cloned().collect();
        ids.into_iter()
            .map(|id| {
                let reading = raw.get(&id).copied().flatten();
                let outcome = self.process(&id, reading, now);
                (id, outcome.value)
            })
            .collect()
    }

    /// Whether an alert is due for the sensor right now
    ///
    /// # Panics
    ///
    /// Panics if `sensor_id` is unknown.
    pub fn should_alert(&self, sensor_id: &str) -> bool {
        let record = self.record(sensor_id);
        alert_due(
            record.consecutive_errors,
            self.alert_threshold,
            self.alert_repeat_interval,
        )
    }

    pub fn status(&self, sensor_id: &str) -> SensorStatus {
        self.record(sensor_id).status
    }

    pub fn get(&self, sensor_id: &str) -> Option<&SensorHealthRecord> {
        self.records.get(sensor_id)
    }

    pub fn sensor_ids(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    /// Aggregate, side-effect-free health view
    pub fn summary(&self) -> HealthSummary {
        let mut summary = HealthSummary::default();
        for (id, record) in &self.records {
            match record.status {
                SensorStatus::Healthy => summary.healthy_count += 1,
                SensorStatus::Degraded => {
                    summary.degraded_count += 1;
                    summary.degraded_sensors.push(id.clone());
                }
                SensorStatus::Failed => {
                    summary.failed_count += 1;
                    summary.failed_sensors.push(id.clone());
                }
            }
            if self.should_alert(id) {
                summary.alerts_due.push(id.clone());
            }
        }
        summary
    }

    /// Alerts due this cycle, ready for publication
    pub fn alerts(&self, now: Timestamp) -> Vec<SensorAlert> {
        self.records
            .values()
            .filter(|r| self.should_alert(&r.sensor_id))
            .map(|r| SensorAlert {
                sensor_id: r.sensor_id.clone(),
                status: r.status,
                consecutive_errors: r.consecutive_errors,
                timestamp: now,
            })
            .collect()
    }

    pub fn sensor_views(&self, now: Timestamp) -> Vec<SensorHealthView> {
        self.records
            .values()
            .map(|r| SensorHealthView {
                sensor_id: r.sensor_id.clone(),
                status: r.status,
                last_good_value: r.last_good_value,
                last_good_age_secs: r
                    .last_good_time
                    .map(|at| (now - at).num_milliseconds() as f64 / 1000.0),
                consecutive_errors: r.consecutive_errors,
                total_errors: r.total_errors,
            })
            .collect()
    }

    fn record(&self, sensor_id: &str) -> &SensorHealthRecord {
        match self.records.get(sensor_id) {
            Some(record) => record,
            None => panic!("health tracker has no record for sensor {:?}", sensor_id),
        }
    }

    fn record_mut(&mut self, sensor_id: &str) -> &mut SensorHealthRecord {
        match self.records.get_mut(sensor_id) {
            Some(record) => record,
            None => panic!("health tracker has no record for sensor {:?}", sensor_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2025, 6, 21, 12, 0, 0).unwrap()
    }

    fn tracker() -> HealthTracker {
        HealthTracker::new(["collector", "tank_top"], &HealthSettings::default())
    }

    #[test]
    fn test_reading_makes_sensor_healthy() {
        let mut health = tracker();
        let outcome = health.process("collector", Some(65.0), t0());
        assert_eq!(outcome, HealthOutcome { status: SensorStatus::Healthy, value: Some(65.0) });

        let record = health.get("collector").unwrap();
        assert_eq!(record.last_good_value, Some(65.0));
        assert_eq!(record.last_good_time, Some(t0()));
        assert_eq!(record.consecutive_errors, 0);
    }

    #[test]
    fn test_degraded_then_failed_when_stale() {
        let mut health = tracker();
        let cycle = TimeDelta::seconds(5);
        health.process("collector", Some(65.0), t0());

        // 59 misses at 5s spacing: 295s old, still fresh
        for k in 1..=59 {
            let outcome = health.process("collector", None, t0() + cycle * k);
            assert_eq!(outcome.status, SensorStatus::Degraded);
            assert_eq!(outcome.value, Some(65.0));
        }

        // 300s is not below the 300s threshold
        let outcome = health.process("collector", None, t0() + cycle * 60);
        assert_eq!(outcome, HealthOutcome { status: SensorStatus::Failed, value: None });
        assert_eq!(health.get("collector").unwrap().consecutive_errors, 60);
    }

    #[test]
    fn test_never_read_sensor_fails_immediately() {
        let mut health = tracker();
        let outcome = health.process("tank_top", None, t0());
        assert_eq!(outcome.status, SensorStatus::Failed);
        assert_eq!(outcome.value, None);
    }

    #[test]
    fn test_success_resets_consecutive_errors() {
        let mut health = tracker();
        for k in 0..12 {
            health.process("tank_top", None, t0() + TimeDelta::seconds(k));
        }
        let outcome = health.process("tank_top", Some(40.0), t0() + TimeDelta::seconds(12));
        assert_eq!(outcome.status, SensorStatus::Healthy);

        let record = health.get("tank_top").unwrap();
        assert_eq!(record.consecutive_errors, 0);
        assert_eq!(record.total_errors, 12);
        assert!(!health.should_alert("tank_top"));
    }

    #[test]
    fn test_alert_cadence() {
        let due: Vec<u32> = (0..=40).filter(|&n| alert_due(n, 5, 10)).collect();
        assert_eq!(due, vec![5, 15, 25, 35]);
    }

    #[test]
    fn test_should_alert_follows_counter() {
        let mut health = tracker();
        let mut fired = Vec::new();
        for k in 1..=26 {
            health.process("collector", None, t0() + TimeDelta::seconds(k));
            if health.should_alert("collector") {
                fired.push(k);
            }
        }
        assert_eq!(fired, vec![5, 15, 25]);
        assert_eq!(health.alerts(t0()).len(), 0);
    }

    #[test]
    fn test_summary_lists_unhealthy_sensors() {
        let mut health = HealthTracker::new(["a", "b", "c"], &HealthSettings::default());
        health.process("a", Some(20.0), t0());
        health.process("b", Some(20.0), t0());
        for k in 1..=5 {
            let now = t0() + TimeDelta::seconds(k);
            health.process("a", Some(21.0), now);
            health.process("b", None, now);
            health.process("c", None, now);
        }

        let summary = health.summary();
        assert_eq!(summary.healthy_count, 1);
        assert_eq!(summary.degraded_count, 1);
        assert_eq!(summary.failed_count, 1);
        assert_eq!(summary.degraded_sensors, vec!["b"]);
        assert_eq!(summary.failed_sensors, vec!["c"]);
        assert_eq!(summary.alerts_due, vec!["b", "c"]);

        let alerts = health.alerts(t0());
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].consecutive_errors, 5);
    }

    #[test]
    fn test_sanitize_uses_fallbacks() {
        let mut health = tracker();
        let mut raw = TemperatureSnapshot::new();
        raw.insert("collector".to_string(), Some(70.0));
        raw.insert("tank_top".to_string(), Some(50.0));
        health.sanitize(&raw, t0());

        let mut raw = TemperatureSnapshot::new();
        raw.insert("collector".to_string(), None);
        let snapshot = health.sanitize(&raw, t0() + TimeDelta::seconds(5));
        assert_eq!(snapshot["collector"], Some(70.0));
        assert_eq!(snapshot["tank_top"], Some(50.0));
        assert_eq!(health.status("tank_top"), SensorStatus::Degraded);
    }

    #[test]
    fn test_sensor_views_report_age() {
        let mut health = tracker();
        health.process("collector", Some(70.0), t0());
        let views = health.sensor_views(t0() + TimeDelta::milliseconds(2500));
        let collector = views.iter().find(|v| v.sensor_id == "collector").unwrap();
        assert_eq!(collector.last_good_age_secs, Some(2.5));
    }

    #[test]
    #[should_panic(expected = "no record for sensor")]
    fn test_unknown_sensor_panics() {
        let mut health = tracker();
        health.process("attic", Some(20.0), t0());
    }
}
