//! Deterministic hardware channel for tests and dry runs
//!
//! Each sensor replays a queue of scripted steps; once the queue is drained
//! the last step repeats forever. Unscripted sensors fail.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;
use crate::hw::HardwareChannel;
use crate::HeliothermError;

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Value(f64),
    Fail(String),
    /// Block the calling thread, then fail
    Stall(Duration),
}

#[derive(Debug, Default)]
struct SensorScript {
    queue: VecDeque<ScriptStep>,
    last: Option<ScriptStep>,
    calls: u32,
}

#[derive(Debug, Default)]
pub struct ScriptedChannel {
    sensors: Mutex<HashMap<String, SensorScript>>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the sensor's script
    pub fn script(&self, sensor_id: &str, steps: impl IntoIterator<Item = ScriptStep>) {
        let mut sensors = self.sensors.lock();
        let script = sensors.entry(sensor_id.to_string()).or_default();
        script.queue = steps.into_iter().collect();
        script.last = None;
    }

    /// Sensor reads `value` from now on
    pub fn set_value(&self, sensor_id: &str, value: f64) {
        self.script(sensor_id, [ScriptStep::Value(value)]);
    }

    /// Sensor fails from now on
    pub fn fail_always(&self, sensor_id: &str) {
        self.script(sensor_id, [ScriptStep::Fail("probe disconnected".to_string())]);
    }

    /// Sensor fails `failures` times, then reads `value` from then on
    pub fn fail_then(&self, sensor_id: &str, failures: usize, value: f64) {
        let steps = std::iter::repeat(ScriptStep::Fail("bus contention".to_string()))
            .take(failures)
            .chain(std::iter::once(ScriptStep::Value(value)));
        self.script(sensor_id, steps);
    }

    /// Number of reads issued for the sensor so far
    pub fn calls(&self, sensor_id: &str) -> u32 {
        self.sensors.lock().get(sensor_id).map(|s| s.calls).unwrap_or(0)
    }

    fn next_step(&self, sensor_id: &str) -> Option<ScriptStep> {
        let mut sensors = self.sensors.lock();
        let script = sensors.get_mut(sensor_id)?;
        script.calls += 1;
        match script.queue.pop_front() {
            Some(step) => {
                script.last = Some(step.clone());
                Some(step)
            }
            None => script.last.clone(),
        }
    }
}

impl HardwareChannel for ScriptedChannel {
    fn read_sensor(&self, sensor_id: &str) -> Result<f64> {
        // Lock is released before any stall so other sensors keep reading.
        match self.next_step(sensor_id) {
            Some(ScriptStep::Value(v)) => Ok(v),
            Some(ScriptStep::Fail(reason)) => Err(HeliothermError::sensor_read(sensor_id, reason)),
            Some(ScriptStep::Stall(duration)) => {
                std::thread::sleep(duration);
                Err(HeliothermError::sensor_read(sensor_id, "stalled"))
            }
            None => Err(HeliothermError::sensor_read(sensor_id, "not scripted")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_step_is_sticky() {
        let channel = ScriptedChannel::new();
        channel.fail_then("collector", 2, 55.0);

        assert!(channel.read_sensor("collector").is_err());
        assert!(channel.read_sensor("collector").is_err());
        assert_eq!(channel.read_sensor("collector").unwrap(), 55.0);
        assert_eq!(channel.read_sensor("collector").unwrap(), 55.0);
        assert_eq!(channel.calls("collector"), 4);
    }

    #[test]
    fn test_unscripted_sensor_fails() {
        let channel = ScriptedChannel::new();
        assert!(channel.read_sensor("nowhere").is_err());
        assert_eq!(channel.calls("nowhere"), 0);
    }
}
