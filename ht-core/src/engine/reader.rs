//! Retrying sensor reader
//!
//! Wraps [`HardwareChannel`] reads with bounded retries and exponential
//! backoff. Exhausting every attempt is a normal outcome: the sensor is simply
//! absent for this cycle and the health tracker decides what that means.
//!
//! Backoff timing is a pure function of the attempt number and sleeping goes
//! through [`Sleeper`], so retry behaviour is testable without real delays.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ht_protocol::{TemperatureSnapshot, Timestamp};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::hw::HardwareChannel;
use crate::settings::ReaderSettings;
use crate::HeliothermError;

/// Exponential backoff between attempts of one sensor read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
        }
    }

    /// Delay after failed attempt `attempt` (1-based): `initial * 2^(attempt-1)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff.saturating_mul(1u32 << exponent)
    }
}

/// Blocking sleep used between attempts
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Production sleeper
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Records requested delays instead of sleeping
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.slept.lock().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept.lock().push(duration);
    }
}

/// Plausible temperature bounds; anything outside counts as a failed attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlausibleRange {
    pub min_c: f64,
    pub max_c: f64,
}

impl PlausibleRange {
    pub fn contains(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min_c && value <= self.max_c
    }
}

/// One sensor's outcome for one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub sensor_id: String,
    pub value: Option<f64>,
    pub attempts: u32,
    pub timestamp: Timestamp,
}

/// Result of reading every sensor once
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReadBatch {
    pub readings: BTreeMap<String, SensorReading>,
}

impl ReadBatch {
    /// Value (or absence) per sensor
    pub fn values(&self) -> TemperatureSnapshot {
        self.readings
            .iter()
            .map(|(id, r)| (id.clone(), r.value))
            .collect()
    }

    /// Attempts used per sensor, parallel to [`ReadBatch::values`]
    pub fn attempts(&self) -> BTreeMap<String, u32> {
        self.readings
            .iter()
            .map(|(id, r)| (id.clone(), r.attempts))
            .collect()
    }

    pub fn value(&self, sensor_id: &str) -> Option<f64> {
        self.readings.get(sensor_id).and_then(|r| r.value)
    }
}

#[derive(Clone)]
pub struct RetryingReader {
    channel: Arc<dyn HardwareChannel>,
    policy: BackoffPolicy,
    range: PlausibleRange,
    sleeper: Arc<dyn Sleeper>,
    cycle_deadline: Duration,
    /// Sensors whose read from an earlier cycle is still blocked in the driver
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Clears a sensor's in-flight mark when its read task ends
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    sensor_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.sensor_id);
    }
}

impl RetryingReader {
    pub fn new(channel: Arc<dyn HardwareChannel>, settings: &ReaderSettings) -> Self {
        Self {
            channel,
            policy: BackoffPolicy::new(settings.max_attempts, settings.initial_backoff()),
            range: PlausibleRange {
                min_c: settings.min_plausible_c,
                max_c: settings.max_plausible_c,
            },
            sleeper: Arc::new(ThreadSleeper),
            cycle_deadline: settings.cycle_deadline(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Read one sensor with retries. Blocks for the backoff delays.
    pub fn read_sensor(&self, sensor_id: &str) -> SensorReading {
        let attempts = AtomicU32::new(0);
        let value = self.read_with_progress(sensor_id, &attempts);
        SensorReading {
            sensor_id: sensor_id.to_string(),
            value,
            attempts: attempts.load(Ordering::SeqCst),
            timestamp: Utc::now(),
        }
    }

    /// Read every sensor one after another on the calling thread
    pub fn read_all_blocking(&self, sensor_ids: &[String]) -> ReadBatch {
        let readings = sensor_ids
            .iter()
            .map(|id| (id.clone(), self.read_sensor(id)))
            .collect();
        ReadBatch { readings }
    }

    /// Read every sensor concurrently on the blocking pool.
    ///
    /// The whole batch is bounded by the cycle deadline; sensors still
    /// pending when it elapses are reported absent with the attempts made so
    /// far. A sensor whose previous read is still stuck is not read again.
    pub async fn read_all(&self, sensor_ids: &[String]) -> ReadBatch {
        let deadline = tokio::time::Instant::now() + self.cycle_deadline;
        let mut progress: BTreeMap<String, Arc<AtomicU32>> = BTreeMap::new();
        let mut set = JoinSet::new();

        for id in sensor_ids {
            let counter = Arc::new(AtomicU32::new(0));
            progress.insert(id.clone(), counter.clone());

            if !self.in_flight.lock().insert(id.clone()) {
                warn!(sensor = %id, "CYCLE: previous read still blocked, skipping sensor this cycle");
                continue;
            }

            let reader = self.clone();
            let guard = InFlightGuard {
                set: self.in_flight.clone(),
                sensor_id: id.clone(),
            };
            set.spawn_blocking(move || {
                let value = reader.read_with_progress(&guard.sensor_id, &counter);
                (guard.sensor_id.clone(), value)
            });
        }

        let mut values: BTreeMap<String, Option<f64>> = BTreeMap::new();
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((id, value)))) => {
                    values.insert(id, value);
                }
                Ok(Some(Err(e))) => {
                    warn!("CYCLE: sensor read task failed: {}", e);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        pending = set.len(),
                        deadline_ms = self.cycle_deadline.as_millis() as u64,
                        "CYCLE: sensor read deadline elapsed, pending sensors reported absent"
                    );
                    set.detach_all();
                    break;
                }
            }
        }

        let now = Utc::now();
        let readings = sensor_ids
            .iter()
            .map(|id| {
                let attempts = progress
                    .get(id)
                    .map(|c| c.load(Ordering::SeqCst))
                    .unwrap_or(0);
                let reading = SensorReading {
                    sensor_id: id.clone(),
                    value: values.get(id).copied().flatten(),
                    attempts,
                    timestamp: now,
                };
                (id.clone(), reading)
            })
            .collect();

        ReadBatch { readings }
    }

    fn read_with_progress(&self, sensor_id: &str, attempts: &AtomicU32) -> Option<f64> {
        for attempt in 1..=self.policy.max_attempts {
            attempts.store(attempt, Ordering::SeqCst);

            let outcome = self.channel.read_sensor(sensor_id).and_then(|value| {
                if self.range.contains(value) {
                    Ok(value)
                } else {
                    Err(HeliothermError::SensorOutOfRange {
                        sensor: sensor_id.to_string(),
                        value,
                    })
                }
            });

            match outcome {
                Ok(value) => {
                    trace!(sensor = %sensor_id, attempt, value, "READ: accepted");
                    return Some(value);
                }
                Err(e) => {
                    debug!(sensor = %sensor_id, attempt, error = %e, "READ: attempt failed");
                    if attempt < self.policy.max_attempts {
                        self.sleeper.sleep(self.policy.delay_for(attempt));
                    }
                }
            }
        }

        debug!(
            sensor = %sensor_id,
            attempts = self.policy.max_attempts,
            "READ: attempts exhausted, no value this cycle"
        );
        None
    }
}
