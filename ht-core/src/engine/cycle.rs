//! Control cycle
//!
//! `ControlLoop` is the sole writer of health records, energy accumulators
//! and actuator state. One cycle, in order:
//!
//! 1. apply queued operator commands
//! 2. read every sensor (retries, deadline)
//! 3. sanitize through the health tracker
//! 4. hysteresis step
//! 5. fold the tank snapshot into the energy ledger
//! 6. build the immutable snapshot and publish telemetry

use std::collections::BTreeMap;
use std::sync::Arc;

use ht_protocol::{Command, CommandRejection, HealthSummary, SensorAlert, SensorStatus, SystemSnapshot, TemperatureSnapshot, Timestamp};
use tracing::debug;

use crate::engine::control::{ControlDecision, ControlInputs, HysteresisController};
use crate::engine::energy::{ActiveSources, EnergyLedger, LedgerUpdate};
use crate::engine::health::HealthTracker;
use crate::engine::reader::{ReadBatch, RetryingReader, Sleeper};
use crate::hw::HardwareChannel;
use crate::settings::Settings;
use crate::telemetry::{publish_cycle, NullTelemetry, TelemetrySink};

/// A queued command and what became of it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command: Command,
    pub result: Result<(), CommandRejection>,
}

/// Everything one cycle decided, for logging and tests
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub timestamp: Timestamp,
    pub commands: Vec<CommandOutcome>,
    pub attempts: BTreeMap<String, u32>,
    pub decision: ControlDecision,
    pub energy: LedgerUpdate,
    pub health: HealthSummary,
    pub alerts: Vec<SensorAlert>,
}

pub struct ControlLoop {
    collector_id: String,
    tank_reference_id: String,
    required_ids: Vec<String>,
    sensor_ids: Vec<String>,
    reader: RetryingReader,
    health: HealthTracker,
    ledger: EnergyLedger,
    controller: HysteresisController,
    telemetry: Arc<dyn TelemetrySink>,
    cycle: u64,
    snapshot: SystemSnapshot,
}

impl ControlLoop {
    pub fn new(settings: &Settings, channel: Arc<dyn HardwareChannel>) -> Self {
        let sensors = &settings.sensors;
        let sensor_ids = sensors.known_sensor_ids();
        let controller = HysteresisController::new(&settings.control);

        let snapshot = SystemSnapshot {
            state: controller.state(),
            actuators: controller.actuators(),
            ..SystemSnapshot::default()
        };

        Self {
            collector_id: sensors.collector.clone(),
            tank_reference_id: sensors.tank_reference.clone(),
            required_ids: sensors.required_sensor_ids(),
            reader: RetryingReader::new(channel, &settings.reader),
            health: HealthTracker::new(&sensor_ids, &settings.health),
            ledger: EnergyLedger::new(sensors.tank_segments.clone(), &settings.tank),
            controller,
            telemetry: Arc::new(NullTelemetry),
            cycle: 0,
            snapshot,
            sensor_ids,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.reader = self.reader.with_sleeper(sleeper);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn ledger(&self) -> &EnergyLedger {
        &self.ledger
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> &SystemSnapshot {
        &self.snapshot
    }

    pub fn health_summary(&self) -> HealthSummary {
        self.health.summary()
    }

    pub fn reset_hour(&mut self) {
        self.ledger.reset_hour();
    }

    pub fn reset_day(&mut self) {
        self.ledger.reset_day();
    }

    /// Full cycle with concurrent sensor reads bounded by the cycle deadline
    pub async fn run_cycle(&mut self, commands: Vec<Command>, now: Timestamp) -> CycleReport {
        let start = self.begin(commands, now);
        let batch = self.reader.read_all(&self.sensor_ids).await;
        self.finish(start, batch, now)
    }

    /// Full cycle reading sensors one after another on this thread
    pub fn run_cycle_blocking(&mut self, commands: Vec<Command>, now: Timestamp) -> CycleReport {
        let start = self.begin(commands, now);
        let batch = self.reader.read_all_blocking(&self.sensor_ids);
        self.finish(start, batch, now)
    }

    /// Cycle over an already-read batch
    pub fn run_cycle_with_batch(&mut self, commands: Vec<Command>, batch: ReadBatch, now: Timestamp) -> CycleReport {
        let start = self.begin(commands, now);
        self.finish(start, batch, now)
    }

    fn begin(&mut self, commands: Vec<Command>, now: Timestamp) -> CycleStart {
        self.cycle += 1;
        // Heat gained since the last snapshot came from what ran until now
        let actuators = self.controller.actuators();

        let outcomes = commands
            .into_iter()
            .map(|command| CommandOutcome {
                command,
                result: self.controller.apply_command(command, now),
            })
            .collect();

        CycleStart {
            pump_was_on: actuators.pump_on,
            heater_was_on: actuators.heater_on,
            commands: outcomes,
        }
    }

    fn finish(&mut self, start: CycleStart, batch: ReadBatch, now: Timestamp) -> CycleReport {
        let temperatures = self.health.sanitize(&batch.values(), now);
        let inputs = self.control_inputs(&temperatures);
        let decision = self.controller.step(&inputs, now);

        let active = ActiveSources {
            solar: start.pump_was_on,
            collector_tank_dt: inputs.collector_tank_dt(),
            cartridge: start.heater_was_on,
        };
        let energy = self.ledger.update(&temperatures, &active);

        let health = self.health.summary();
        let alerts = self.health.alerts(now);
        publish_cycle(self.telemetry.as_ref(), self.cycle, &health, &alerts);

        self.snapshot = SystemSnapshot {
            cycle: self.cycle,
            timestamp: Some(now),
            state: decision.state,
            temperatures,
            actuators: decision.actuators,
            energy: self.ledger.state(),
            health: health.clone(),
            sensors: self.health.sensor_views(now),
        };

        debug!(
            cycle = self.cycle,
            state = %decision.state,
            failed = health.failed_count,
            degraded = health.degraded_count,
            stored_kwh = ?energy.stored.kwh,
            "CYCLE: complete"
        );

        CycleReport {
            cycle: self.cycle,
            timestamp: now,
            commands: start.commands,
            attempts: batch.attempts(),
            decision,
            energy,
            health,
            alerts,
        }
    }

    fn control_inputs(&self, temperatures: &TemperatureSnapshot) -> ControlInputs {
        let value = |id: &str| temperatures.get(id).copied().flatten();
        ControlInputs {
            collector: value(&self.collector_id),
            tank_reference: value(&self.tank_reference_id),
            collector_failed: self.health.status(&self.collector_id) == SensorStatus::Failed,
            all_required_failed: self
                .required_ids
                .iter()
                .all(|id| self.health.status(id) == SensorStatus::Failed),
        }
    }
}

struct CycleStart {
    pump_was_on: bool,
    heater_was_on: bool,
    commands: Vec<CommandOutcome>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::reader::{RecordingSleeper, SensorReading};
    use crate::hw::ScriptedChannel;
    use chrono::{DateTime, TimeDelta, Utc};
    use ht_protocol::{Actuator, ControlState, HeatSource, Mode};

    fn t(secs: i64) -> Timestamp {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap() + TimeDelta::seconds(secs)
    }

    fn batch(values: &[(&str, Option<f64>)]) -> ReadBatch {
        let readings = values
            .iter()
            .map(|(id, value)| {
                (
                    id.to_string(),
                    SensorReading {
                        sensor_id: id.to_string(),
                        value: *value,
                        attempts: 1,
                        timestamp: t(0),
                    },
                )
            })
            .collect();
        ReadBatch { readings }
    }

    fn rig(collector: f64, tank: f64) -> ReadBatch {
        batch(&[
            ("collector", Some(collector)),
            ("tank_top", Some(tank)),
            ("tank_middle", Some(tank)),
            ("tank_bottom", Some(tank)),
        ])
    }

    fn control_loop() -> ControlLoop {
        let channel = Arc::new(ScriptedChannel::new());
        ControlLoop::new(&Settings::default(), channel).with_sleeper(Arc::new(RecordingSleeper::new()))
    }

    #[test]
    fn test_cycle_publishes_snapshot() {
        let mut cl = control_loop();
        let report = cl.run_cycle_with_batch(vec![], rig(60.0, 50.0), t(0));
        assert_eq!(report.cycle, 1);
        assert_eq!(report.decision.state, ControlState::Circulating);

        let snap = cl.snapshot();
        assert_eq!(snap.cycle, 1);
        assert_eq!(snap.state, ControlState::Circulating);
        assert!(snap.actuators.pump_on);
        assert_eq!(snap.temperatures.get("collector"), Some(&Some(60.0)));
        assert_eq!(snap.health.healthy_count, 4);
        assert_eq!(snap.sensors.len(), 4);
    }

    #[test]
    fn test_energy_goes_to_source_that_ran() {
        let mut cl = control_loop();
        cl.run_cycle_with_batch(vec![], rig(60.0, 20.0), t(0));
        // Pump ran between cycles; collector still 15°C above the tank
        let report = cl.run_cycle_with_batch(vec![], rig(45.0, 30.0), t(5));

        let shares = report.energy.allocation.unwrap();
        assert_eq!(shares.get(&HeatSource::Solar), Some(&4_200_000));
        assert_eq!(cl.ledger().today_mwh(HeatSource::Pellet), 0);
    }

    #[test]
    fn test_commands_reported_in_order() {
        let mut cl = control_loop();
        let commands = vec![
            Command::SetActuator {
                actuator: Actuator::Pump,
                on: true,
            },
            Command::SetMode { mode: Mode::Manual },
            Command::SetActuator {
                actuator: Actuator::Pump,
                on: true,
            },
        ];
        let report = cl.run_cycle_with_batch(commands, rig(30.0, 50.0), t(0));
        assert_eq!(
            report.commands[0].result,
            Err(CommandRejection::NotInManualMode { mode: Mode::Auto })
        );
        assert_eq!(report.commands[1].result, Ok(()));
        assert_eq!(report.commands[2].result, Ok(()));
        assert_eq!(report.decision.state, ControlState::ManualOverride);
        assert!(cl.snapshot().actuators.pump_on);
    }

    #[test]
    fn test_missing_required_sensors_fault() {
        let mut cl = control_loop();
        let report = cl.run_cycle_with_batch(vec![], batch(&[("tank_top", Some(40.0))]), t(0));
        assert_eq!(report.decision.state, ControlState::Faulted);
        assert_eq!(report.health.failed_count, 3);
    }
}
