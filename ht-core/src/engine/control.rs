//! Hysteresis controller
//!
//! Owns the actuator state and decides, once per cycle, which of the five
//! control states the rig should be in. Every state maps to a fixed actuator
//! pattern; moving between states is a single switching event subject to one
//! anti-cycling check, except the safety transition into FAULTED which is
//! applied unconditionally.

use chrono::TimeDelta;
use ht_protocol::{Actuator, ActuatorState, Command, CommandRejection, ControlState, Mode, Timestamp};
use tracing::{error, info, warn};

use crate::settings::ControlSettings;

/// What the controller needs to know about the sanitized snapshot
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControlInputs {
    pub collector: Option<f64>,
    pub tank_reference: Option<f64>,
    /// Collector health is FAILED
    pub collector_failed: bool,
    /// Every safety-required sensor is FAILED
    pub all_required_failed: bool,
}

impl ControlInputs {
    /// Collector minus tank reference, when both are usable
    pub fn collector_tank_dt(&self) -> Option<f64> {
        if self.collector_failed {
            return None;
        }
        Some(self.collector? - self.tank_reference?)
    }
}

/// A hysteresis transition that anti-cycling held back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectedTransition {
    pub target: ControlState,
    pub remaining_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlDecision {
    pub previous: ControlState,
    pub state: ControlState,
    pub actuators: ActuatorState,
    pub rejected: Option<RejectedTransition>,
}

/// Actuator pattern for an automatic state
fn outputs_for(state: ControlState) -> (bool, bool) {
    match state {
        ControlState::Circulating => (true, false),
        ControlState::BackupHeating => (false, true),
        _ => (false, false),
    }
}

fn remaining_ms(remaining: TimeDelta) -> u64 {
    remaining.num_milliseconds().max(0) as u64
}

pub struct HysteresisController {
    settings: ControlSettings,
    min_toggle_interval: TimeDelta,
    state: ControlState,
    actuators: ActuatorState,
}

impl HysteresisController {
    pub fn new(settings: &ControlSettings) -> Self {
        let mode = settings.initial_mode;
        Self {
            settings: settings.clone(),
            min_toggle_interval: settings.min_toggle_interval(),
            state: if mode == Mode::Manual {
                ControlState::ManualOverride
            } else {
                ControlState::Idle
            },
            actuators: ActuatorState {
                mode,
                ..ActuatorState::default()
            },
        }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn actuators(&self) -> ActuatorState {
        self.actuators
    }

    /// Time left before the next toggle is allowed, if any
    pub fn anti_cycling_remaining(&self, now: Timestamp) -> Option<TimeDelta> {
        let last = self.actuators.last_toggle_time?;
        let elapsed = now - last;
        (elapsed < self.min_toggle_interval).then(|| self.min_toggle_interval - elapsed)
    }

    /// Apply an operator command. Called before the cycle's hysteresis step.
    pub fn apply_command(&mut self, command: Command, now: Timestamp) -> Result<(), CommandRejection> {
        match command {
            Command::SetMode { mode } => {
                self.set_mode(mode, now);
                Ok(())
            }
            Command::SetActuator { actuator, on } => self.set_actuator(actuator, on, now),
        }
    }

    fn set_mode(&mut self, mode: Mode, now: Timestamp) {
        let old = self.actuators.mode;
        if old == mode {
            return;
        }
        self.actuators.mode = mode;
        info!(from = %old, to = %mode, "CONTROL: mode changed");

        // FAULTED keeps its grip; recovery picks the mode up later
        if self.state == ControlState::Faulted {
            return;
        }

        if mode == Mode::Manual {
            self.enter(ControlState::ManualOverride);
        } else if old == Mode::Manual {
            self.resume_automatic(now);
        }
    }

    /// Hand control back to hysteresis from whatever the operator left on.
    /// Stays in MANUAL_OVERRIDE until the actuators match the resumed state.
    fn resume_automatic(&mut self, now: Timestamp) -> Option<RejectedTransition> {
        let resumed = match (self.actuators.pump_on, self.actuators.heater_on) {
            (true, _) => ControlState::Circulating,
            (false, true) => ControlState::BackupHeating,
            (false, false) => ControlState::Idle,
        };
        self.switch_to(resumed, now)
    }

    fn set_actuator(&mut self, actuator: Actuator, on: bool, now: Timestamp) -> Result<(), CommandRejection> {
        if self.state == ControlState::Faulted {
            return Err(CommandRejection::Faulted);
        }
        if self.actuators.mode != Mode::Manual {
            return Err(CommandRejection::NotInManualMode {
                mode: self.actuators.mode,
            });
        }
        if self.actuators.is_on(actuator) == on {
            return Ok(());
        }
        if let Some(remaining) = self.anti_cycling_remaining(now) {
            return Err(CommandRejection::AntiCycling {
                actuator,
                remaining_ms: remaining_ms(remaining),
            });
        }

        match actuator {
            Actuator::Pump => self.actuators.pump_on = on,
            Actuator::Heater => self.actuators.heater_on = on,
        }
        self.actuators.last_toggle_time = Some(now);
        info!(%actuator, on, "CONTROL: manual actuator command applied");
        Ok(())
    }

    /// One hysteresis step over the sanitized inputs
    pub fn step(&mut self, inputs: &ControlInputs, now: Timestamp) -> ControlDecision {
        let previous = self.state;
        let mut rejected = None;

        if inputs.all_required_failed {
            if self.state != ControlState::Faulted {
                error!(from = %self.state, "CONTROL: all required sensors failed, forcing actuators off");
                self.force_off(now);
                self.enter(ControlState::Faulted);
            }
        } else if self.state == ControlState::Faulted {
            let target = if self.actuators.mode == Mode::Manual {
                ControlState::ManualOverride
            } else {
                ControlState::Idle
            };
            info!(to = %target, "CONTROL: required sensor back, leaving FAULTED");
            self.enter(target);
        } else if self.state == ControlState::ManualOverride {
            if self.actuators.mode != Mode::Manual {
                rejected = self.resume_automatic(now);
            }
        } else {
            let target = self.hysteresis_target(inputs);
            if target != self.state {
                rejected = self.switch_to(target, now);
            }
        }

        ControlDecision {
            previous,
            state: self.state,
            actuators: self.actuators,
            rejected,
        }
    }

    fn backup_setpoints(&self) -> (f64, f64) {
        match self.actuators.mode {
            Mode::Eco => (self.settings.eco_backup_on_temp_c, self.settings.eco_backup_off_temp_c),
            _ => (self.settings.backup_on_temp_c, self.settings.backup_off_temp_c),
        }
    }

    fn hysteresis_target(&self, inputs: &ControlInputs) -> ControlState {
        let dt = inputs.collector_tank_dt();
        let solar_ready = dt.is_some_and(|dt| dt >= self.settings.dt_start);
        let (backup_on, backup_off) = self.backup_setpoints();
        let tank = inputs.tank_reference;

        match self.state {
            ControlState::Idle => {
                if solar_ready {
                    ControlState::Circulating
                } else if tank.is_some_and(|t| t < backup_on) {
                    ControlState::BackupHeating
                } else {
                    ControlState::Idle
                }
            }
            ControlState::Circulating => match dt {
                Some(dt) if dt > self.settings.dt_stop => ControlState::Circulating,
                // Stopped by the band or by missing data
                _ => ControlState::Idle,
            },
            ControlState::BackupHeating => {
                if solar_ready {
                    ControlState::Circulating
                } else {
                    match tank {
                        Some(t) if t < backup_off => ControlState::BackupHeating,
                        _ => ControlState::Idle,
                    }
                }
            }
            other => other,
        }
    }

    fn switch_to(&mut self, target: ControlState, now: Timestamp) -> Option<RejectedTransition> {
        let (pump_on, heater_on) = outputs_for(target);
        let toggles = pump_on != self.actuators.pump_on || heater_on != self.actuators.heater_on;

        if toggles {
            if let Some(remaining) = self.anti_cycling_remaining(now) {
                let rejected = RejectedTransition {
                    target,
                    remaining_ms: remaining_ms(remaining),
                };
                warn!(
                    from = %self.state,
                    to = %target,
                    remaining_ms = rejected.remaining_ms,
                    "CONTROL: transition held back by anti-cycling"
                );
                return Some(rejected);
            }
            self.actuators.pump_on = pump_on;
            self.actuators.heater_on = heater_on;
            self.actuators.last_toggle_time = Some(now);
        }

        info!(from = %self.state, to = %target, pump_on, heater_on, "CONTROL: transition");
        self.enter(target);
        None
    }

    fn force_off(&mut self, now: Timestamp) {
        if self.actuators.pump_on || self.actuators.heater_on {
            self.actuators.pump_on = false;
            self.actuators.heater_on = false;
            self.actuators.last_toggle_time = Some(now);
        }
    }

    fn enter(&mut self, state: ControlState) {
        self.state = state;
    }
}
