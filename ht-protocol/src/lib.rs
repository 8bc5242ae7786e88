//! Shared protocol types for Heliotherm
//!
//! Everything that leaves the control loop goes through these types: the
//! published [`SystemSnapshot`], the [`HealthSummary`], telemetry alerts and the
//! request/response envelopes of the daemon socket.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum message size for IPC (64KB, snapshots carry every sensor)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Wall-clock instant used throughout the controller
pub type Timestamp = DateTime<Utc>;

/// Sanitized reading-or-fallback-or-absent value for every known sensor
pub type TemperatureSnapshot = BTreeMap<String, Option<f64>>;

// ============================================================================
// Controller State
// ============================================================================

/// Operating mode selected by the operator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Hysteresis control of pump and backup heater
    #[default]
    Auto,
    /// Actuators only move on explicit operator commands
    Manual,
    /// Like auto, with lowered backup heater setpoints
    Eco,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Auto => write!(f, "auto"),
            Mode::Manual => write!(f, "manual"),
            Mode::Eco => write!(f, "eco"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Actuator {
    Pump,
    Heater,
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actuator::Pump => write!(f, "pump"),
            Actuator::Heater => write!(f, "heater"),
        }
    }
}

/// Hysteresis state machine position
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    #[default]
    Idle,
    Circulating,
    BackupHeating,
    ManualOverride,
    /// Every safety-required sensor has failed; pump and heater forced off
    Faulted,
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlState::Idle => "IDLE",
            ControlState::Circulating => "CIRCULATING",
            ControlState::BackupHeating => "BACKUP_HEATING",
            ControlState::ManualOverride => "MANUAL_OVERRIDE",
            ControlState::Faulted => "FAULTED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ActuatorState {
    pub pump_on: bool,
    pub heater_on: bool,
    pub mode: Mode,
    /// `None` until the first toggle
    pub last_toggle_time: Option<Timestamp>,
}

impl ActuatorState {
    pub fn is_on(&self, actuator: Actuator) -> bool {
        match actuator {
            Actuator::Pump => self.pump_on,
            Actuator::Heater => self.heater_on,
        }
    }
}

// ============================================================================
// Sensor Health
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensorStatus {
    Healthy,
    Degraded,
    Failed,
}

/// Aggregate health view exposed to API and telemetry collaborators
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct HealthSummary {
    pub healthy_count: usize,
    pub degraded_count: usize,
    pub failed_count: usize,
    pub failed_sensors: Vec<String>,
    pub degraded_sensors: Vec<String>,
    pub alerts_due: Vec<String>,
}

/// Per-sensor detail published alongside the summary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorHealthView {
    pub sensor_id: String,
    pub status: SensorStatus,
    pub last_good_value: Option<f64>,
    pub last_good_age_secs: Option<f64>,
    pub consecutive_errors: u32,
    pub total_errors: u64,
}

/// Alert published when a sensor crosses its alert cadence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorAlert {
    pub sensor_id: String,
    pub status: SensorStatus,
    pub consecutive_errors: u32,
    pub timestamp: Timestamp,
}

// ============================================================================
// Energy
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum HeatSource {
    Solar,
    Cartridge,
    Pellet,
}

impl HeatSource {
    pub const ALL: [HeatSource; 3] = [HeatSource::Solar, HeatSource::Cartridge, HeatSource::Pellet];
}

impl fmt::Display for HeatSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeatSource::Solar => write!(f, "solar"),
            HeatSource::Cartridge => write!(f, "cartridge"),
            HeatSource::Pellet => write!(f, "pellet"),
        }
    }
}

/// Energy figures in kWh, derived from the ledger's fixed-point accumulators
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct EnergyState {
    /// `None` when no tank segment had a usable temperature
    pub stored_energy_kwh: Option<f64>,
    pub solar_today: f64,
    pub solar_hour: f64,
    pub cartridge_today: f64,
    pub cartridge_hour: f64,
    pub pellet_today: f64,
    pub pellet_hour: f64,
}

impl EnergyState {
    /// Energy collected since midnight, always the sum of the sources
    pub fn total_today(&self) -> f64 {
        self.solar_today + self.cartridge_today + self.pellet_today
    }

    pub fn total_hour(&self) -> f64 {
        self.solar_hour + self.cartridge_hour + self.pellet_hour
    }
}

// ============================================================================
// Published Snapshot
// ============================================================================

/// Immutable view of one completed control cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemSnapshot {
    pub cycle: u64,
    pub timestamp: Option<Timestamp>,
    pub state: ControlState,
    pub temperatures: TemperatureSnapshot,
    pub actuators: ActuatorState,
    pub energy: EnergyState,
    pub health: HealthSummary,
    #[serde(default)]
    pub sensors: Vec<SensorHealthView>,
}

// ============================================================================
// Operator Commands
// ============================================================================

/// Write operations queued for the next control cycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    SetMode { mode: Mode },
    SetActuator { actuator: Actuator, on: bool },
}

/// Why a queued command was not applied
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CommandRejection {
    NotInManualMode { mode: Mode },
    AntiCycling { actuator: Actuator, remaining_ms: u64 },
    Faulted,
}

impl fmt::Display for CommandRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandRejection::NotInManualMode { mode } => {
                write!(f, "manual actuator commands require manual mode (current: {})", mode)
            }
            CommandRejection::AntiCycling { actuator, remaining_ms } => {
                write!(f, "{} toggle blocked by anti-cycling for another {}ms", actuator, remaining_ms)
            }
            CommandRejection::Faulted => {
                write!(f, "controller is faulted, actuators are held off")
            }
        }
    }
}

// ============================================================================
// IPC Envelopes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique request ID for correlation and debugging
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data")]
pub enum Request {
    Ping,
    Version,
    GetSnapshot,
    GetHealthSummary,
    RequestMode { mode: Mode },
    RequestManualActuator { actuator: Actuator, on: bool },
}

impl Request {
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Ping => "Ping",
            Request::Version => "Version",
            Request::GetSnapshot => "GetSnapshot",
            Request::GetHealthSummary => "GetHealthSummary",
            Request::RequestMode { .. } => "RequestMode",
            Request::RequestManualActuator { .. } => "RequestManualActuator",
        }
    }

    /// The queued command this request maps to, if it writes
    pub fn as_command(&self) -> Option<Command> {
        match self {
            Request::RequestMode { mode } => Some(Command::SetMode { mode: *mode }),
            Request::RequestManualActuator { actuator, on } => Some(Command::SetActuator {
                actuator: *actuator,
                on: *on,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub response: Response,
}

impl ResponseEnvelope {
    pub fn new(id: u64, response: Response) -> Self {
        Self { id, response }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Response {
    #[serde(rename = "ok")]
    Ok(ResponseData),
    #[serde(rename = "rejected")]
    Rejected { rejection: CommandRejection, message: String },
    #[serde(rename = "error")]
    Error { message: String },
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(ResponseData::default())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error { message: message.into() }
    }

    pub fn rejected(rejection: CommandRejection) -> Self {
        Response::Rejected {
            message: rejection.to_string(),
            rejection,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResponseData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SystemSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthSummary>,
}

impl ResponseData {
    pub fn string(v: String) -> Self { Self { value: Some(v), ..Self::default() } }
    pub fn snapshot(s: SystemSnapshot) -> Self { Self { snapshot: Some(s), ..Self::default() } }
    pub fn health(h: HealthSummary) -> Self { Self { health: Some(h), ..Self::default() } }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let envelope = RequestEnvelope {
            id: 7,
            request: Request::RequestManualActuator { actuator: Actuator::Pump, on: true },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["cmd"], "RequestManualActuator");
        assert_eq!(json["data"]["actuator"], "pump");
        assert_eq!(json["data"]["on"], true);
    }

    #[test]
    fn test_request_parses_unit_variant() {
        let parsed: RequestEnvelope = serde_json::from_str(r#"{"id":3,"cmd":"GetSnapshot"}"#).unwrap();
        assert_eq!(parsed.id, 3);
        assert!(matches!(parsed.request, Request::GetSnapshot));
        assert!(parsed.request.as_command().is_none());
    }

    #[test]
    fn test_rejection_response_carries_reason() {
        let response = Response::rejected(CommandRejection::AntiCycling {
            actuator: Actuator::Heater,
            remaining_ms: 1200,
        });
        let json = serde_json::to_value(ResponseEnvelope::new(1, response)).unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["rejection"]["reason"], "anti_cycling");
        assert!(json["message"].as_str().unwrap().contains("1200ms"));
    }

    #[test]
    fn test_energy_totals_are_sums_of_sources() {
        let energy = EnergyState {
            stored_energy_kwh: Some(10.0),
            solar_today: 1.5,
            solar_hour: 0.5,
            cartridge_today: 2.0,
            cartridge_hour: 0.0,
            pellet_today: 0.25,
            pellet_hour: 0.25,
        };
        assert_eq!(energy.total_today(), 3.75);
        assert_eq!(energy.total_hour(), 0.75);
    }

    #[test]
    fn test_sensor_status_wire_names() {
        assert_eq!(serde_json::to_string(&SensorStatus::Degraded).unwrap(), "\"DEGRADED\"");
        assert_eq!(ControlState::BackupHeating.to_string(), "BACKUP_HEATING");
    }
}
