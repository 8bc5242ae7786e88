//! Constants and configuration defaults for Heliotherm
//!
//! Centralizes all magic numbers and defaults. Settings fall back to these
//! values, so this is the single place to change a default.

/// System paths
pub mod paths {
    /// Configuration directory
    pub const CONFIG_DIR: &str = "/etc/heliotherm";

    /// Settings file inside [`CONFIG_DIR`]
    pub const SETTINGS_FILE: &str = "settings.json";

    /// Daemon API socket
    pub const SOCKET_PATH: &str = "/run/heliotherm.sock";
}

/// Sensor acquisition defaults
pub mod reader {
    /// Hardware reads per sensor per cycle
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    /// First backoff delay; doubles on each further attempt (50 -> 100 -> 200 ms)
    pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 50;

    /// Lowest plausible temperature in °C
    pub const DEFAULT_MIN_PLAUSIBLE_C: f64 = -50.0;

    /// Highest plausible temperature in °C
    pub const DEFAULT_MAX_PLAUSIBLE_C: f64 = 200.0;

    /// Upper bound on the time one cycle waits for all sensors
    pub const DEFAULT_CYCLE_DEADLINE_MS: u64 = 2_000;

    /// Sysfs temperature files report millidegrees
    pub const MILLIDEGREES_PER_DEGREE: f64 = 1000.0;
}

/// Sensor health defaults
pub mod health {
    /// Age after which a last-known-good value is no longer trusted
    pub const DEFAULT_STALE_THRESHOLD_SECS: u64 = 300;

    /// Consecutive errors at which the first alert fires
    pub const DEFAULT_ALERT_THRESHOLD: u32 = 5;

    /// Errors between repeated alerts after the first one
    pub const DEFAULT_ALERT_REPEAT_INTERVAL: u32 = 10;
}

/// Tank and energy accounting defaults
pub mod tank {
    /// Tank volume in litres (1 L of water taken as 1 kg)
    pub const DEFAULT_VOLUME_LITRES: f64 = 360.0;

    /// Energy is measured above this temperature (cold-water inlet)
    pub const DEFAULT_REFERENCE_TEMP_C: f64 = 4.0;

    /// Maximum safe tank temperature
    pub const DEFAULT_MAX_SAFE_TEMP_C: f64 = 95.0;

    /// Specific heat of water in kJ/(kg·K)
    pub const SPECIFIC_HEAT_WATER_KJ: f64 = 4.2;

    /// kJ per kWh
    pub const KJ_PER_KWH: f64 = 3600.0;

    /// Ledger resolution: accumulators count milliwatt-hours
    pub const MWH_PER_KWH: f64 = 1_000_000.0;
}

/// Heat source weighting for collected-energy allocation
pub mod allocation {
    /// Collector-tank differential that earns solar full weight
    pub const SOLAR_FULL_WEIGHT_DT: f64 = 20.0;

    /// Solar weight floor while the pump circulates
    pub const SOLAR_MIN_WEIGHT: f64 = 0.1;

    /// Solar weight ceiling
    pub const SOLAR_MAX_WEIGHT: f64 = 1.0;

    /// Cartridge weight while its relay is on. The 3 kW element delivers
    /// roughly what a full-sun collector delivers, so it matches solar's
    /// ceiling.
    pub const CARTRIDGE_WEIGHT: f64 = 1.0;

    /// Pellet furnace weight when neither solar nor cartridge is active
    pub const PELLET_WEIGHT: f64 = 1.0;
}

/// Hysteresis control defaults
pub mod control {
    /// Collector-tank differential that starts circulation
    pub const DEFAULT_DT_START: f64 = 8.0;

    /// Collector-tank differential that stops circulation
    pub const DEFAULT_DT_STOP: f64 = 4.0;

    /// Minimum time between actuator toggles (relay protection)
    pub const DEFAULT_MIN_TOGGLE_INTERVAL_MS: u64 = 5_000;

    /// AUTO: backup heater turns on below this tank temperature
    pub const DEFAULT_BACKUP_ON_TEMP_C: f64 = 40.0;

    /// AUTO: backup heater turns off at this tank temperature
    pub const DEFAULT_BACKUP_OFF_TEMP_C: f64 = 45.0;

    /// ECO: lowered backup heater on setpoint
    pub const DEFAULT_ECO_BACKUP_ON_TEMP_C: f64 = 30.0;

    /// ECO: lowered backup heater off setpoint
    pub const DEFAULT_ECO_BACKUP_OFF_TEMP_C: f64 = 35.0;
}

/// Daemon scheduling defaults
pub mod daemon {
    /// Control cycle period
    pub const DEFAULT_CYCLE_INTERVAL_MS: u64 = 5_000;

    /// Shortest cycle period accepted from settings
    pub const MIN_CYCLE_INTERVAL_MS: u64 = 500;

    /// Log a repeating failure on the first and every Nth occurrence
    pub const LOG_EVERY_NTH_ERROR: u64 = 10;

    /// How long an API client waits for its queued command to be applied
    pub const COMMAND_REPLY_TIMEOUT_MS: u64 = 30_000;
}
