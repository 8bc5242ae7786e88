//! Heliotherm Core Library
//!
//! Fault-tolerant sensor acquisition and energy accounting for a
//! solar-thermal heating rig.
//!
//! # Module Structure
//!
//! - `hw/` - Hardware channel trait, sysfs implementation, scripted fake
//! - `engine/` - Retrying reader, health tracker, energy ledger, controller, cycle
//! - `settings` - Persistent configuration
//! - `telemetry` - Fire-and-forget publication seam
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ht_core::{ControlLoop, Settings, SysfsChannel};
//!
//! let settings = Settings::default();
//! let channel = Arc::new(SysfsChannel::new(settings.sensors.paths.clone()));
//! let mut control = ControlLoop::new(&settings, channel);
//! let report = control.run_cycle_blocking(Vec::new(), chrono::Utc::now());
//! println!("{}", report.decision.state);
//! ```

pub mod engine;
pub mod hw;

pub mod constants;
pub mod settings;
pub mod telemetry;

pub mod error {
    pub use ht_error::{HeliothermError, Result};
}

// Re-export error types
pub use error::{HeliothermError, Result};

// Re-export engine types
pub use engine::{
    ActiveSources, ControlLoop, CycleReport, EnergyLedger, HealthTracker, HysteresisController, RetryingReader,
};

// Re-export hardware types
pub use hw::{HardwareChannel, ScriptStep, ScriptedChannel, SysfsChannel};

// Re-export settings
pub use settings::{load_settings, save_settings, Settings};

pub use telemetry::{MemoryTelemetry, TelemetrySink};
