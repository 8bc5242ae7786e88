//! Control engine modules
//!
//! Reader, health tracker, energy ledger and hysteresis controller, plus the
//! cycle that runs them in order.

pub mod control;
pub mod cycle;
pub mod energy;
pub mod health;
pub mod reader;

pub use control::{ControlDecision, ControlInputs, HysteresisController, RejectedTransition};
pub use cycle::{CommandOutcome, ControlLoop, CycleReport};
pub use energy::{ActiveSources, Allocation, EnergyFault, EnergyLedger, LedgerUpdate, StoredEnergy};
pub use health::{alert_due, HealthOutcome, HealthTracker, SensorHealthRecord};
pub use reader::{
    BackoffPolicy, PlausibleRange, ReadBatch, RecordingSleeper, RetryingReader, SensorReading, Sleeper,
    ThreadSleeper,
};
