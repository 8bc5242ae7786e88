//! Hardware access
//!
//! The controller only ever asks one question of the hardware: "what does
//! sensor X read right now?". [`HardwareChannel`] is that seam; the board
//! driver layer sits behind it.

pub mod fake;
pub mod sysfs;

pub use fake::{ScriptStep, ScriptedChannel};
pub use sysfs::SysfsChannel;

use crate::error::Result;

/// Single-sensor read primitive supplied by the driver layer.
///
/// Implementations may be slow and may fail; they must return an error
/// rather than panic on a disconnected probe, and must never hand back an
/// implausible value in place of an error.
#[cfg_attr(test, mockall::automock)]
pub trait HardwareChannel: Send + Sync {
    /// Read one temperature in °C
    fn read_sensor(&self, sensor_id: &str) -> Result<f64>;
}
