//! Sysfs temperature channel
//!
//! Reads hwmon-style `tempN_input` files holding millidegrees Celsius.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use crate::constants::reader::MILLIDEGREES_PER_DEGREE;
use crate::error::Result;
use crate::hw::HardwareChannel;
use crate::HeliothermError;

pub struct SysfsChannel {
    paths: BTreeMap<String, PathBuf>,
}

impl SysfsChannel {
    pub fn new(paths: BTreeMap<String, PathBuf>) -> Self {
        Self { paths }
    }
}

impl HardwareChannel for SysfsChannel {
    fn read_sensor(&self, sensor_id: &str) -> Result<f64> {
        let path = self
            .paths
            .get(sensor_id)
            .ok_or_else(|| HeliothermError::UnknownSensor(sensor_id.to_string()))?;

        let content = fs::read_to_string(path)
            .map_err(|e| HeliothermError::sensor_read(sensor_id, format!("{}: {}", path.display(), e)))?;

        let millidegrees: f64 = content
            .trim()
            .parse()
            .map_err(|e| HeliothermError::sensor_read(sensor_id, format!("unparseable value {:?}: {}", content.trim(), e)))?;

        let celsius = millidegrees / MILLIDEGREES_PER_DEGREE;
        if !celsius.is_finite() {
            return Err(HeliothermError::sensor_read(sensor_id, "non-finite value"));
        }

        Ok(celsius)
    }
}
