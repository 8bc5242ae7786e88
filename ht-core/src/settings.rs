//! Controller Settings
//!
//! Persistent settings stored as JSON in /etc/heliotherm/settings.json.
//! Every field has a default, so a partial (or missing) file is valid.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use ht_protocol::Mode;
use tracing::{debug, info};

use crate::constants::{control, daemon, health, paths, reader, tank};
use crate::error::Result;
use crate::HeliothermError;

/// Complete controller configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Settings {
    #[serde(default)]
    pub sensors: SensorSettings,

    #[serde(default)]
    pub reader: ReaderSettings,

    #[serde(default)]
    pub health: HealthSettings,

    #[serde(default)]
    pub tank: TankSettings,

    #[serde(default)]
    pub control: ControlSettings,

    #[serde(default)]
    pub daemon: DaemonSettings,
}

/// Sensor ids and their roles in the rig
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SensorSettings {
    /// Solar collector outlet
    pub collector: String,

    /// Tank point compared against the collector for hysteresis
    pub tank_reference: String,

    /// Tank sensors from top to bottom, one per equal-volume segment
    pub tank_segments: Vec<String>,

    /// Monitored sensors with no control or accounting role
    pub auxiliary: Vec<String>,

    /// Sysfs temperature file per sensor id (millidegrees Celsius)
    pub paths: BTreeMap<String, PathBuf>,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            collector: "collector".to_string(),
            tank_reference: "tank_middle".to_string(),
            tank_segments: vec![
                "tank_top".to_string(),
                "tank_middle".to_string(),
                "tank_bottom".to_string(),
            ],
            auxiliary: Vec::new(),
            paths: BTreeMap::new(),
        }
    }
}

impl SensorSettings {
    /// Every sensor the controller tracks, in a stable order without duplicates
    pub fn known_sensor_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        let candidates = std::iter::once(&self.collector)
            .chain(std::iter::once(&self.tank_reference))
            .chain(self.tank_segments.iter())
            .chain(self.auxiliary.iter());
        for id in candidates {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    /// Sensors whose simultaneous failure faults the controller
    pub fn required_sensor_ids(&self) -> Vec<String> {
        let mut ids = vec![self.collector.clone()];
        if self.tank_reference != self.collector {
            ids.push(self.tank_reference.clone());
        }
        ids
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReaderSettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub min_plausible_c: f64,
    pub max_plausible_c: f64,
    pub cycle_deadline_ms: u64,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        Self {
            max_attempts: reader::DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: reader::DEFAULT_INITIAL_BACKOFF_MS,
            min_plausible_c: reader::DEFAULT_MIN_PLAUSIBLE_C,
            max_plausible_c: reader::DEFAULT_MAX_PLAUSIBLE_C,
            cycle_deadline_ms: reader::DEFAULT_CYCLE_DEADLINE_MS,
        }
    }
}

impl ReaderSettings {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_millis(self.cycle_deadline_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthSettings {
    pub stale_threshold_secs: u64,
    pub alert_threshold: u32,
    pub alert_repeat_interval: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            stale_threshold_secs: health::DEFAULT_STALE_THRESHOLD_SECS,
            alert_threshold: health::DEFAULT_ALERT_THRESHOLD,
            alert_repeat_interval: health::DEFAULT_ALERT_REPEAT_INTERVAL,
        }
    }
}

impl HealthSettings {
    pub fn stale_threshold(&self) -> TimeDelta {
        i64::try_from(self.stale_threshold_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TankSettings {
    pub volume_litres: f64,
    pub reference_temp_c: f64,
    pub max_safe_temp_c: f64,
    pub specific_heat_kj: f64,
}

impl Default for TankSettings {
    fn default() -> Self {
        Self {
            volume_litres: tank::DEFAULT_VOLUME_LITRES,
            reference_temp_c: tank::DEFAULT_REFERENCE_TEMP_C,
            max_safe_temp_c: tank::DEFAULT_MAX_SAFE_TEMP_C,
            specific_heat_kj: tank::SPECIFIC_HEAT_WATER_KJ,
        }
    }
}

impl TankSettings {
    /// Physical ceiling: the whole tank at its maximum safe temperature
    pub fn max_energy_kwh(&self) -> f64 {
        self.volume_litres * self.specific_heat_kj * (self.max_safe_temp_c - self.reference_temp_c)
            / tank::KJ_PER_KWH
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlSettings {
    pub dt_start: f64,
    pub dt_stop: f64,
    pub min_toggle_interval_ms: u64,
    pub backup_on_temp_c: f64,
    pub backup_off_temp_c: f64,
    pub eco_backup_on_temp_c: f64,
    pub eco_backup_off_temp_c: f64,
    pub initial_mode: Mode,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            dt_start: control::DEFAULT_DT_START,
            dt_stop: control::DEFAULT_DT_STOP,
            min_toggle_interval_ms: control::DEFAULT_MIN_TOGGLE_INTERVAL_MS,
            backup_on_temp_c: control::DEFAULT_BACKUP_ON_TEMP_C,
            backup_off_temp_c: control::DEFAULT_BACKUP_OFF_TEMP_C,
            eco_backup_on_temp_c: control::DEFAULT_ECO_BACKUP_ON_TEMP_C,
            eco_backup_off_temp_c: control::DEFAULT_ECO_BACKUP_OFF_TEMP_C,
            initial_mode: Mode::Auto,
        }
    }
}

impl ControlSettings {
    pub fn min_toggle_interval(&self) -> TimeDelta {
        i64::try_from(self.min_toggle_interval_ms)
            .ok()
            .and_then(TimeDelta::try_milliseconds)
            .unwrap_or(TimeDelta::MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonSettings {
    pub cycle_interval_ms: u64,
    pub socket_path: PathBuf,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            cycle_interval_ms: daemon::DEFAULT_CYCLE_INTERVAL_MS,
            socket_path: PathBuf::from(paths::SOCKET_PATH),
        }
    }
}

impl DaemonSettings {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms.max(daemon::MIN_CYCLE_INTERVAL_MS))
    }
}

impl Settings {
    /// Check cross-field constraints. Returns the first violation found.
    pub fn validate(&self) -> Result<()> {
        let s = &self.sensors;
        if s.collector.trim().is_empty() {
            return Err(HeliothermError::invalid_config("sensors.collector", "must not be empty"));
        }
        if s.tank_reference.trim().is_empty() {
            return Err(HeliothermError::invalid_config("sensors.tank_reference", "must not be empty"));
        }
        if s.tank_segments.is_empty() {
            return Err(HeliothermError::invalid_config(
                "sensors.tank_segments",
                "at least one tank segment sensor is required",
            ));
        }
        if s.tank_segments.iter().any(|id| id.trim().is_empty()) {
            return Err(HeliothermError::invalid_config("sensors.tank_segments", "sensor ids must not be empty"));
        }

        let r = &self.reader;
        if r.max_attempts == 0 {
            return Err(HeliothermError::invalid_config("reader.max_attempts", "must be at least 1"));
        }
        if !(r.min_plausible_c < r.max_plausible_c) {
            return Err(HeliothermError::invalid_config(
                "reader.min_plausible_c",
                format!("must be below max_plausible_c ({})", r.max_plausible_c),
            ));
        }
        if r.cycle_deadline_ms == 0 {
            return Err(HeliothermError::invalid_config("reader.cycle_deadline_ms", "must be positive"));
        }

        let h = &self.health;
        if h.alert_threshold == 0 {
            return Err(HeliothermError::invalid_config("health.alert_threshold", "must be at least 1"));
        }
        if h.alert_repeat_interval == 0 {
            return Err(HeliothermError::invalid_config("health.alert_repeat_interval", "must be at least 1"));
        }

        let t = &self.tank;
        if !(t.volume_litres > 0.0) {
            return Err(HeliothermError::invalid_config("tank.volume_litres", "must be positive"));
        }
        if !(t.specific_heat_kj > 0.0) {
            return Err(HeliothermError::invalid_config("tank.specific_heat_kj", "must be positive"));
        }
        if !(t.max_safe_temp_c > t.reference_temp_c) {
            return Err(HeliothermError::invalid_config(
                "tank.max_safe_temp_c",
                format!("must be above reference_temp_c ({})", t.reference_temp_c),
            ));
        }

        let c = &self.control;
        if !(c.dt_stop < c.dt_start) {
            return Err(HeliothermError::invalid_config(
                "control.dt_stop",
                format!("must be strictly below dt_start ({}) to avoid oscillation", c.dt_start),
            ));
        }
        if !(c.backup_on_temp_c < c.backup_off_temp_c) {
            return Err(HeliothermError::invalid_config(
                "control.backup_on_temp_c",
                "must be below backup_off_temp_c",
            ));
        }
        if !(c.eco_backup_on_temp_c < c.eco_backup_off_temp_c) {
            return Err(HeliothermError::invalid_config(
                "control.eco_backup_on_temp_c",
                "must be below eco_backup_off_temp_c",
            ));
        }

        Ok(())
    }
}

/// Default settings file path
pub fn default_settings_path() -> PathBuf {
    Path::new(paths::CONFIG_DIR).join(paths::SETTINGS_FILE)
}

/// Load and validate settings from a JSON file. A missing file yields defaults.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        info!("No settings file at {:?}, using defaults", path);
        return Ok(Settings::default());
    }

    let content = fs::read_to_string(path).map_err(|e| HeliothermError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let settings: Settings = serde_json::from_str(&content)
        .map_err(|e| HeliothermError::config(format!("Failed to parse settings JSON {:?}: {}", path, e)))?;

    settings.validate()?;
    debug!("Settings loaded from {:?} ({} bytes)", path, content.len());
    Ok(settings)
}

/// Save settings to a JSON file
/// Uses atomic write (temp file + rename) to prevent corruption on crash
pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    use std::io::Write;

    settings.validate()?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| HeliothermError::FileWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }

    let json = serde_json::to_string_pretty(settings)?;
    let temp_path = path.with_extension("json.tmp");

    let write_err = |e| HeliothermError::FileWrite {
        path: temp_path.clone(),
        source: e,
    };
    let mut file = fs::File::create(&temp_path).map_err(write_err)?;
    file.write_all(json.as_bytes()).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| HeliothermError::FileWrite {
        path: path.to_path_buf(),
        source: e,
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.reader.max_attempts, 3);
        assert_eq!(settings.health.stale_threshold_secs, 300);
        assert_eq!(settings.control.dt_start, 8.0);
        assert_eq!(settings.control.dt_stop, 4.0);
    }

    #[test]
    fn test_known_sensor_ids_deduplicates_roles() {
        let sensors = SensorSettings {
            auxiliary: vec!["collector_return".to_string(), "tank_top".to_string()],
            ..SensorSettings::default()
        };
        assert_eq!(
            sensors.known_sensor_ids(),
            vec!["collector", "tank_middle", "tank_top", "tank_bottom", "collector_return"]
        );
        assert_eq!(sensors.required_sensor_ids(), vec!["collector", "tank_middle"]);
    }

    #[test]
    fn test_rejects_inverted_hysteresis_band() {
        let mut settings = Settings::default();
        settings.control.dt_stop = 8.0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("control.dt_stop"));
    }

    #[test]
    fn test_rejects_zero_attempts_and_empty_tank() {
        let mut settings = Settings::default();
        settings.reader.max_attempts = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.sensors.tank_segments.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_tank_max_energy() {
        let tank = TankSettings::default();
        let expected = 360.0 * 4.2 * 91.0 / 3600.0;
        assert!((tank.max_energy_kwh() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let loaded = load_settings(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded, Settings::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"control": {"dt_start": 10.0}, "tank": {"volume_litres": 500.0}}"#).unwrap();

        let loaded = load_settings(&path).unwrap();
        assert_eq!(loaded.control.dt_start, 10.0);
        assert_eq!(loaded.control.dt_stop, 4.0);
        assert_eq!(loaded.tank.volume_litres, 500.0);
        assert_eq!(loaded.reader, ReaderSettings::default());
    }

    #[test]
    fn test_save_then_load_preserves_settings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = Settings::default();
        settings.control.initial_mode = Mode::Eco;
        settings
            .sensors
            .paths
            .insert("collector".to_string(), PathBuf::from("/sys/class/hwmon/hwmon2/temp1_input"));

        save_settings(&path, &settings).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_settings(&path).unwrap(), settings);
    }

    #[test]
    fn test_invalid_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"control": {"dt_start": 3.0, "dt_stop": 4.0}}"#).unwrap();
        assert!(matches!(
            load_settings(&path),
            Err(HeliothermError::InvalidConfig { .. })
        ));
    }
}
