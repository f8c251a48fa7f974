//! # Portal Configuration
//!
//! Configuration for the link, the reader, analysis, direction detection and
//! the inventory.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     RFID_PORTAL_PORT=/dev/ttyUSB0                                      │
//! │     RFID_PORTAL_BAUD=115200                                            │
//! │     RFID_PORTAL_SENSOR_PORT=/dev/ttyUSB1                               │
//! │     RFID_PORTAL_POWER=30                                               │
//! │     RFID_PORTAL_ANTENNAS=1,2                                           │
//! │     RFID_PORTAL_SLOPE_THRESHOLD=5.0                                    │
//! │     RFID_PORTAL_VARIANCE_THRESHOLD=4.0                                 │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     --config <path>, or                                                │
//! │     ~/.config/rfid-portal/portal.toml (Linux)                          │
//! │     ~/Library/Application Support/io.rfid-portal.portal/portal.toml    │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # portal.toml
//! [serial]
//! port = "/dev/ttyUSB0"   # omit to auto-detect
//! baud_rate = 115200
//! modem_line_sensors = false
//! sensor_port = "/dev/ttyUSB1"   # "#1"/"#2" sensor adapter, optional
//!
//! [reader]
//! antennas = [1, 2]
//! session = "s1"
//! target = "a"
//! power_dbm = 30
//! region = "us"
//! rf_profile = 1
//!
//! [analysis]
//! window_size = 32
//! slope_threshold = 5.0
//! variance_threshold = 4.0
//! variance_mode = "detrended"
//!
//! [direction]
//! correlation_window_ms = 3000
//! inbound_sensor = 1
//!
//! [inventory]
//! max_tags = 10000
//! round_interval_ms = 50
//! publish_interval_ms = 100
//! ```

use std::path::PathBuf;
use std::time::Duration;

use portal_core::{
    AnalyzerConfig, AntennaMask, DirectionConfig, FrameFormat, PowerDbm, ReaderConfig, SensorId,
    BROADCAST_ADDRESS, DEFAULT_BAUD_RATE,
};
use portal_store::{StoreConfig, DEFAULT_MAX_TAGS};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::EngineConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::link::LinkConfig;
use crate::retry::RetryPolicy;

// =============================================================================
// Serial Settings
// =============================================================================

/// Serial port and link settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Port path. `None` means auto-detect.
    #[serde(default)]
    pub port: Option<String>,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_reader_address")]
    pub reader_address: u8,

    #[serde(default)]
    pub frame: FrameFormat,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_queue_capacity")]
    pub event_queue_capacity: usize,

    #[serde(default = "default_max_decode_failures")]
    pub max_decode_failures: u32,

    /// Read the portal sensors from the CTS/DSR modem lines.
    #[serde(default)]
    pub modem_line_sensors: bool,

    /// Separate port of a sensor adapter reporting `#1` / `#2`.
    #[serde(default)]
    pub sensor_port: Option<String>,

    #[serde(default = "default_baud_rate")]
    pub sensor_baud_rate: u32,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}
fn default_reader_address() -> u8 {
    BROADCAST_ADDRESS
}
fn default_read_timeout() -> u64 {
    20
}
fn default_command_timeout() -> u64 {
    2000
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_max_decode_failures() -> u32 {
    64
}

impl Default for SerialSettings {
    fn default() -> Self {
        SerialSettings {
            port: None,
            baud_rate: default_baud_rate(),
            reader_address: default_reader_address(),
            frame: FrameFormat::default(),
            read_timeout_ms: default_read_timeout(),
            command_timeout_ms: default_command_timeout(),
            event_queue_capacity: default_queue_capacity(),
            max_decode_failures: default_max_decode_failures(),
            modem_line_sensors: false,
            sensor_port: None,
            sensor_baud_rate: default_baud_rate(),
        }
    }
}

// =============================================================================
// Direction Settings
// =============================================================================

/// Portal sensor correlation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionSettings {
    /// Longest gap between the two sensors triggering (milliseconds).
    #[serde(default = "default_correlation_window")]
    pub correlation_window_ms: u64,

    /// Longest time a passage may stay open (milliseconds).
    #[serde(default = "default_max_active")]
    pub max_active_ms: u64,

    /// Sensor that triggers first for an inbound passage.
    #[serde(default = "default_inbound_sensor")]
    pub inbound_sensor: SensorId,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_correlation_window() -> u64 {
    3000
}
fn default_max_active() -> u64 {
    10_000
}
fn default_inbound_sensor() -> SensorId {
    SensorId::One
}
fn default_poll_interval() -> u64 {
    100
}

impl Default for DirectionSettings {
    fn default() -> Self {
        DirectionSettings {
            correlation_window_ms: default_correlation_window(),
            max_active_ms: default_max_active(),
            inbound_sensor: default_inbound_sensor(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

// =============================================================================
// Inventory Settings
// =============================================================================

/// Inventory session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySettings {
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,

    /// Pause between inventory rounds (milliseconds).
    #[serde(default = "default_round_interval")]
    pub round_interval_ms: u64,

    /// Snapshot publication interval (milliseconds).
    #[serde(default = "default_publish_interval")]
    pub publish_interval_ms: u64,

    /// Extra attempts for a command that timed out.
    #[serde(default = "default_command_retries")]
    pub command_retries: u32,
}

fn default_max_tags() -> usize {
    DEFAULT_MAX_TAGS
}
fn default_round_interval() -> u64 {
    50
}
fn default_publish_interval() -> u64 {
    100
}
fn default_command_retries() -> u32 {
    2
}

impl Default for InventorySettings {
    fn default() -> Self {
        InventorySettings {
            max_tags: default_max_tags(),
            round_interval_ms: default_round_interval(),
            publish_interval_ms: default_publish_interval(),
            command_retries: default_command_retries(),
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete portal configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortalConfig {
    #[serde(default)]
    pub serial: SerialSettings,

    #[serde(default)]
    pub reader: ReaderConfig,

    #[serde(default)]
    pub analysis: AnalyzerConfig,

    #[serde(default)]
    pub direction: DirectionSettings,

    #[serde(default)]
    pub inventory: InventorySettings,
}

impl PortalConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (portal.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> ConfigResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading portal config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = Self::from_toml(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns defaults if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load portal config: {}. Using defaults.", e);
            Self::default()
        })
    }

    pub fn from_toml(contents: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> ConfigResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| ConfigError::SaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::SaveFailed(e.to_string()))?;
        }

        std::fs::write(&path, self.to_toml()?).map_err(|e| ConfigError::SaveFailed(e.to_string()))?;

        info!(?path, "Portal config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        let serial = &self.serial;
        if serial.baud_rate == 0 || serial.sensor_baud_rate == 0 {
            return Err(ConfigError::Invalid("baud rates must be greater than 0".into()));
        }
        if serial.frame.max_length < 3 {
            return Err(ConfigError::Invalid(format!(
                "frame.max_length ({}) must be at least 3",
                serial.frame.max_length
            )));
        }
        if serial.read_timeout_ms == 0 || serial.command_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "serial timeouts must be greater than 0".into(),
            ));
        }
        if serial.event_queue_capacity == 0 || serial.max_decode_failures == 0 {
            return Err(ConfigError::Invalid(
                "event_queue_capacity and max_decode_failures must be greater than 0".into(),
            ));
        }

        self.reader.validate()?;
        self.analysis.validate()?;

        let direction = &self.direction;
        if direction.correlation_window_ms == 0 || direction.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "correlation_window_ms and poll_interval_ms must be greater than 0".into(),
            ));
        }
        if direction.max_active_ms < direction.correlation_window_ms {
            return Err(ConfigError::Invalid(format!(
                "max_active_ms ({}) must not be shorter than correlation_window_ms ({})",
                direction.max_active_ms, direction.correlation_window_ms
            )));
        }

        let inventory = &self.inventory;
        if inventory.max_tags == 0 {
            return Err(ConfigError::Invalid("max_tags must be greater than 0".into()));
        }
        if inventory.round_interval_ms == 0 || inventory.publish_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "round_interval_ms and publish_interval_ms must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(port) = var("RFID_PORTAL_PORT") {
            debug!(port = %port, "Overriding serial port from environment");
            self.serial.port = Some(port);
        }

        if let Some(port) = var("RFID_PORTAL_SENSOR_PORT") {
            debug!(port = %port, "Overriding sensor port from environment");
            self.serial.sensor_port = Some(port);
        }

        if let Some(baud) = var("RFID_PORTAL_BAUD") {
            match baud.parse::<u32>() {
                Ok(b) => self.serial.baud_rate = b,
                Err(_) => warn!(value = %baud, "Ignoring invalid RFID_PORTAL_BAUD"),
            }
        }

        if let Some(power) = var("RFID_PORTAL_POWER") {
            match power.parse::<u8>().ok().and_then(|p| PowerDbm::try_from(p).ok()) {
                Some(p) => self.reader.power_dbm = p,
                None => warn!(value = %power, "Ignoring invalid RFID_PORTAL_POWER"),
            }
        }

        if let Some(antennas) = var("RFID_PORTAL_ANTENNAS") {
            let parsed: Result<Vec<u8>, _> =
                antennas.split(',').map(|a| a.trim().parse::<u8>()).collect();
            match parsed.ok().and_then(|list| AntennaMask::try_from(list).ok()) {
                Some(mask) => {
                    debug!(antennas = %mask, "Overriding antennas from environment");
                    self.reader.antennas = mask;
                }
                None => warn!(value = %antennas, "Ignoring invalid RFID_PORTAL_ANTENNAS"),
            }
        }

        if let Some(slope) = var("RFID_PORTAL_SLOPE_THRESHOLD") {
            match slope.parse::<f64>() {
                Ok(s) => self.analysis.slope_threshold = s,
                Err(_) => warn!(value = %slope, "Ignoring invalid RFID_PORTAL_SLOPE_THRESHOLD"),
            }
        }

        if let Some(variance) = var("RFID_PORTAL_VARIANCE_THRESHOLD") {
            match variance.parse::<f64>() {
                Ok(v) => self.analysis.variance_threshold = v,
                Err(_) => {
                    warn!(value = %variance, "Ignoring invalid RFID_PORTAL_VARIANCE_THRESHOLD")
                }
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("io", "rfid-portal", "portal")
            .map(|dirs| dirs.config_dir().join("portal.toml"))
    }

    // =========================================================================
    // Component Configs
    // =========================================================================

    pub fn link_config(&self) -> LinkConfig {
        let serial = &self.serial;
        LinkConfig {
            frame_format: serial.frame,
            reader_address: serial.reader_address,
            read_timeout: Duration::from_millis(serial.read_timeout_ms),
            command_timeout: Duration::from_millis(serial.command_timeout_ms),
            event_queue_capacity: serial.event_queue_capacity,
            max_decode_failures: serial.max_decode_failures,
            modem_line_sensors: serial.modem_line_sensors,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            direction: DirectionConfig {
                correlation_window: Duration::from_millis(self.direction.correlation_window_ms),
                max_active: Duration::from_millis(self.direction.max_active_ms),
                inbound_sensor: self.direction.inbound_sensor,
            },
            round_interval: Duration::from_millis(self.inventory.round_interval_ms),
            poll_interval: Duration::from_millis(self.direction.poll_interval_ms),
            retry: RetryPolicy::new(self.inventory.command_retries),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            analyzer: self.analysis,
            max_tags: self.inventory.max_tags,
        }
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.inventory.publish_interval_ms)
    }
}
