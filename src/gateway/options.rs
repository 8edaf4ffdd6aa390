//! Gateway configuration.
//!
//! Every field has a default, so an empty document is a valid
//! configuration.
//!
//! # Example
//!
//! ```ignore
//! use micro_gateway::GatewayConfig;
//!
//! let config = GatewayConfig::from_toml_str(r#"
//!     device_dir = "/dev"
//!     scan_interval_ms = 5000
//!     slot_max = 20
//! "#)?;
//!
//! assert_eq!(config.scan_interval().as_secs(), 5);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::session::SessionOptions;
use crate::transport::DeviceDirectory;
use crate::transport::bluetooth::DEFAULT_TARGET_NAME;
use crate::transport::discovery::{DEFAULT_BLUETOOTH_PATTERN, DEFAULT_SERIAL_PATTERN};
use crate::transport::pool::DEFAULT_BAUD_RATE;
use crate::transport::slots::{DEFAULT_RFCOMM_CHANNEL, DEFAULT_SLOT_MAX};

// ============================================================================
// GatewayConfig
// ============================================================================

/// Gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Directory scanned for transports.
    pub device_dir: PathBuf,

    /// Wired serial device names.
    pub serial_pattern: String,

    /// Bridge device names; capture group 1 is the slot number.
    pub bluetooth_pattern: String,

    /// Fixed serial line rate.
    pub baud_rate: u32,

    /// Discovery cycle in milliseconds.
    pub scan_interval_ms: u64,

    /// Identity wait tick in milliseconds.
    pub init_tick_ms: u64,

    /// Ticks before the identity wait times out.
    pub init_ticks: u32,

    /// Interval of the "waiting for initialization" log in milliseconds.
    pub waiting_log_interval_ms: u64,

    /// Highest bridge slot number; the pool is `[0, slot_max]`.
    pub slot_max: u16,

    /// RFCOMM channel used when binding.
    pub rfcomm_channel: u8,

    /// Advertised name of devices to pair with.
    pub bluetooth_target_name: String,

    /// Delay before acting on an advertisement, in milliseconds.
    pub device_settle_ms: u64,

    /// Persisted client id document.
    pub client_info_path: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            device_dir: PathBuf::from("/dev"),
            serial_pattern: DEFAULT_SERIAL_PATTERN.to_string(),
            bluetooth_pattern: DEFAULT_BLUETOOTH_PATTERN.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            scan_interval_ms: 3000,
            init_tick_ms: 1000,
            init_ticks: 10,
            waiting_log_interval_ms: 3000,
            slot_max: DEFAULT_SLOT_MAX,
            rfcomm_channel: DEFAULT_RFCOMM_CHANNEL,
            bluetooth_target_name: DEFAULT_TARGET_NAME.to_string(),
            device_settle_ms: 1000,
            client_info_path: PathBuf::from("./gen/clientInfo.json"),
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl GatewayConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// - [`Error::Toml`] if the document does not parse
    /// - [`Error::Config`] if a value is out of range
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the file cannot be read
    /// - same as [`Self::from_toml_str`] otherwise
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&source)
    }

    /// Checks every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("baud_rate", u64::from(self.baud_rate)),
            ("scan_interval_ms", self.scan_interval_ms),
            ("init_tick_ms", self.init_tick_ms),
            ("init_ticks", u64::from(self.init_ticks)),
            ("waiting_log_interval_ms", self.waiting_log_interval_ms),
            ("slot_max", u64::from(self.slot_max)),
        ];
        if let Some((field, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(Error::config(format!("{field} must be greater than zero")));
        }

        Regex::new(&self.serial_pattern)
            .map_err(|e| Error::config(format!("serial_pattern: {e}")))?;
        let bluetooth = Regex::new(&self.bluetooth_pattern)
            .map_err(|e| Error::config(format!("bluetooth_pattern: {e}")))?;
        if bluetooth.captures_len() < 2 {
            return Err(Error::config(
                "bluetooth_pattern must capture the slot number",
            ));
        }

        if self.bluetooth_target_name.is_empty() {
            return Err(Error::config("bluetooth_target_name must not be empty"));
        }

        Ok(())
    }
}

// ============================================================================
// Derived Settings
// ============================================================================

impl GatewayConfig {
    /// Returns the discovery cycle.
    #[inline]
    #[must_use]
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// Returns the advertisement settle delay.
    #[inline]
    #[must_use]
    pub fn device_settle(&self) -> Duration {
        Duration::from_millis(self.device_settle_ms)
    }

    /// Returns the session timing.
    #[must_use]
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            init_tick: Duration::from_millis(self.init_tick_ms),
            init_ticks: self.init_ticks,
            waiting_log_interval: Duration::from_millis(self.waiting_log_interval_ms),
        }
    }

    /// Builds the device directory scanner.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a pattern is invalid.
    pub fn directory(&self) -> Result<DeviceDirectory> {
        DeviceDirectory::new(
            &self.device_dir,
            &self.serial_pattern,
            &self.bluetooth_pattern,
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
