//! Device directory scanning.
//!
//! Lists the device directory and classifies entries by name: wired
//! microcontrollers (`teensy0`, `teensy1`, ...) and Bluetooth serial bridges
//! (`rfcomm0`, `rfcomm1`, ...). The bridge's slot number is taken from the
//! name.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::SlotNumber;

// ============================================================================
// Constants
// ============================================================================

/// Default pattern for wired serial devices.
pub const DEFAULT_SERIAL_PATTERN: &str = r"^teensy[0-9]+$";

/// Default pattern for Bluetooth serial bridges. Group 1 is the slot.
pub const DEFAULT_BLUETOOTH_PATTERN: &str = r"^rfcomm([0-9]+)$";

// ============================================================================
// TransportKind
// ============================================================================

/// How a transport reaches its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Wired serial device.
    Serial,
    /// Bluetooth serial bridge bound to a slot.
    Bluetooth {
        /// Bridge slot number.
        slot: SlotNumber,
    },
}

impl TransportKind {
    /// Returns the bridge slot, if Bluetooth-bridged.
    #[inline]
    #[must_use]
    pub fn slot(self) -> Option<SlotNumber> {
        match self {
            Self::Serial => None,
            Self::Bluetooth { slot } => Some(slot),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => f.write_str("serial"),
            Self::Bluetooth { slot } => write!(f, "bluetooth(slot {slot})"),
        }
    }
}

// ============================================================================
// TransportDescriptor
// ============================================================================

/// A discovered device path and its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportDescriptor {
    /// Full device path.
    pub path: PathBuf,
    /// Wired or bridged.
    pub kind: TransportKind,
}

impl TransportDescriptor {
    /// Creates a wired serial descriptor.
    #[inline]
    #[must_use]
    pub fn serial(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            kind: TransportKind::Serial,
        }
    }

    /// Creates a Bluetooth bridge descriptor.
    #[inline]
    #[must_use]
    pub fn bluetooth(path: impl Into<PathBuf>, slot: SlotNumber) -> Self {
        Self {
            path: path.into(),
            kind: TransportKind::Bluetooth { slot },
        }
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// Source of candidate transports.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Lists every matching transport currently present.
    async fn scan(&self) -> Result<Vec<TransportDescriptor>>;
}

// ============================================================================
// DeviceDirectory
// ============================================================================

/// [`Discovery`] over a device directory such as `/dev`.
#[derive(Debug, Clone)]
pub struct DeviceDirectory {
    /// Directory to list.
    dir: PathBuf,
    /// Wired device name pattern.
    serial: Regex,
    /// Bridge name pattern; capture group 1 is the slot.
    bluetooth: Regex,
}

impl DeviceDirectory {
    /// Creates a scanner with custom name patterns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a pattern does not compile or the
    /// Bluetooth pattern has no capture group.
    pub fn new(
        dir: impl Into<PathBuf>,
        serial_pattern: &str,
        bluetooth_pattern: &str,
    ) -> Result<Self> {
        let serial = Regex::new(serial_pattern)
            .map_err(|e| Error::config(format!("serial pattern: {e}")))?;
        let bluetooth = Regex::new(bluetooth_pattern)
            .map_err(|e| Error::config(format!("bluetooth pattern: {e}")))?;
        if bluetooth.captures_len() < 2 {
            return Err(Error::config(
                "bluetooth pattern must capture the slot number",
            ));
        }

        Ok(Self {
            dir: dir.into(),
            serial,
            bluetooth,
        })
    }

    /// Creates a scanner with the default patterns.
    ///
    /// # Errors
    ///
    /// Same as [`Self::new`].
    pub fn with_defaults(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::new(dir, DEFAULT_SERIAL_PATTERN, DEFAULT_BLUETOOTH_PATTERN)
    }

    /// Returns the scanned directory.
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the device path for a bridge slot.
    #[must_use]
    pub fn bridge_path(&self, slot: SlotNumber) -> PathBuf {
        self.dir.join(format!("rfcomm{slot}"))
    }

    /// Classifies one directory entry name.
    #[must_use]
    pub fn classify(&self, name: &str) -> Option<TransportKind> {
        if self.serial.is_match(name) {
            return Some(TransportKind::Serial);
        }

        let captures = self.bluetooth.captures(name)?;
        let digits = captures.get(1)?.as_str();
        match digits.parse::<u16>() {
            Ok(slot) => Some(TransportKind::Bluetooth {
                slot: SlotNumber::new(slot),
            }),
            Err(_) => {
                warn!(name, "Bridge slot out of range");
                None
            }
        }
    }

    /// Lists the slots whose bridge device currently exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory cannot be read.
    pub async fn slots_present(&self) -> Result<Vec<SlotNumber>> {
        Ok(self
            .scan()
            .await?
            .into_iter()
            .filter_map(|descriptor| descriptor.kind.slot())
            .collect())
    }
}

#[async_trait]
impl Discovery for DeviceDirectory {
    async fn scan(&self) -> Result<Vec<TransportDescriptor>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut found = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(kind) = self.classify(name) {
                trace!(name, %kind, "Transport candidate");
                found.push(TransportDescriptor {
                    path: entry.path(),
                    kind,
                });
            }
        }

        found.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(found)
    }
}

// ============================================================================
// Tests
// ============================================================================
