//! Unsolicited diagnostic messages.
//!
//! Lines whose correlation id is `0` are not replies: the firmware uses
//! them to report errors, warnings and liveness. They are logged, never
//! correlated.
//!
//! | Kind | Value | Log level |
//! |------|-------|-----------|
//! | `Error` | 130 | `error` |
//! | `Warning` | 131 | `warn` |
//! | `Info` | 132 | `info` |
//! | `Debug` | 133 | `debug` |
//! | `Ping` | 134 | `debug` |
//! | `Pong` | 135 | `debug` |
//! | `CommandSuccess` | 136 | `debug` |
//! | `CommandFailure` | 137 | `warn` |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::path::Path;

use serde_json::Value;
use tracing::{debug, error, info, warn};

// ============================================================================
// DiagnosticKind
// ============================================================================

/// Message kind of an unsolicited device line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    /// Firmware error.
    Error,
    /// Firmware warning.
    Warning,
    /// Informational message.
    Info,
    /// Debug output.
    Debug,
    /// Liveness probe.
    Ping,
    /// Liveness answer.
    Pong,
    /// A command completed.
    CommandSuccess,
    /// A command failed on the device.
    CommandFailure,
    /// Any other kind.
    Unknown(u64),
}

impl DiagnosticKind {
    /// Maps a wire value to a kind.
    #[must_use]
    pub const fn from_wire(value: u64) -> Self {
        match value {
            130 => Self::Error,
            131 => Self::Warning,
            132 => Self::Info,
            133 => Self::Debug,
            134 => Self::Ping,
            135 => Self::Pong,
            136 => Self::CommandSuccess,
            137 => Self::CommandFailure,
            other => Self::Unknown(other),
        }
    }

    /// Returns the kind name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warning => "WARNING",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::CommandSuccess => "COMMAND_SUCCESS",
            Self::CommandFailure => "COMMAND_FAILURE",
            Self::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(value) => write!(f, "UNKNOWN({value})"),
            other => f.write_str(other.name()),
        }
    }
}

// ============================================================================
// Diagnostic
// ============================================================================

/// An unsolicited diagnostic line.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    /// Message kind.
    pub kind: DiagnosticKind,

    /// Freeform data following the kind.
    pub data: Vec<Value>,
}

impl Diagnostic {
    /// Renders the data elements space-separated.
    #[must_use]
    pub fn render(&self) -> String {
        self.data
            .iter()
            .map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Logs the message at the level matching its kind.
    pub fn log(&self, path: &Path) {
        let path = path.display();
        let message = self.render();
        match self.kind {
            DiagnosticKind::Error => error!(%path, %message, "Device error"),
            DiagnosticKind::Warning | DiagnosticKind::CommandFailure => {
                warn!(%path, kind = %self.kind, %message, "Device warning");
            }
            DiagnosticKind::Info => info!(%path, %message, "Device info"),
            DiagnosticKind::Debug
            | DiagnosticKind::Ping
            | DiagnosticKind::Pong
            | DiagnosticKind::CommandSuccess => {
                debug!(%path, kind = %self.kind, %message, "Device diagnostic");
            }
            DiagnosticKind::Unknown(value) => {
                error!(%path, kind = value, data = ?self.data, "Unknown response type");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
