//! Error types for the microcontroller gateway.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use micro_gateway::{Result, Error};
//!
//! fn example(session: &DeviceSession) -> Result<()> {
//!     session.reset()?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::Toml`] |
//! | Transport | [`Error::Connection`], [`Error::ConnectionClosed`], [`Error::Serial`], [`Error::Io`] |
//! | Protocol | [`Error::MalformedLine`], [`Error::MissingCommand`], [`Error::DuplicateCommand`], [`Error::TooManyPending`], [`Error::InvalidArgument`], [`Error::Protocol`], [`Error::Json`] |
//! | Session | [`Error::IdentityTimeout`], [`Error::SessionNotReady`], [`Error::SessionClosed`], [`Error::DeviceNotFound`] |
//! | Slots | [`Error::SlotsExhausted`], [`Error::SlotCommand`], [`Error::Pairing`] |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::io::Error as IoError;
use std::path::PathBuf;
use std::result::Result as StdResult;

use thiserror::Error;

use crate::identifiers::{CorrelationId, DeviceId, SlotNumber};

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// PairingFault
// ============================================================================

/// Classification of a Bluetooth pairing failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingFault {
    /// The peer did not answer (page timeout, host down).
    ///
    /// The device is forgotten so a later advertisement starts clean.
    Unreachable,
    /// The adapter already holds a pairing for this peer.
    AlreadyExists,
    /// Anything else. Logged only.
    Other(String),
}

impl PairingFault {
    /// Classifies a raw adapter error message.
    #[must_use]
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("page timeout")
            || lower.contains("host is down")
            || lower.contains("unreachable")
            || lower.contains("connection refused")
        {
            Self::Unreachable
        } else if lower.contains("already exists") {
            Self::AlreadyExists
        } else {
            Self::Other(message.to_string())
        }
    }
}

impl fmt::Display for PairingFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable => f.write_str("peer unreachable"),
            Self::AlreadyExists => f.write_str("already paired"),
            Self::Other(message) => f.write_str(message),
        }
    }
}

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when gateway configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// TOML configuration could not be parsed.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Transport could not be opened or used.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Transport closed while an operation was pending.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Serial port error.
    #[error("Serial error: {0}")]
    Serial(#[from] tokio_serial::Error),

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Inbound line could not be parsed.
    ///
    /// Logged at the parse boundary; never tears a session down.
    #[error("Malformed line ({message}): {line}")]
    MalformedLine {
        /// Raw line as received.
        line: String,
        /// What was wrong with it.
        message: String,
    },

    /// Response references an id with no pending command.
    ///
    /// Signals a firmware desync or a stale id replayed after reuse.
    #[error("Command {id} was missing")]
    MissingCommand {
        /// The unmatched correlation id.
        id: CorrelationId,
    },

    /// A pre-allocated id is already outstanding.
    #[error("Command {id} is already pending")]
    DuplicateCommand {
        /// The conflicting correlation id.
        id: CorrelationId,
    },

    /// Every usable correlation id is outstanding.
    #[error("Too many pending commands: {pending}")]
    TooManyPending {
        /// Number of outstanding commands.
        pending: usize,
    },

    /// Command arguments are invalid.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// Protocol violation or unexpected response.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// Device never reported an identity.
    #[error("Device on {path} did not initialize within {timeout_ms}ms")]
    IdentityTimeout {
        /// Transport path of the abandoned session.
        path: PathBuf,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Operation requires a Ready session.
    #[error("Session not ready (state: {state})")]
    SessionNotReady {
        /// Current session state.
        state: String,
    },

    /// Session has been torn down.
    #[error("Session closed")]
    SessionClosed,

    /// No Ready session holds this device id.
    #[error("Device not found: {device_id}")]
    DeviceNotFound {
        /// The missing device id.
        device_id: DeviceId,
    },

    // ========================================================================
    // Slot Errors
    // ========================================================================
    /// Every slot number is held or in use.
    #[error("No free transport slots")]
    SlotsExhausted,

    /// External slot command failed.
    #[error("Slot {slot} command failed: {message}")]
    SlotCommand {
        /// Slot the command targeted.
        slot: SlotNumber,
        /// Description of the failure.
        message: String,
    },

    /// Bluetooth pairing failed.
    #[error("Pairing with {address} failed: {fault}")]
    Pairing {
        /// Peer address.
        address: String,
        /// Classified fault.
        fault: PairingFault,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a malformed line error.
    #[inline]
    pub fn malformed_line(line: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedLine {
            line: line.into(),
            message: message.into(),
        }
    }

    /// Creates a missing command error.
    #[inline]
    pub fn missing_command(id: CorrelationId) -> Self {
        Self::MissingCommand { id }
    }

    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an identity timeout error.
    #[inline]
    pub fn identity_timeout(path: impl Into<PathBuf>, timeout_ms: u64) -> Self {
        Self::IdentityTimeout {
            path: path.into(),
            timeout_ms,
        }
    }

    /// Creates a session not ready error.
    #[inline]
    pub fn session_not_ready(state: impl fmt::Display) -> Self {
        Self::SessionNotReady {
            state: state.to_string(),
        }
    }

    /// Creates a device not found error.
    #[inline]
    pub fn device_not_found(device_id: DeviceId) -> Self {
        Self::DeviceNotFound { device_id }
    }

    /// Creates a slot command error.
    #[inline]
    pub fn slot_command(slot: SlotNumber, message: impl Into<String>) -> Self {
        Self::SlotCommand {
            slot,
            message: message.into(),
        }
    }

    /// Creates a pairing error, classifying the adapter message.
    #[inline]
    pub fn pairing(address: impl Into<String>, message: &str) -> Self {
        Self::Pairing {
            address: address.into(),
            fault: PairingFault::classify(message),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::IdentityTimeout { .. })
    }

    /// Returns `true` if this is a transport error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionClosed | Self::Serial(_) | Self::Io(_)
        )
    }

    /// Returns `true` if the device and the gateway disagree on the
    /// pending command table.
    ///
    /// Such sessions are torn down and rediscovered.
    #[inline]
    #[must_use]
    pub fn is_protocol_desync(&self) -> bool {
        matches!(self, Self::MissingCommand { .. })
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on the next scan cycle.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::IdentityTimeout { .. }
                | Self::MalformedLine { .. }
                | Self::Connection { .. }
                | Self::SlotsExhausted
        )
    }

    /// Returns the pairing fault, if this is a pairing error.
    #[inline]
    #[must_use]
    pub fn pairing_fault(&self) -> Option<&PairingFault> {
        match self {
            Self::Pairing { fault, .. } => Some(fault),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
