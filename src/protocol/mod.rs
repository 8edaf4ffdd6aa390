//! Line protocol spoken with the microcontroller firmware.
//!
//! This module defines the message format for communication between the
//! gateway and one device over a half-duplex serial line.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Purpose |
//! |--------------|-----------|---------|
//! | `Request` | Gateway → Device | Numbered command |
//! | `Reply` | Device → Gateway | Response to a numbered command |
//! | `Diagnostic` | Device → Gateway | Unsolicited log/liveness line |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `command` | Command vocabulary and argument layout |
//! | `event` | Diagnostic message kinds |
//! | `request` | Outbound frames and inbound line parsing |
//! | `state` | Device state replies and the device entity |

// ============================================================================
// Submodules
// ============================================================================

/// Command vocabulary.
pub mod command;

/// Diagnostic message types.
pub mod event;

/// Request frames and inbound parsing.
pub mod request;

/// Device state and entity types.
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use command::{CommandBody, CommandTag, Direction};
pub use event::{Diagnostic, DiagnosticKind};
pub use request::{Inbound, Reply, Request, ResponseKind};
pub use state::{DeviceEntity, DeviceRecord, DeviceState, SegmentRecord, SegmentState, SegmentTable};
