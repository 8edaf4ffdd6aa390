//! Micro Gateway - bridges attached microcontrollers to a coordinating
//! service.
//!
//! Microcontrollers are reached over direct serial lines or over
//! Bluetooth-bridged virtual serial lines. Each one speaks a line-oriented
//! JSON protocol in which every command carries a correlation id and every
//! reply is matched back to its command by that id.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  open   ┌─────────────────┐ enqueue ┌──────────────────┐
//! │  TransportPool  │────────►│  DeviceSession  │────────►│   CommandQueue   │
//! │ scan / slots    │         │ identity, state │◄────────│ ids, pending     │
//! └─────────────────┘         └────────┬────────┘ resolve └──────────────────┘
//!                                      │ events / requests
//!                                      ▼
//!                              ┌─────────────────┐
//!                              │     Channel     │
//!                              └─────────────────┘
//! ```
//!
//! - **Transport pool**: discovers device paths, opens line-framed
//!   connections, and hands out Bluetooth bridge slots exclusively
//! - **Device session**: one microcontroller across one transport lifetime;
//!   resolves and reconciles its identity, then accepts commands
//! - **Correlation engine**: wrapping ids, FIFO transmission, at-most-once
//!   completion
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use micro_gateway::{Gateway, LocalChannel, Result};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let gateway = Gateway::builder()
//!         .device_dir("/dev")
//!         .channel(Arc::new(LocalChannel::default()))
//!         .build()?;
//!
//!     let (_requests_tx, requests) = mpsc::unbounded_channel();
//!     gateway.run(requests).await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`channel`] | Network channel messages and seam |
//! | [`engine`] | Command correlation engine |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`gateway`] | Coordinator, configuration, client id |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Wire vocabulary and line parsing |
//! | [`session`] | Device session state machine |
//! | [`transport`] | Discovery, connections, slot pool |

// ============================================================================
// Modules
// ============================================================================

/// Network channel collaborator.
pub mod channel;

/// Command correlation engine.
///
/// One [`CommandQueue`] per session owns the session's id space.
pub mod engine;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Gateway coordinator and configuration.
///
/// Use [`Gateway::builder()`] to create a configured gateway.
pub mod gateway;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Line protocol types.
///
/// Outbound frames, inbound replies and diagnostics, device state.
pub mod protocol;

/// Device sessions.
pub mod session;

/// Transport layer.
///
/// Device discovery, line-framed connections and Bluetooth bridge slots.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Channel types
pub use channel::{Channel, ChannelEvent, ChannelRequest, DeviceRequest, LocalChannel};

// Engine types
pub use engine::{Callback, Command, CommandQueue, Response, Transform};

// Error types
pub use error::{Error, PairingFault, Result};

// Gateway types
pub use gateway::{DeviceRegistry, Gateway, GatewayBuilder, GatewayConfig};

// Identifier types
pub use identifiers::{
    ClientId, CorrelationId, DeviceId, IdSource, RandomIds, SegmentId, SlotNumber,
};

// Protocol types
pub use protocol::{CommandBody, DeviceEntity, DeviceState, Direction, ResponseKind};

// Session types
pub use session::{DeviceSession, SessionOptions, SessionState};

// Transport types
pub use transport::{
    AdvertisedDevice, BluetoothAdapter, Connection, DeviceDirectory, SlotControl, SlotPool,
    TransportDescriptor, TransportPool,
};
