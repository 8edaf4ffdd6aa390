//! Transport layer: device discovery, line-framed connections, and the
//! Bluetooth bridge slot pool.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   scan    ┌──────────────────┐
//! │ DeviceDirectory  │──────────►│  TransportPool   │──► Connection ──► DeviceSession
//! │ /dev/teensyN     │           │  (live paths)    │
//! │ /dev/rfcommN     │           └────────┬─────────┘
//! └──────────────────┘                    │ close
//!          ▲                              ▼
//!          │ bind              ┌──────────────────┐
//! ┌──────────────────┐         │    SlotPool      │
//! │ BluetoothLinker  │────────►│  [0, slot_max]   │
//! └──────────────────┘         └──────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `TransportPool::scan` - List candidates without a live connection
//! 2. `TransportPool::open` - Open the stream, mark the path live
//! 3. `Connection` - Write frames, receive lines
//! 4. Close (EOF, error, shutdown) - Path forgotten, bridge slot released
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `bluetooth` | Pairing and slot binding for advertised devices |
//! | `connection` | Line-framed stream and event loop |
//! | `discovery` | Device directory scanning |
//! | `pool` | Live transport tracking and opening |
//! | `slots` | Bridge slot numbers and the `rfcomm` utility |

// ============================================================================
// Submodules
// ============================================================================

/// Bluetooth pairing and binding.
pub mod bluetooth;

/// Line-framed connection and event loop.
pub mod connection;

/// Device directory scanning.
pub mod discovery;

/// Transport pool.
pub mod pool;

/// Bridge slot pool.
pub mod slots;

// ============================================================================
// Re-exports
// ============================================================================

pub use bluetooth::{AdvertisedDevice, BluetoothAdapter, BluetoothLinker, LinkOutcome};
pub use connection::{ByteStream, CloseHandler, CloseReason, Connection, LineHandler};
pub use discovery::{DeviceDirectory, Discovery, TransportDescriptor, TransportKind};
pub use pool::{SerialOpener, TransportOpener, TransportPool};
pub use slots::{RfcommControl, SlotControl, SlotDetails, SlotPool};
