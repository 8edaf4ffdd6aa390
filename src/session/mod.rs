//! Device sessions.
//!
//! A session binds one opened transport to the correlation engine, resolves
//! the device's identity, and exposes the device's capabilities once Ready.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `device` | Session lifecycle, inbound routing, capability surface |
//! | `reconcile` | Fresh identities for placeholder devices |

// ============================================================================
// Submodules
// ============================================================================

/// Session lifecycle and capability surface.
pub mod device;

/// Placeholder identity reconciliation.
pub mod reconcile;

// ============================================================================
// Re-exports
// ============================================================================

pub use device::{DeviceSession, SessionOptions, SessionState};
pub use reconcile::Reconciliation;
