//! Command correlation engine.
//!
//! Assigns a wrapping correlation id to every outbound command, keeps the
//! command in a pending table until the device answers, and fans the reply
//! out to the command's completion handlers exactly once.
//!
//! # Flow
//!
//! ```text
//! enqueue(cmd) ──► pending[id] = cmd ──► outbound.push_back(frame)
//!                                              │
//!                               drain_next() ◄─┘  (FIFO, one at a time)
//!
//! reply [id, ...] ──► take(id) ──► transform ──► callbacks (in order)
//! ```
//!
//! Replies may arrive in any order; matching is by id only.

// ============================================================================
// Submodules
// ============================================================================

/// Outbound command and completion handlers.
pub mod command;

/// Id allocation, outbound queue and pending table.
pub mod queue;

// ============================================================================
// Re-exports
// ============================================================================

pub use command::{Callback, Command, Response, Transform, decode_state};
pub use queue::{CommandQueue, MAX_PENDING};
