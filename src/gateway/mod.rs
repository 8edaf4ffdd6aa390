//! Gateway coordinator and configuration.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Gateway`] | Discovery cycle, session tracking, request routing |
//! | [`GatewayBuilder`] | Fluent configuration builder |
//! | [`GatewayConfig`] | TOML-loadable settings |
//! | [`DeviceRegistry`] | Ready sessions by device identity |
//!
//! The persisted client identity lives here too, as
//! [`ClientId::load_or_create`](crate::identifiers::ClientId::load_or_create).

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder pattern for gateway configuration.
pub mod builder;

/// Persisted client identity.
pub mod client_id;

/// Core gateway implementation.
pub mod core;

/// Gateway settings.
pub mod options;

/// Ready device registry.
pub mod registry;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::GatewayBuilder;
pub use core::Gateway;
pub use options::GatewayConfig;
pub use registry::DeviceRegistry;
