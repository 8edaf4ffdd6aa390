//! Builder pattern for gateway configuration.
//!
//! Provides a fluent API for configuring and creating [`Gateway`]
//! instances. Every system collaborator has a production default; tests
//! and embedders replace them through the builder.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use micro_gateway::{Gateway, GatewayConfig, LocalChannel};
//!
//! let gateway = Gateway::builder()
//!     .config(GatewayConfig::load("gateway.toml")?)
//!     .channel(Arc::new(LocalChannel::default()))
//!     .build()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::identifiers::{ClientId, IdSource, RandomIds};
use crate::transport::{
    BluetoothAdapter, BluetoothLinker, Discovery, RfcommControl, SerialOpener, SlotControl,
    SlotPool, TransportOpener, TransportPool,
};

use super::core::{Gateway, GatewayParts};
use super::options::GatewayConfig;

// ============================================================================
// GatewayBuilder
// ============================================================================

/// Builder for configuring a [`Gateway`] instance.
///
/// Use [`Gateway::builder()`] to create a new builder.
#[derive(Default, Clone)]
pub struct GatewayBuilder {
    /// Configuration values.
    config: GatewayConfig,
    /// Network channel.
    channel: Option<Arc<dyn Channel>>,
    /// Transport discovery; defaults to the configured device directory.
    discovery: Option<Arc<dyn Discovery>>,
    /// Stream opener; defaults to serial ports.
    opener: Option<Arc<dyn TransportOpener>>,
    /// Bridge slot control; defaults to the `rfcomm` utility.
    slot_control: Option<Arc<dyn SlotControl>>,
    /// Bluetooth adapter; pairing is disabled without one.
    adapter: Option<Arc<dyn BluetoothAdapter>>,
    /// Identity source; defaults to random ids.
    ids: Option<Arc<dyn IdSource>>,
}

impl fmt::Debug for GatewayBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayBuilder")
            .field("config", &self.config)
            .field("channel", &self.channel.is_some())
            .field("discovery", &self.discovery.is_some())
            .field("opener", &self.opener.is_some())
            .field("slot_control", &self.slot_control.is_some())
            .field("adapter", &self.adapter.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// GatewayBuilder Implementation
// ============================================================================

impl GatewayBuilder {
    /// Creates a builder with the default configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the directory scanned for transports.
    #[inline]
    #[must_use]
    pub fn device_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.device_dir = dir.into();
        self
    }

    /// Sets the discovery cycle.
    #[inline]
    #[must_use]
    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.config.scan_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the persisted client id document.
    #[inline]
    #[must_use]
    pub fn client_info_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.client_info_path = path.into();
        self
    }

    /// Sets the network channel.
    #[inline]
    #[must_use]
    pub fn channel(mut self, channel: Arc<dyn Channel>) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Replaces transport discovery.
    #[inline]
    #[must_use]
    pub fn discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Replaces the stream opener.
    #[inline]
    #[must_use]
    pub fn opener(mut self, opener: Arc<dyn TransportOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    /// Replaces bridge slot control.
    #[inline]
    #[must_use]
    pub fn slot_control(mut self, control: Arc<dyn SlotControl>) -> Self {
        self.slot_control = Some(control);
        self
    }

    /// Enables Bluetooth pairing through `adapter`.
    #[inline]
    #[must_use]
    pub fn bluetooth(mut self, adapter: Arc<dyn BluetoothAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Replaces the identity source used for reconciliation.
    #[inline]
    #[must_use]
    pub fn id_source(mut self, ids: Arc<dyn IdSource>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Builds the gateway with validation.
    ///
    /// Loads or creates the persisted client id.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the configuration is invalid or no channel is
    ///   set
    /// - [`Error::Io`] if the client id document cannot be written
    pub fn build(self) -> Result<Gateway> {
        self.config.validate()?;

        let channel = self.channel.ok_or_else(|| {
            Error::config(
                "Channel is required. Use .channel() to set it.\n\
                 Example: Gateway::builder().channel(Arc::new(LocalChannel::default()))",
            )
        })?;

        let config = self.config;
        let directory = config.directory()?;
        let client_id = ClientId::load_or_create(&config.client_info_path)?;

        let discovery: Arc<dyn Discovery> = match self.discovery {
            Some(discovery) => discovery,
            None => Arc::new(directory.clone()),
        };
        let opener: Arc<dyn TransportOpener> = match self.opener {
            Some(opener) => opener,
            None => Arc::new(SerialOpener::new(config.baud_rate)),
        };
        let control: Arc<dyn SlotControl> = match self.slot_control {
            Some(control) => control,
            None => Arc::new(RfcommControl::new(directory)),
        };
        let ids: Arc<dyn IdSource> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(RandomIds),
        };

        let slots = Arc::new(SlotPool::new(
            control,
            config.slot_max,
            config.rfcomm_channel,
        ));
        let linker = self.adapter.map(|adapter| {
            Arc::new(
                BluetoothLinker::new(adapter, Arc::clone(&slots))
                    .with_target_name(config.bluetooth_target_name.clone())
                    .with_settle(config.device_settle()),
            )
        });
        let pool = TransportPool::new(discovery, opener, slots);

        Ok(Gateway::new(GatewayParts {
            config,
            client_id,
            pool,
            channel,
            ids,
            linker,
        }))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    use crate::channel::LocalChannel;

    #[test]
    fn test_new_uses_default_config() {
        let builder = GatewayBuilder::new();
        assert_eq!(builder.config, GatewayConfig::default());
        assert!(builder.channel.is_none());
    }

    #[test]
    fn test_setters_update_config() {
        let builder = GatewayBuilder::new()
            .device_dir("/tmp/dev")
            .scan_interval(Duration::from_millis(250))
            .client_info_path("/tmp/client.json");
        assert_eq!(builder.config.device_dir, PathBuf::from("/tmp/dev"));
        assert_eq!(builder.config.scan_interval_ms, 250);
        assert_eq!(
            builder.config.client_info_path,
            PathBuf::from("/tmp/client.json")
        );
    }

    #[test]
    fn test_build_fails_without_channel() {
        let dir = TempDir::new().expect("temp dir");
        let err = GatewayBuilder::new()
            .client_info_path(dir.path().join("clientInfo.json"))
            .build()
            .expect_err("no channel");
        assert!(err.to_string().contains("Channel"));
    }

    #[test]
    fn test_build_fails_with_invalid_config() {
        let result = GatewayBuilder::new()
            .scan_interval(Duration::ZERO)
            .channel(Arc::new(LocalChannel::default()))
            .build();
        assert!(matches!(result, Err(Error::Config { .. })));
    }

    #[tokio::test]
    async fn test_build_persists_client_id() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("gen").join("clientInfo.json");

        let gateway = GatewayBuilder::new()
            .device_dir(dir.path())
            .client_info_path(&path)
            .channel(Arc::new(LocalChannel::default()))
            .build()
            .expect("build");

        assert!(path.exists());
        assert_eq!(
            ClientId::load_or_create(&path).expect("reload"),
            gateway.client_id()
        );
        assert_eq!(gateway.pool().live_count(), 0);
    }
}
