//! Bluetooth pairing and bridge binding.
//!
//! Advertised devices come in from the adapter's discovery stream. For each
//! one carrying the target name, the linker pairs if needed and binds a
//! bridge slot so the device shows up as `/dev/rfcommN` on the next scan.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Error, PairingFault, Result};
use crate::identifiers::SlotNumber;

use super::slots::SlotPool;

// ============================================================================
// Constants
// ============================================================================

/// Default advertised name of a light controller.
pub const DEFAULT_TARGET_NAME: &str = "Remote_Lights";

/// Default delay before acting on an advertisement.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(1000);

// ============================================================================
// AdvertisedDevice
// ============================================================================

/// One device seen by the adapter's discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedDevice {
    /// Bluetooth address.
    pub address: String,
    /// Advertised name, if any.
    pub name: Option<String>,
    /// Already paired with this adapter.
    pub paired: bool,
    /// Already connected.
    pub connected: bool,
}

// ============================================================================
// BluetoothAdapter
// ============================================================================

/// Local Bluetooth adapter.
#[async_trait]
pub trait BluetoothAdapter: Send + Sync {
    /// Pairs with a device.
    ///
    /// Failures are reported as [`Error::Pairing`].
    async fn pair(&self, address: &str) -> Result<()>;

    /// Removes a device and its pairing.
    async fn forget(&self, address: &str) -> Result<()>;
}

// ============================================================================
// LinkOutcome
// ============================================================================

/// What [`BluetoothLinker::link`] did with an advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// Name did not match.
    Ignored,
    /// Device reports itself connected; nothing to bind.
    AlreadyConnected,
    /// A slot is bound to this address.
    Bound(SlotNumber),
    /// Peer unreachable during pairing; device forgotten.
    Forgotten,
    /// Pairing failed for another reason.
    PairingFailed,
}

// ============================================================================
// BluetoothLinker
// ============================================================================

/// Pairs with target devices and binds bridge slots for them.
pub struct BluetoothLinker {
    adapter: Arc<dyn BluetoothAdapter>,
    slots: Arc<SlotPool>,
    target_name: String,
    settle: Duration,
}

impl BluetoothLinker {
    /// Creates a linker with the default target name and settle delay.
    #[must_use]
    pub fn new(adapter: Arc<dyn BluetoothAdapter>, slots: Arc<SlotPool>) -> Self {
        Self {
            adapter,
            slots,
            target_name: DEFAULT_TARGET_NAME.to_string(),
            settle: DEFAULT_SETTLE,
        }
    }

    /// Sets the advertised name to link with.
    #[must_use]
    pub fn with_target_name(mut self, name: impl Into<String>) -> Self {
        self.target_name = name.into();
        self
    }

    /// Sets the delay before acting on an advertisement.
    #[must_use]
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Handles one advertisement.
    ///
    /// # Errors
    ///
    /// Returns slot errors from binding. Pairing faults are classified into
    /// the outcome instead.
    pub async fn link(&self, device: &AdvertisedDevice) -> Result<LinkOutcome> {
        if device.name.as_deref() != Some(self.target_name.as_str()) {
            return Ok(LinkOutcome::Ignored);
        }
        let address = device.address.as_str();
        info!(address, name = %self.target_name, "Detected device");

        if device.paired {
            debug!(address, "Already paired");
        } else if let Err(e) = self.adapter.pair(address).await {
            match classify(&e) {
                PairingFault::AlreadyExists => debug!(address, "Already paired"),
                PairingFault::Unreachable => {
                    warn!(address, error = %e, "Peer unreachable, forgetting device");
                    if let Err(e) = self.adapter.forget(address).await {
                        error!(address, error = %e, "Failed to forget device");
                    }
                    return Ok(LinkOutcome::Forgotten);
                }
                PairingFault::Other(message) => {
                    error!(address, error = %message, "Pairing failed");
                    return Ok(LinkOutcome::PairingFailed);
                }
            }
        }

        if device.connected {
            debug!(address, "Already connected");
            return Ok(LinkOutcome::AlreadyConnected);
        }

        info!(address, "Unconnected device found, binding slot");
        self.slots.bind(address).await.map(LinkOutcome::Bound)
    }

    /// Spawns a task handling every advertisement from `rx`.
    ///
    /// Each advertisement is handled on its own task after the settle
    /// delay. The listener ends when `rx` closes.
    pub fn spawn_listener(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<AdvertisedDevice>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(device) = rx.recv().await {
                let linker = Arc::clone(&self);
                tokio::spawn(async move {
                    tokio::time::sleep(linker.settle).await;
                    if let Err(e) = linker.link(&device).await {
                        error!(address = %device.address, error = %e, "Failed to link device");
                    }
                });
            }
            debug!("Advertisement stream closed");
        })
    }
}

/// Extracts the pairing fault from an adapter error.
fn classify(error: &Error) -> PairingFault {
    match error.pairing_fault() {
        Some(fault) => fault.clone(),
        None => PairingFault::classify(&error.to_string()),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;

    use crate::transport::slots::SlotControl;
    use crate::transport::slots::tests::FakeSlots;

    #[derive(Default)]
    struct FakeAdapter {
        pair_error: Mutex<Option<String>>,
        paired: Mutex<Vec<String>>,
        forgotten: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BluetoothAdapter for FakeAdapter {
        async fn pair(&self, address: &str) -> Result<()> {
            if let Some(message) = self.pair_error.lock().clone() {
                return Err(Error::pairing(address, &message));
            }
            self.paired.lock().push(address.to_string());
            Ok(())
        }

        async fn forget(&self, address: &str) -> Result<()> {
            self.forgotten.lock().push(address.to_string());
            Ok(())
        }
    }

    const ADDRESS: &str = "98:D3:31:FB:1E:5D";

    fn setup() -> (Arc<FakeAdapter>, Arc<FakeSlots>, BluetoothLinker) {
        let adapter = Arc::new(FakeAdapter::default());
        let fake = Arc::new(FakeSlots::default());
        let slots = Arc::new(SlotPool::new(
            Arc::clone(&fake) as Arc<dyn SlotControl>,
            10,
            1,
        ));
        let linker = BluetoothLinker::new(Arc::clone(&adapter) as Arc<dyn BluetoothAdapter>, slots);
        (adapter, fake, linker)
    }

    fn advertised(name: &str, paired: bool, connected: bool) -> AdvertisedDevice {
        AdvertisedDevice {
            address: ADDRESS.to_string(),
            name: Some(name.to_string()),
            paired,
            connected,
        }
    }

    #[tokio::test]
    async fn test_other_names_are_ignored() {
        let (adapter, fake, linker) = setup();
        let outcome = linker
            .link(&advertised("Headphones", false, false))
            .await
            .expect("link");
        assert_eq!(outcome, LinkOutcome::Ignored);
        assert!(adapter.paired.lock().is_empty());
        assert!(fake.bound.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unpaired_device_is_paired_and_bound() {
        let (adapter, fake, linker) = setup();
        let outcome = linker
            .link(&advertised(DEFAULT_TARGET_NAME, false, false))
            .await
            .expect("link");

        assert_eq!(outcome, LinkOutcome::Bound(SlotNumber::new(0)));
        assert_eq!(*adapter.paired.lock(), vec![ADDRESS.to_string()]);
        assert_eq!(fake.bound.lock().get(&0).map(String::as_str), Some(ADDRESS));
    }

    #[tokio::test]
    async fn test_connected_device_is_not_bound() {
        let (adapter, fake, linker) = setup();
        let outcome = linker
            .link(&advertised(DEFAULT_TARGET_NAME, true, true))
            .await
            .expect("link");

        assert_eq!(outcome, LinkOutcome::AlreadyConnected);
        assert!(adapter.paired.lock().is_empty());
        assert!(fake.bound.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_forgotten() {
        let (adapter, fake, linker) = setup();
        *adapter.pair_error.lock() = Some("org.bluez.Error.Failed: Page Timeout".to_string());

        let outcome = linker
            .link(&advertised(DEFAULT_TARGET_NAME, false, false))
            .await
            .expect("link");

        assert_eq!(outcome, LinkOutcome::Forgotten);
        assert_eq!(*adapter.forgotten.lock(), vec![ADDRESS.to_string()]);
        assert!(fake.bound.lock().is_empty());
    }

    #[tokio::test]
    async fn test_other_pairing_fault_is_logged_only() {
        let (adapter, fake, linker) = setup();
        *adapter.pair_error.lock() = Some("Authentication Rejected".to_string());

        let outcome = linker
            .link(&advertised(DEFAULT_TARGET_NAME, false, false))
            .await
            .expect("link");

        assert_eq!(outcome, LinkOutcome::PairingFailed);
        assert!(adapter.forgotten.lock().is_empty());
        assert!(fake.bound.lock().is_empty());
    }

    #[tokio::test]
    async fn test_already_exists_continues_to_bind() {
        let (adapter, _fake, linker) = setup();
        *adapter.pair_error.lock() = Some("Already Exists".to_string());

        let outcome = linker
            .link(&advertised(DEFAULT_TARGET_NAME, false, false))
            .await
            .expect("link");
        assert!(matches!(outcome, LinkOutcome::Bound(_)));
    }

    #[tokio::test]
    async fn test_listener_links_after_settle() {
        tokio::time::pause();
        let (_adapter, fake, linker) = setup();
        let linker = Arc::new(linker.with_settle(Duration::from_millis(500)));

        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Arc::clone(&linker).spawn_listener(rx);

        tx.send(advertised(DEFAULT_TARGET_NAME, true, false))
            .expect("send");
        drop(tx);
        listener.await.expect("listener");

        assert!(fake.bound.lock().is_empty());
        tokio::time::sleep(Duration::from_millis(600)).await;
        for _ in 0..100 {
            if !fake.bound.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(fake.bound.lock().len(), 1);
    }
}
