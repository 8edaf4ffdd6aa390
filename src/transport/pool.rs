//! Transport pool for discovered device paths.
//!
//! Tracks which device paths have a live connection, so a scan only
//! returns new candidates, and releases a transport's resources when its
//! connection closes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                TransportPool                 │
//! │  ┌────────────────────────────────────────┐  │
//! │  │ /dev/teensy0  → Serial                 │  │
//! │  │ /dev/rfcomm3  → Bluetooth { slot: 3 }  │──┼──► SlotPool
//! │  └────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

use super::connection::{ByteStream, CloseReason, Connection};
use super::discovery::{Discovery, TransportDescriptor, TransportKind};
use super::slots::SlotPool;

// ============================================================================
// Constants
// ============================================================================

/// Fixed line rate of the firmware.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

// ============================================================================
// TransportOpener
// ============================================================================

/// Opens the byte stream behind a descriptor.
#[async_trait]
pub trait TransportOpener: Send + Sync {
    /// Opens `descriptor`.
    async fn open(&self, descriptor: &TransportDescriptor) -> Result<Box<dyn ByteStream>>;
}

/// [`TransportOpener`] for serial device nodes.
#[derive(Debug, Clone, Copy)]
pub struct SerialOpener {
    baud_rate: u32,
}

impl SerialOpener {
    /// Creates an opener at the given line rate.
    #[inline]
    #[must_use]
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

impl Default for SerialOpener {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD_RATE)
    }
}

#[async_trait]
impl TransportOpener for SerialOpener {
    async fn open(&self, descriptor: &TransportDescriptor) -> Result<Box<dyn ByteStream>> {
        #[allow(unused_mut)]
        let mut stream =
            tokio_serial::new(descriptor.path.to_string_lossy(), self.baud_rate)
                .open_native_async()?;

        // Other processes may hold the port too
        #[cfg(unix)]
        stream.set_exclusive(false)?;

        Ok(Box::new(stream))
    }
}

// ============================================================================
// TransportPool
// ============================================================================

/// Live transports keyed by device path.
///
/// # Example
///
/// ```ignore
/// let pool = TransportPool::new(discovery, Arc::new(SerialOpener::default()), slots);
///
/// for descriptor in pool.scan().await? {
///     let connection = pool.open(&descriptor).await?;
/// }
/// ```
pub struct TransportPool {
    /// Candidate source.
    discovery: Arc<dyn Discovery>,
    /// Stream opener.
    opener: Arc<dyn TransportOpener>,
    /// Bridge slots.
    slots: Arc<SlotPool>,
    /// Paths with a live (or opening) connection.
    live: Mutex<FxHashMap<PathBuf, TransportKind>>,
    /// Shutdown flag.
    shutdown: AtomicBool,
}

impl fmt::Debug for TransportPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportPool")
            .field("live", &self.live_count())
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TransportPool - Constructor
// ============================================================================

impl TransportPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(
        discovery: Arc<dyn Discovery>,
        opener: Arc<dyn TransportOpener>,
        slots: Arc<SlotPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            discovery,
            opener,
            slots,
            live: Mutex::new(FxHashMap::default()),
            shutdown: AtomicBool::new(false),
        })
    }
}

// ============================================================================
// TransportPool - Public API
// ============================================================================

impl TransportPool {
    /// Returns the bridge slot pool.
    #[inline]
    #[must_use]
    pub fn slots(&self) -> &Arc<SlotPool> {
        &self.slots
    }

    /// Returns the number of live transports.
    #[inline]
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Returns `true` if `path` has a live connection.
    #[inline]
    #[must_use]
    pub fn is_live(&self, path: &Path) -> bool {
        self.live.lock().contains_key(path)
    }

    /// Lists candidates that do not have a live connection.
    ///
    /// # Errors
    ///
    /// Returns the discovery error.
    pub async fn scan(&self) -> Result<Vec<TransportDescriptor>> {
        let found = self.discovery.scan().await?;
        let live = self.live.lock();
        Ok(found
            .into_iter()
            .filter(|descriptor| !live.contains_key(&descriptor.path))
            .collect())
    }

    /// Opens a descriptor and attaches line framing.
    ///
    /// The path stays live until the returned connection closes; closing
    /// also releases the bridge slot of a Bluetooth transport. A bridge
    /// that fails to open has its slot released straight away.
    ///
    /// # Errors
    ///
    /// - [`Error::Connection`] if the path is already live or the pool is
    ///   shut down
    /// - the opener's error if the stream cannot be opened
    pub async fn open(self: &Arc<Self>, descriptor: &TransportDescriptor) -> Result<Connection> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::connection("transport pool is shut down"));
        }

        {
            let mut live = self.live.lock();
            if live.contains_key(&descriptor.path) {
                return Err(Error::connection(format!(
                    "{} is already open",
                    descriptor.path.display()
                )));
            }
            live.insert(descriptor.path.clone(), descriptor.kind);
        }

        info!(path = %descriptor.path.display(), kind = %descriptor.kind, "Opening transport");

        let stream = match self.opener.open(descriptor).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(path = %descriptor.path.display(), error = %e, "Failed to open transport");
                self.live.lock().remove(&descriptor.path);
                if let Some(slot) = descriptor.kind.slot() {
                    self.slots.adopt(slot).await;
                    if let Err(e) = self.slots.release(slot).await {
                        error!(%slot, error = %e, "Failed to release slot");
                    }
                }
                return Err(e);
            }
        };

        if let TransportKind::Bluetooth { slot } = descriptor.kind {
            self.slots.adopt(slot).await;
        }

        let connection = Connection::new(descriptor.path.clone(), stream);

        let pool = Arc::downgrade(self);
        let path = descriptor.path.clone();
        let kind = descriptor.kind;
        connection.on_close(Box::new(move |reason| {
            Self::closed(&pool, path, kind, reason);
        }));

        Ok(connection)
    }

    /// Stops accepting new transports.
    ///
    /// Live connections are left to their sessions.
    pub fn shutdown(&self) {
        info!("TransportPool shutting down");
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// TransportPool - Close Hook
// ============================================================================

impl TransportPool {
    /// Forgets a closed path and releases its slot.
    fn closed(pool: &Weak<Self>, path: PathBuf, kind: TransportKind, reason: &CloseReason) {
        let Some(pool) = pool.upgrade() else {
            return;
        };

        pool.live.lock().remove(&path);
        info!(path = %path.display(), %reason, "Transport closed");

        let Some(slot) = kind.slot() else {
            return;
        };

        let slots = Arc::clone(&pool.slots);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = slots.release(slot).await {
                        error!(%slot, error = %e, "Failed to release slot");
                    }
                });
            }
            Err(_) => warn!(%slot, "No runtime to release slot"),
        }
        debug!(path = %path.display(), %slot, "Slot release scheduled");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::{DuplexStream, duplex};

    use crate::identifiers::SlotNumber;
    use crate::transport::slots::SlotControl;
    use crate::transport::slots::tests::FakeSlots;

    struct FixedDiscovery(Vec<TransportDescriptor>);

    #[async_trait]
    impl Discovery for FixedDiscovery {
        async fn scan(&self) -> Result<Vec<TransportDescriptor>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct DuplexOpener {
        remotes: Mutex<Vec<DuplexStream>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl TransportOpener for DuplexOpener {
        async fn open(&self, _descriptor: &TransportDescriptor) -> Result<Box<dyn ByteStream>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::connection("No such file or directory"));
            }
            let (local, remote) = duplex(256);
            self.remotes.lock().push(remote);
            Ok(Box::new(local))
        }
    }

    fn setup(
        descriptors: Vec<TransportDescriptor>,
    ) -> (Arc<TransportPool>, Arc<DuplexOpener>, Arc<FakeSlots>) {
        let opener = Arc::new(DuplexOpener::default());
        let fake = Arc::new(FakeSlots::default());
        let slots = Arc::new(SlotPool::new(
            Arc::clone(&fake) as Arc<dyn SlotControl>,
            10,
            1,
        ));
        let pool = TransportPool::new(
            Arc::new(FixedDiscovery(descriptors)),
            Arc::clone(&opener) as Arc<dyn TransportOpener>,
            slots,
        );
        (pool, opener, fake)
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_scan_excludes_live_paths() {
        let serial = TransportDescriptor::serial("/dev/teensy0");
        let bridge = TransportDescriptor::bluetooth("/dev/rfcomm1", SlotNumber::new(1));
        let (pool, _opener, _fake) = setup(vec![serial.clone(), bridge.clone()]);

        assert_eq!(pool.scan().await.expect("scan").len(), 2);

        let _connection = pool.open(&serial).await.expect("open");
        assert!(pool.is_live(&serial.path));
        assert_eq!(pool.scan().await.expect("scan"), vec![bridge]);
    }

    #[tokio::test]
    async fn test_open_twice_fails() {
        let serial = TransportDescriptor::serial("/dev/teensy0");
        let (pool, _opener, _fake) = setup(vec![serial.clone()]);

        let _connection = pool.open(&serial).await.expect("open");
        let err = pool.open(&serial).await.expect_err("already live");
        assert!(matches!(err, Error::Connection { .. }));
    }

    #[tokio::test]
    async fn test_failed_open_is_not_live() {
        let serial = TransportDescriptor::serial("/dev/teensy0");
        let (pool, opener, _fake) = setup(vec![serial.clone()]);
        opener.fail.store(true, Ordering::SeqCst);

        assert!(pool.open(&serial).await.is_err());
        assert!(!pool.is_live(&serial.path));
        assert_eq!(pool.scan().await.expect("scan").len(), 1);
    }

    #[tokio::test]
    async fn test_failed_bridge_open_releases_slot() {
        let (pool, opener, fake) = setup(Vec::new());
        let slot = pool.slots().bind("98:D3:31:FB:1E:5D").await.expect("bind");
        let bridge = TransportDescriptor::bluetooth(format!("/dev/rfcomm{slot}"), slot);
        opener.fail.store(true, Ordering::SeqCst);

        assert!(pool.open(&bridge).await.is_err());
        assert!(!pool.is_live(&bridge.path));
        assert!(!pool.slots().is_held(slot));
        assert_eq!(*fake.released.lock(), vec![slot.get()]);

        // A bridge bound outside the pool is released too
        let orphan = TransportDescriptor::bluetooth("/dev/rfcomm7", SlotNumber::new(7));
        fake.bound.lock().insert(7, "11:22:33:44:55:66".to_string());
        assert!(pool.open(&orphan).await.is_err());
        assert!(!pool.slots().is_held(SlotNumber::new(7)));
        assert_eq!(*fake.released.lock(), vec![slot.get(), 7]);
    }

    #[tokio::test]
    async fn test_close_releases_path_and_slot() {
        let bridge = TransportDescriptor::bluetooth("/dev/rfcomm2", SlotNumber::new(2));
        let (pool, opener, fake) = setup(vec![bridge.clone()]);
        fake.bound.lock().insert(2, "98:D3:31:FB:1E:5D".to_string());

        let connection = pool.open(&bridge).await.expect("open");
        assert!(pool.slots().is_held(SlotNumber::new(2)));

        connection.shutdown();
        settle().await;

        assert!(!pool.is_live(&bridge.path));
        assert!(!pool.slots().is_held(SlotNumber::new(2)));
        assert_eq!(*fake.released.lock(), vec![2]);
        drop(opener);
    }

    #[tokio::test]
    async fn test_remote_disconnect_frees_path() {
        let serial = TransportDescriptor::serial("/dev/teensy3");
        let (pool, opener, fake) = setup(vec![serial.clone()]);

        let connection = pool.open(&serial).await.expect("open");
        opener.remotes.lock().clear();
        settle().await;

        assert!(connection.is_closed());
        assert!(!pool.is_live(&serial.path));
        assert!(fake.released.lock().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_transports() {
        let serial = TransportDescriptor::serial("/dev/teensy0");
        let (pool, _opener, _fake) = setup(vec![serial.clone()]);

        pool.shutdown();
        assert!(pool.open(&serial).await.is_err());
    }
}
