//! Gateway coordinator.
//!
//! The [`Gateway`] owns the transport pool, every open device session and
//! the registry of Ready devices. It runs the discovery cycle and routes
//! channel requests to sessions.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use micro_gateway::{Gateway, LocalChannel};
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> micro_gateway::Result<()> {
//! let gateway = Gateway::builder()
//!     .device_dir("/dev")
//!     .channel(Arc::new(LocalChannel::default()))
//!     .build()?;
//!
//! let (_requests_tx, requests) = mpsc::unbounded_channel();
//! gateway.run(requests).await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::join_all;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, ChannelRequest};
use crate::error::{Error, Result};
use crate::identifiers::{ClientId, DeviceId, IdSource};
use crate::session::{DeviceSession, SessionState};
use crate::transport::{AdvertisedDevice, BluetoothLinker, TransportPool};

use super::builder::GatewayBuilder;
use super::options::GatewayConfig;
use super::registry::DeviceRegistry;

// ============================================================================
// Types
// ============================================================================

/// Collaborators assembled by [`GatewayBuilder`].
pub(crate) struct GatewayParts {
    pub config: GatewayConfig,
    pub client_id: ClientId,
    pub pool: Arc<TransportPool>,
    pub channel: Arc<dyn Channel>,
    pub ids: Arc<dyn IdSource>,
    pub linker: Option<Arc<BluetoothLinker>>,
}

/// Internal shared state for the gateway.
struct GatewayInner {
    /// Validated configuration.
    config: GatewayConfig,

    /// Persisted identity of this gateway.
    client_id: ClientId,

    /// Transport pool.
    pool: Arc<TransportPool>,

    /// Network channel shared by every session.
    channel: Arc<dyn Channel>,

    /// Identity source for reconciliation.
    ids: Arc<dyn IdSource>,

    /// Bluetooth pairing flow, when an adapter is configured.
    linker: Option<Arc<BluetoothLinker>>,

    /// Ready sessions by device identity.
    registry: Mutex<DeviceRegistry>,

    /// Every open session by transport path, Ready or not.
    sessions: Mutex<FxHashMap<PathBuf, DeviceSession>>,

    /// Advertisement listener task.
    listener: Mutex<Option<JoinHandle<()>>>,

    /// Set once by shutdown.
    shutdown: AtomicBool,

    /// Wakes the run loop on shutdown.
    stop: Notify,
}

// ============================================================================
// Gateway
// ============================================================================

/// Microcontroller gateway.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("client_id", &self.inner.client_id)
            .field("device_dir", &self.inner.config.device_dir)
            .field("session_count", &self.session_count())
            .field("ready_count", &self.ready_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Gateway - Public API
// ============================================================================

impl Gateway {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Returns this gateway's persisted identity.
    #[inline]
    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.inner.client_id
    }

    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Returns the transport pool.
    #[inline]
    #[must_use]
    pub fn pool(&self) -> &Arc<TransportPool> {
        &self.inner.pool
    }

    /// Returns the Ready session for `device_id`.
    #[must_use]
    pub fn session(&self, device_id: DeviceId) -> Option<DeviceSession> {
        self.inner.registry.lock().get(device_id)
    }

    /// Returns the identities of every Ready device.
    #[must_use]
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.inner.registry.lock().device_ids()
    }

    /// Returns the number of open sessions, Ready or not.
    #[inline]
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    /// Returns the number of Ready sessions.
    #[inline]
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Returns `true` once [`Self::shutdown`] was called.
    #[inline]
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Runs the discovery cycle and dispatches `requests` until shutdown.
    ///
    /// Each cycle runs on its own task, so a slow initialization never
    /// delays request dispatch. Failures are logged; nothing here stops the
    /// loop except [`Self::shutdown`].
    pub async fn run(&self, mut requests: mpsc::UnboundedReceiver<ChannelRequest>) {
        info!(
            client_id = %self.inner.client_id,
            device_dir = %self.inner.config.device_dir.display(),
            "Gateway running"
        );

        let mut interval = tokio::time::interval(self.inner.config.scan_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut requests_open = true;

        while !self.is_shut_down() {
            tokio::select! {
                () = self.inner.stop.notified() => break,

                _ = interval.tick() => {
                    let gateway = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = gateway.scan_once().await {
                            warn!(error = %e, "Discovery cycle failed");
                        }
                    });
                }

                request = requests.recv(), if requests_open => match request {
                    Some(request) => {
                        if let Err(e) = self.dispatch(request) {
                            warn!(error = %e, "Channel request failed");
                        }
                    }
                    None => {
                        debug!("Request stream closed");
                        requests_open = false;
                    }
                },
            }
        }

        info!("Gateway stopped");
    }

    /// Runs one discovery cycle.
    ///
    /// Opens every new candidate, initializes the sessions concurrently and
    /// registers those that become Ready. Returns how many did.
    ///
    /// # Errors
    ///
    /// Returns the discovery error if the device namespace cannot be
    /// listed. Per-device failures are logged instead.
    pub async fn scan_once(&self) -> Result<usize> {
        if self.is_shut_down() {
            return Ok(0);
        }

        let descriptors = self.inner.pool.scan().await?;
        if descriptors.is_empty() {
            trace!("No new transports");
            return Ok(0);
        }
        debug!(count = descriptors.len(), "New transports found");

        let mut opened = Vec::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            match self.inner.pool.open(descriptor).await {
                Ok(connection) => {
                    info!(path = %descriptor.path.display(), kind = %descriptor.kind, "Port opened");
                    let session = DeviceSession::open(
                        connection,
                        Arc::clone(&self.inner.channel),
                        Arc::clone(&self.inner.ids),
                        self.inner.config.session_options(),
                    );
                    self.track(session.clone());
                    opened.push(session);
                }
                Err(e) => {
                    warn!(path = %descriptor.path.display(), error = %e, "Failed to open port");
                }
            }
        }

        let results = join_all(opened.iter().map(|session| session.initialize())).await;

        let mut ready = 0;
        for (session, result) in opened.iter().zip(results) {
            match result {
                Ok(device_id) => {
                    if self.register(device_id, session) {
                        ready += 1;
                    }
                }
                Err(e) => {
                    warn!(path = %session.path().display(), error = %e, "Device failed to initialize");
                }
            }
        }

        if ready > 0 {
            info!(ready, total = self.ready_count(), "Devices ready");
        }
        Ok(ready)
    }

    /// Routes one channel request.
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceNotFound`] if no Ready session holds the device
    /// - the session's error if it rejects the request
    pub fn dispatch(&self, request: ChannelRequest) -> Result<()> {
        match request {
            ChannelRequest::Device { device_id, request } => {
                let session = self
                    .session(device_id)
                    .ok_or_else(|| Error::device_not_found(device_id))?;
                session.handle_request(request)?;
                Ok(())
            }
            ChannelRequest::ReinitState => {
                let sessions = self.inner.registry.lock().sessions();
                info!(count = sessions.len(), "Re-querying device state");
                for session in sessions {
                    if let Err(e) = session.query_state() {
                        warn!(path = %session.path().display(), error = %e, "State query failed");
                    }
                }
                Ok(())
            }
        }
    }

    /// Feeds Bluetooth advertisements into the pairing flow.
    ///
    /// Replaces any previous advertisement stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no Bluetooth adapter was configured.
    pub fn link_advertisements(
        &self,
        advertisements: mpsc::UnboundedReceiver<AdvertisedDevice>,
    ) -> Result<()> {
        let linker = self.inner.linker.as_ref().ok_or_else(|| {
            Error::config(
                "Bluetooth adapter is required. Use .bluetooth() to set it.",
            )
        })?;

        let handle = Arc::clone(linker).spawn_listener(advertisements);
        if let Some(previous) = self.inner.listener.lock().replace(handle) {
            previous.abort();
        }
        debug!("Advertisement listener started");
        Ok(())
    }

    /// Tears every session down and stops the run loop. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.stop.notify_one();

        if let Some(listener) = self.inner.listener.lock().take() {
            listener.abort();
        }

        let sessions: Vec<DeviceSession> = {
            let mut map = self.inner.sessions.lock();
            map.drain().map(|(_, session)| session).collect()
        };
        info!(count = sessions.len(), "Shutting down all sessions");

        for session in sessions {
            session.teardown();
        }
        self.inner.registry.lock().drain();
        self.inner.pool.shutdown();
    }
}

// ============================================================================
// Gateway - Internal API
// ============================================================================

impl Gateway {
    /// Assembles a gateway from built collaborators.
    pub(crate) fn new(parts: GatewayParts) -> Self {
        let inner = Arc::new(GatewayInner {
            config: parts.config,
            client_id: parts.client_id,
            pool: parts.pool,
            channel: parts.channel,
            ids: parts.ids,
            linker: parts.linker,
            registry: Mutex::new(DeviceRegistry::new()),
            sessions: Mutex::new(FxHashMap::default()),
            listener: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            stop: Notify::new(),
        });

        info!(client_id = %inner.client_id, "Gateway initialized");
        Self { inner }
    }

    /// Tracks an open session until it closes.
    fn track(&self, session: DeviceSession) {
        self.inner
            .sessions
            .lock()
            .insert(session.path().to_path_buf(), session.clone());

        let inner = Arc::downgrade(&self.inner);
        let mut state = session.watch_state();
        tokio::spawn(async move {
            let _ = state.wait_for(|s| *s == SessionState::Closed).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };

            {
                let mut sessions = inner.sessions.lock();
                if sessions
                    .get(session.path())
                    .is_some_and(|current| current.same_session(&session))
                {
                    sessions.remove(session.path());
                }
            }
            if let Some(device_id) = session.device_id()
                && inner.registry.lock().remove(device_id, &session)
            {
                info!(%device_id, path = %session.path().display(), "Device removed");
            }
            debug!(path = %session.path().display(), "Session released");
        });
    }

    /// Registers a Ready session unless it already closed.
    fn register(&self, device_id: DeviceId, session: &DeviceSession) -> bool {
        let mut registry = self.inner.registry.lock();
        // Checked under the registry lock so the close watcher cannot miss it
        if session.is_closed() || self.is_shut_down() {
            return false;
        }
        registry.insert(device_id, session.clone());
        true
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use tokio::io::{
        AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
    };
    use tokio::time::timeout;

    use crate::channel::{DeviceRequest, LocalChannel};
    use crate::transport::slots::tests::FakeSlots;
    use crate::transport::{
        ByteStream, Discovery, SlotControl, TransportDescriptor, TransportOpener,
    };

    const WAIT: Duration = Duration::from_secs(5);

    struct FixedDiscovery(Vec<TransportDescriptor>);

    #[async_trait]
    impl Discovery for FixedDiscovery {
        async fn scan(&self) -> Result<Vec<TransportDescriptor>> {
            Ok(self.0.clone())
        }
    }

    /// Hands the device side of every opened stream to the test.
    struct DuplexOpener(mpsc::UnboundedSender<DuplexStream>);

    #[async_trait]
    impl TransportOpener for DuplexOpener {
        async fn open(&self, _descriptor: &TransportDescriptor) -> Result<Box<dyn ByteStream>> {
            let (local, remote) = tokio::io::duplex(4096);
            self.0
                .send(remote)
                .map_err(|_| Error::connection("test harness gone"))?;
            Ok(Box::new(local))
        }
    }

    struct FakeDevice {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeDevice {
        fn new(stream: DuplexStream) -> Self {
            let (read, writer) = tokio::io::split(stream);
            Self {
                lines: BufReader::new(read).lines(),
                writer,
            }
        }

        async fn expect_line(&mut self) -> String {
            timeout(WAIT, self.lines.next_line())
                .await
                .expect("timely line")
                .expect("read")
                .expect("line")
        }

        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .expect("write");
        }
    }

    struct Harness {
        gateway: Gateway,
        remotes: mpsc::UnboundedReceiver<DuplexStream>,
        _dir: TempDir,
    }

    fn harness(config: GatewayConfig, paths: &[&str]) -> Harness {
        let dir = TempDir::new().expect("temp dir");
        let (tx, remotes) = mpsc::unbounded_channel();
        let gateway = Gateway::builder()
            .config(config)
            .client_info_path(dir.path().join("clientInfo.json"))
            .channel(Arc::new(LocalChannel::default()))
            .discovery(Arc::new(FixedDiscovery(
                paths.iter().map(|p| TransportDescriptor::serial(*p)).collect(),
            )))
            .opener(Arc::new(DuplexOpener(tx)))
            .slot_control(Arc::new(FakeSlots::default()) as Arc<dyn SlotControl>)
            .build()
            .expect("build");
        Harness {
            gateway,
            remotes,
            _dir: dir,
        }
    }

    async fn next_device(remotes: &mut mpsc::UnboundedReceiver<DuplexStream>) -> FakeDevice {
        let stream = timeout(WAIT, remotes.recv())
            .await
            .expect("timely open")
            .expect("stream");
        FakeDevice::new(stream)
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition reached");
    }

    #[tokio::test]
    async fn test_scan_registers_ready_devices_and_routes_requests() {
        let mut h = harness(GatewayConfig::default(), &["/dev/teensy0"]);

        let gateway = h.gateway.clone();
        let scan = tokio::spawn(async move { gateway.scan_once().await });

        let mut device = next_device(&mut h.remotes).await;
        assert_eq!(device.expect_line().await, "[[1,1],[1]]");
        device.send("[1,[7,50,150,[[0,150,1,3]]]]").await;

        assert_eq!(scan.await.expect("join").expect("scan"), 1);
        assert_eq!(h.gateway.device_ids(), vec![DeviceId::new(7)]);
        assert_eq!(h.gateway.session_count(), 1);

        // The live transport is not offered again
        assert_eq!(h.gateway.scan_once().await.expect("scan"), 0);

        h.gateway
            .dispatch(ChannelRequest::Device {
                device_id: DeviceId::new(7),
                request: DeviceRequest::SetBrightness { brightness: 80 },
            })
            .expect("dispatch");
        assert_eq!(device.expect_line().await, "[[2,1],[6,80]]");

        let err = h
            .gateway
            .dispatch(ChannelRequest::Device {
                device_id: DeviceId::new(8),
                request: DeviceRequest::Reset,
            })
            .expect_err("unknown device");
        assert!(matches!(err, Error::DeviceNotFound { .. }));

        h.gateway
            .dispatch(ChannelRequest::ReinitState)
            .expect("reinit");
        assert_eq!(device.expect_line().await, "[[3,1],[1]]");

        drop(device);
        let gateway = h.gateway.clone();
        eventually(move || gateway.ready_count() == 0 && gateway.session_count() == 0).await;
        assert_eq!(h.gateway.pool().live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_is_not_registered() {
        let config = GatewayConfig {
            init_ticks: 2,
            ..GatewayConfig::default()
        };
        let mut h = harness(config, &["/dev/teensy0"]);

        let gateway = h.gateway.clone();
        let scan = tokio::spawn(async move { gateway.scan_once().await });
        let mut device = next_device(&mut h.remotes).await;
        assert_eq!(device.expect_line().await, "[[1,1],[1]]");

        assert_eq!(scan.await.expect("join").expect("scan"), 0);
        assert!(h.gateway.device_ids().is_empty());

        let gateway = h.gateway.clone();
        eventually(move || gateway.session_count() == 0).await;
    }

    #[tokio::test]
    async fn test_run_dispatches_until_shutdown() {
        let config = GatewayConfig {
            scan_interval_ms: 10,
            ..GatewayConfig::default()
        };
        let mut h = harness(config, &["/dev/teensy1"]);

        let (requests_tx, requests) = mpsc::unbounded_channel();
        let gateway = h.gateway.clone();
        let run = tokio::spawn(async move { gateway.run(requests).await });

        let mut device = next_device(&mut h.remotes).await;
        assert_eq!(device.expect_line().await, "[[1,1],[1]]");
        device.send("[1,[12,50,150,[]]]").await;

        let gateway = h.gateway.clone();
        eventually(move || gateway.ready_count() == 1).await;

        requests_tx
            .send(ChannelRequest::Device {
                device_id: DeviceId::new(12),
                request: DeviceRequest::WritePersistedConfig,
            })
            .expect("send");
        assert_eq!(device.expect_line().await, "[[2,1],[9]]");

        h.gateway.shutdown();
        timeout(WAIT, run)
            .await
            .expect("run stops")
            .expect("join");

        assert!(h.gateway.is_shut_down());
        assert_eq!(h.gateway.ready_count(), 0);
        assert_eq!(h.gateway.scan_once().await.expect("scan"), 0);
    }

    #[tokio::test]
    async fn test_advertisements_need_adapter() {
        let h = harness(GatewayConfig::default(), &[]);
        let (_tx, rx) = mpsc::unbounded_channel();
        assert!(matches!(
            h.gateway.link_advertisements(rx),
            Err(Error::Config { .. })
        ));
    }
}
