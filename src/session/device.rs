//! One microcontroller across one transport lifetime.
//!
//! A [`DeviceSession`] owns its connection, its command queue and its
//! identity. Inbound lines are parsed and routed into the queue by
//! correlation id; a drain task writes queued frames in enqueue order.
//!
//! # State Machine
//!
//! ```text
//! Opening ──► AwaitingIdentity ──► Ready ──► Closed
//!                    │                          ▲
//!                    └──────── timeout ─────────┘
//! ```
//!
//! No transition leaves `Closed`. Externally requested commands are only
//! accepted in `Ready`.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{Channel, ChannelEvent, DeviceRequest};
use crate::engine::{Callback, Command, CommandQueue, MAX_PENDING, decode_state};
use crate::error::{Error, Result};
use crate::identifiers::{CorrelationId, DeviceId, IdSource, SegmentId};
use crate::protocol::{CommandBody, DeviceEntity, DeviceState, Direction, Inbound, Reply, Request};
use crate::transport::{CloseReason, Connection};

use super::reconcile::Reconciliation;

// ============================================================================
// Constants
// ============================================================================

/// Default identity wait tick.
pub const DEFAULT_INIT_TICK: Duration = Duration::from_millis(1000);

/// Default ticks before the identity wait times out.
pub const DEFAULT_INIT_TICKS: u32 = 10;

/// Default interval of the "waiting for initialization" log.
pub const DEFAULT_WAITING_LOG_INTERVAL: Duration = Duration::from_millis(3000);

// ============================================================================
// SessionState
// ============================================================================

/// Lifecycle state of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Transport attached, listeners being wired.
    Opening,
    /// Waiting for the first state reply.
    AwaitingIdentity,
    /// Identity known; external commands accepted.
    Ready,
    /// Torn down. Terminal.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Opening => "opening",
            Self::AwaitingIdentity => "awaiting identity",
            Self::Ready => "ready",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// SessionOptions
// ============================================================================

/// Timing of a session's identity wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Length of one wait tick.
    pub init_tick: Duration,
    /// Ticks before giving up.
    pub init_ticks: u32,
    /// Interval of the "waiting" reminder log.
    pub waiting_log_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            init_tick: DEFAULT_INIT_TICK,
            init_ticks: DEFAULT_INIT_TICKS,
            waiting_log_interval: DEFAULT_WAITING_LOG_INTERVAL,
        }
    }
}

impl SessionOptions {
    /// Returns the total identity wait.
    #[inline]
    #[must_use]
    pub fn init_timeout(&self) -> Duration {
        self.init_tick.saturating_mul(self.init_ticks)
    }
}

// ============================================================================
// DeviceSession
// ============================================================================

/// Handle to one device session.
///
/// Cheap to clone; clones share the session.
///
/// # Example
///
/// ```ignore
/// let connection = pool.open(&descriptor).await?;
/// let session = DeviceSession::open(connection, channel, Arc::new(RandomIds), SessionOptions::default());
///
/// let device_id = session.initialize().await?;
/// session.set_brightness(80)?;
/// ```
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("path", &self.inner.path)
            .field("state", &self.state())
            .field("device_id", &self.device_id())
            .finish_non_exhaustive()
    }
}

/// Shared session state.
struct SessionInner {
    /// Transport path, for logs and events.
    path: PathBuf,
    /// Line-framed transport.
    connection: Connection,
    /// Network channel.
    channel: Arc<dyn Channel>,
    /// Fresh identity source for reconciliation.
    ids: Arc<dyn IdSource>,
    /// Identity wait timing.
    options: SessionOptions,
    /// Correlation engine. Never locked across an `.await`.
    queue: Mutex<CommandQueue>,
    /// Lifecycle state.
    state: watch::Sender<SessionState>,
    /// Identity, once resolved.
    device_id: Mutex<Option<DeviceId>>,
    /// Last published entity.
    entity: Mutex<Option<DeviceEntity>>,
    /// Wakes the drain task.
    wake: Arc<Notify>,
    /// Drain task handle.
    drain: Mutex<Option<JoinHandle<()>>>,
    /// Set once by teardown.
    closed: AtomicBool,
}

// ============================================================================
// DeviceSession - Lifecycle
// ============================================================================

impl DeviceSession {
    /// Binds a session to an opened connection.
    ///
    /// Starts listening for inbound lines, registers teardown on transport
    /// close, and starts the drain task. Must be called from within a tokio
    /// runtime.
    #[must_use]
    pub fn open(
        connection: Connection,
        channel: Arc<dyn Channel>,
        ids: Arc<dyn IdSource>,
        options: SessionOptions,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Opening);
        let inner = Arc::new(SessionInner {
            path: connection.path().to_path_buf(),
            connection,
            channel,
            ids,
            options,
            queue: Mutex::new(CommandQueue::new()),
            state,
            device_id: Mutex::new(None),
            entity: Mutex::new(None),
            wake: Arc::new(Notify::new()),
            drain: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        inner.connection.set_line_handler(Arc::new(move |line| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_line(line);
            }
        }));

        let weak = Arc::downgrade(&inner);
        inner.connection.on_close(Box::new(move |reason| {
            if let Some(inner) = weak.upgrade() {
                inner.transport_closed(reason);
            }
        }));

        let drain = tokio::spawn(SessionInner::drain_loop(
            Arc::downgrade(&inner),
            Arc::clone(&inner.wake),
        ));
        *inner.drain.lock() = Some(drain);

        inner.state.send_if_modified(|state| {
            if *state == SessionState::Opening {
                *state = SessionState::AwaitingIdentity;
                true
            } else {
                false
            }
        });
        debug!(path = %inner.path.display(), "Session opened");

        Self { inner }
    }

    /// Queries the device state and waits for its identity.
    ///
    /// Resolves as soon as the first state reply has been handled. On
    /// timeout the session is torn down.
    ///
    /// # Errors
    ///
    /// - [`Error::IdentityTimeout`] if no state reply arrives in time
    /// - [`Error::SessionClosed`] if the session closes while waiting
    pub async fn initialize(&self) -> Result<DeviceId> {
        match self.state() {
            SessionState::Ready => return self.device_id().ok_or(Error::SessionClosed),
            SessionState::Closed => return Err(Error::SessionClosed),
            SessionState::Opening | SessionState::AwaitingIdentity => {}
        }

        self.query_state()?;

        let inner = &self.inner;
        let budget = inner.options.init_timeout();
        let mut rx = inner.state.subscribe();

        let outcome = timeout(budget, async {
            tokio::select! {
                result = rx.wait_for(|s| matches!(s, SessionState::Ready | SessionState::Closed)) => {
                    result.map(|state| *state).unwrap_or(SessionState::Closed)
                }
                () = inner.log_waiting() => SessionState::Closed,
            }
        })
        .await;

        match outcome {
            Ok(SessionState::Ready) => {
                let device_id = self.device_id().ok_or(Error::SessionClosed)?;
                info!(path = %inner.path.display(), %device_id, "Device initialized");
                Ok(device_id)
            }
            Ok(_) => Err(Error::SessionClosed),
            Err(_) => {
                let timeout_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX);
                warn!(path = %inner.path.display(), timeout_ms, "Device did not initialize");
                inner.teardown();
                Err(Error::identity_timeout(&inner.path, timeout_ms))
            }
        }
    }

    /// Tears the session down.
    ///
    /// Stops the drain task, purges every pending command, closes the
    /// transport and detaches the device route. Idempotent.
    pub fn teardown(&self) {
        self.inner.teardown();
    }
}

// ============================================================================
// DeviceSession - Accessors
// ============================================================================

impl DeviceSession {
    /// Returns the transport path.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Returns the lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Subscribes to lifecycle changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Returns `true` once the session is torn down.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Returns the device identity, once resolved.
    #[inline]
    #[must_use]
    pub fn device_id(&self) -> Option<DeviceId> {
        *self.inner.device_id.lock()
    }

    /// Returns the last published entity.
    #[must_use]
    pub fn entity(&self) -> Option<DeviceEntity> {
        self.inner.entity.lock().clone()
    }

    /// Returns the number of outstanding commands.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.queue.lock().pending_count()
    }

    /// Returns `true` if both handles refer to the same session.
    #[inline]
    #[must_use]
    pub fn same_session(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

// ============================================================================
// DeviceSession - Commands
// ============================================================================

impl DeviceSession {
    /// Queues a command expecting a plain acknowledgement.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionClosed`] after teardown
    /// - the queue's error if the payload is invalid or the queue is full
    pub fn issue(&self, body: CommandBody, callbacks: Vec<Callback>) -> Result<CorrelationId> {
        self.inner
            .enqueue(Command::new(body).with_callbacks(callbacks))
    }

    /// Queues a fully built command.
    ///
    /// Use with [`Self::next_id`] to send commands with a pre-allocated id
    /// or a non-default response kind.
    ///
    /// # Errors
    ///
    /// Same as [`Self::issue`], plus [`Error::DuplicateCommand`] if the
    /// pre-allocated id is outstanding.
    pub fn issue_command(&self, command: Command) -> Result<CorrelationId> {
        self.inner.enqueue(command)
    }

    /// Pre-allocates a correlation id.
    #[must_use]
    pub fn next_id(&self) -> CorrelationId {
        self.inner.queue.lock().next_id()
    }

    /// Queries the device state.
    ///
    /// The reply is reconciled, stored and published before `callbacks`
    /// run.
    ///
    /// # Errors
    ///
    /// Same as [`Self::issue`].
    pub fn query_state(&self) -> Result<CorrelationId> {
        self.query_state_with(Vec::new())
    }

    /// Queries the device state with extra completion handlers.
    ///
    /// # Errors
    ///
    /// Same as [`Self::issue`].
    pub fn query_state_with(&self, callbacks: Vec<Callback>) -> Result<CorrelationId> {
        let weak = Arc::downgrade(&self.inner);
        let command = Command::new(CommandBody::GetState)
            .with_transform(decode_state())
            .on_complete(move |response, _| {
                if let Some(inner) = weak.upgrade()
                    && let Some(state) = response.as_state()
                {
                    inner.handle_state(state.clone());
                }
            })
            .with_callbacks(callbacks);
        self.inner.enqueue(command)
    }

    /// Reboots the firmware.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotReady`] unless Ready.
    pub fn reset(&self) -> Result<CorrelationId> {
        info!(path = %self.inner.path.display(), "Resetting device");
        self.issue_ready(CommandBody::ResetDevice)
    }

    /// Persists the running configuration on the device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotReady`] unless Ready.
    pub fn write_persisted_config(&self) -> Result<CorrelationId> {
        self.issue_ready(CommandBody::WritePersistedConfig)
    }

    /// Reloads the persisted configuration on the device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotReady`] unless Ready.
    pub fn load_persisted_config(&self) -> Result<CorrelationId> {
        self.issue_ready(CommandBody::LoadPersistedConfig)
    }

    /// Splits a segment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotReady`] unless Ready, or
    /// [`Error::InvalidArgument`] for an invalid split.
    pub fn split_segment(
        &self,
        effect: u8,
        direction: Direction,
        segment_id: SegmentId,
        new_segment_id: SegmentId,
    ) -> Result<CorrelationId> {
        self.issue_ready(CommandBody::SplitSegment {
            effect,
            direction,
            segment_id,
            new_segment_id,
        })
    }

    /// Merges a segment with its neighbour.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotReady`] unless Ready.
    pub fn merge_segments(&self, direction: Direction, segment_id: SegmentId) -> Result<CorrelationId> {
        self.issue_ready(CommandBody::MergeSegments {
            direction,
            segment_id,
        })
    }

    /// Moves segment boundaries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotReady`] unless Ready, or
    /// [`Error::InvalidArgument`] for an empty or unordered list.
    pub fn resize_segments(&self, boundaries: Vec<u32>) -> Result<CorrelationId> {
        self.issue_ready(CommandBody::ResizeSegments { boundaries })
    }

    /// Changes one segment's effect.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotReady`] unless Ready.
    pub fn set_segment_effect(&self, effect: u8, segment_id: SegmentId) -> Result<CorrelationId> {
        self.issue_ready(CommandBody::SetSegmentEffect { effect, segment_id })
    }

    /// Changes the global brightness.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotReady`] unless Ready.
    pub fn set_brightness(&self, brightness: u8) -> Result<CorrelationId> {
        self.issue_ready(CommandBody::SetBrightness { brightness })
    }

    /// Routes a request from the network channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionNotReady`] unless Ready.
    pub fn handle_request(&self, request: DeviceRequest) -> Result<CorrelationId> {
        self.require_ready()?;
        debug!(path = %self.inner.path.display(), ?request, "Channel request");
        match request.into_command_body() {
            Some(body) => self.issue_ready(body),
            None => self.query_state(),
        }
    }

    /// Queues an externally requested command.
    fn issue_ready(&self, body: CommandBody) -> Result<CorrelationId> {
        self.require_ready()?;
        self.issue(body, Vec::new())
    }

    /// Fails unless Ready.
    fn require_ready(&self) -> Result<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            SessionState::Closed => Err(Error::SessionClosed),
            state => Err(Error::session_not_ready(state)),
        }
    }
}

// ============================================================================
// SessionInner
// ============================================================================

impl SessionInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Registers a command and wakes the drain task.
    fn enqueue(&self, command: Command) -> Result<CorrelationId> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let id = self.queue.lock().enqueue(command)?;
        self.wake.notify_one();
        Ok(id)
    }

    /// Pops the next outbound frame.
    fn next_outbound(&self) -> Option<Request> {
        self.queue.lock().drain_next()
    }

    /// Writes queued frames in order until the session closes.
    async fn drain_loop(session: Weak<Self>, wake: Arc<Notify>) {
        loop {
            {
                let Some(inner) = session.upgrade() else {
                    break;
                };
                if inner.is_closed() {
                    break;
                }
                while let Some(request) = inner.next_outbound() {
                    inner.transmit(&request);
                }
            }
            wake.notified().await;
        }
        trace!("Drain loop stopped");
    }

    /// Writes one frame, logging failures.
    fn transmit(&self, request: &Request) {
        let line = match request.to_line() {
            Ok(line) => line,
            Err(e) => {
                error!(path = %self.path.display(), id = %request.id, error = %e, "Failed to encode command");
                return;
            }
        };

        debug!(path = %self.path.display(), id = %request.id, command = %request.body, "Writing command");
        if let Err(e) = self.connection.write_line(line) {
            warn!(path = %self.path.display(), id = %request.id, error = %e, "Failed to write command");
        }
    }

    /// Routes one inbound line.
    fn handle_line(&self, line: &str) {
        if self.is_closed() {
            trace!(path = %self.path.display(), %line, "Line after teardown ignored");
            return;
        }

        match Inbound::parse(line) {
            Ok(Inbound::Reply(reply)) => self.resolve(reply),
            Ok(Inbound::Diagnostic(diagnostic)) => diagnostic.log(&self.path),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Malformed line"),
        }
    }

    /// Matches a reply to its pending command.
    ///
    /// The queue lock is released before handlers run, so handlers may
    /// queue follow-up commands.
    fn resolve(&self, reply: Reply) {
        let taken = self.queue.lock().take(reply.id);
        let command = match taken {
            Ok(command) => command,
            Err(e) => {
                error!(path = %self.path.display(), id = %reply.id, error = %e, "Response for unknown command");
                if e.is_protocol_desync() {
                    self.teardown();
                }
                return;
            }
        };

        trace!(path = %self.path.display(), id = %reply.id, command = %command.body(), "Command resolved");
        if let Err(e) = command.complete(reply.payload) {
            warn!(path = %self.path.display(), id = %reply.id, error = %e, "Failed to decode response");
        }
    }

    /// Handles a decoded state reply.
    fn handle_state(&self, mut state: DeviceState) {
        if self.is_closed() {
            return;
        }

        let first = *self.state.borrow() == SessionState::AwaitingIdentity;
        if first && let Err(e) = self.reconcile(&mut state) {
            error!(path = %self.path.display(), error = %e, "Identity reconciliation failed");
            self.teardown();
            return;
        }

        let device_id = {
            let mut current = self.device_id.lock();
            match *current {
                Some(known) if known != state.device_id => {
                    warn!(path = %self.path.display(), %known, reported = %state.device_id, "Device reported a different identity");
                    known
                }
                Some(known) => known,
                None => {
                    *current = Some(state.device_id);
                    state.device_id
                }
            }
        };

        let entity = DeviceEntity::from_state(&state);
        *self.entity.lock() = Some(entity.clone());
        self.channel.publish(ChannelEvent::DeviceStateChanged(entity));

        let became_ready = self.state.send_if_modified(|current| {
            if *current == SessionState::AwaitingIdentity {
                *current = SessionState::Ready;
                true
            } else {
                false
            }
        });
        if became_ready {
            self.channel.attach(device_id);
            self.channel.publish(ChannelEvent::DeviceInitialized { device_id });
        }
    }

    /// Replaces a placeholder identity, device and segments together.
    ///
    /// Every rename command is queued under one lock, then `state` is
    /// rewritten. Nothing is queued if the plan cannot be queued whole.
    fn reconcile(&self, state: &mut DeviceState) -> Result<()> {
        let Some(plan) = Reconciliation::plan(state, self.ids.as_ref())? else {
            return Ok(());
        };

        warn!(
            path = %self.path.display(),
            device_id = %plan.device_id(),
            segments = plan.renames().len(),
            "Device had placeholder identity, reassigning"
        );

        let commands = plan.commands();
        {
            let mut queue = self.queue.lock();
            if queue.pending_count() + commands.len() > MAX_PENDING {
                return Err(Error::TooManyPending {
                    pending: queue.pending_count(),
                });
            }
            for body in commands {
                queue.enqueue(Command::new(body))?;
            }
        }
        self.wake.notify_one();

        plan.apply(state)
    }

    /// Logs a reminder while waiting for the identity. Never returns.
    async fn log_waiting(&self) {
        let interval = self.options.waiting_log_interval.max(Duration::from_millis(1));
        loop {
            tokio::time::sleep(interval).await;
            info!(path = %self.path.display(), "Waiting for initialization...");
        }
    }

    /// Transport close observer.
    fn transport_closed(&self, reason: &CloseReason) {
        info!(path = %self.path.display(), %reason, "Transport closed");
        self.channel.publish(ChannelEvent::PortDisconnected {
            path: self.path.clone(),
            message: reason.to_string(),
        });
        self.teardown();
    }

    fn teardown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let previous = self.state.send_replace(SessionState::Closed);

        // Drain stops before the transport closes
        if let Some(drain) = self.drain.lock().take() {
            drain.abort();
        }
        let purged = self.queue.lock().purge();

        self.connection.clear_line_handler();
        self.connection.shutdown();

        let device_id = *self.device_id.lock();
        if let Some(device_id) = device_id {
            self.channel.detach(device_id);
            if previous == SessionState::Ready {
                self.channel.publish(ChannelEvent::DevicesRemoved {
                    device_ids: vec![device_id],
                });
            }
        }

        info!(path = %self.path.display(), ?device_id, purged, %previous, "Session torn down");
    }
}

// ============================================================================
// Tests
// ============================================================================
