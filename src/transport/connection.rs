//! Line-framed byte stream and its event loop.
//!
//! This module wraps one opened transport (a serial port, or anything
//! implementing `AsyncRead + AsyncWrite`) and turns it into a stream of
//! newline-delimited lines.
//!
//! # Event Loop
//!
//! The connection spawns a tokio task that handles:
//!
//! - Incoming lines from the device, passed to the line handler
//! - Outgoing lines from the session's drain loop
//! - Close detection (EOF, read error, explicit shutdown), reported once to
//!   every close handler

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};

// ============================================================================
// Types
// ============================================================================

/// Any byte stream a connection can run over.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Inbound line callback.
///
/// Called once per received line, without the line terminator. Runs without
/// any connection lock held, so it may call back into the connection.
pub type LineHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Close callback. Called exactly once.
pub type CloseHandler = Box<dyn FnOnce(&CloseReason) + Send>;

// ============================================================================
// CloseReason
// ============================================================================

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The device side went away (EOF).
    Disconnected,
    /// Reading failed.
    Error(String),
    /// [`Connection::shutdown`] was called.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Error(message) => write!(f, "error: {message}"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

// ============================================================================
// ConnectionCommand
// ============================================================================

/// Internal commands for the event loop.
enum ConnectionCommand {
    /// Write one line.
    Write(String),
    /// Close the stream.
    Shutdown,
}

/// Close bookkeeping shared with the event loop.
#[derive(Default)]
struct CloseState {
    /// Set once the loop has exited.
    reason: Option<CloseReason>,
    /// Handlers waiting for the close.
    handlers: Vec<CloseHandler>,
}

// ============================================================================
// Connection
// ============================================================================

/// One opened transport with line framing.
///
/// # Thread Safety
///
/// `Connection` is `Send + Sync` and cheap to clone; clones share the same
/// event loop.
pub struct Connection {
    /// Device path the stream was opened from.
    path: Arc<PathBuf>,
    /// Channel for sending commands to the event loop.
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    /// Line handler (shared with event loop).
    line_handler: Arc<Mutex<Option<LineHandler>>>,
    /// Close state (shared with event loop).
    close: Arc<Mutex<CloseState>>,
    /// Fast-path closed flag.
    closed: Arc<AtomicBool>,
}

impl Clone for Connection {
    fn clone(&self) -> Self {
        Self {
            path: Arc::clone(&self.path),
            command_tx: self.command_tx.clone(),
            line_handler: Arc::clone(&self.line_handler),
            close: Arc::clone(&self.close),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates a new connection over an opened stream.
    ///
    /// Spawns the event loop task internally, so this must be called from
    /// within a tokio runtime.
    pub fn new<S: ByteStream>(path: impl Into<PathBuf>, stream: S) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let path = Arc::new(path.into());
        let line_handler: Arc<Mutex<Option<LineHandler>>> = Arc::new(Mutex::new(None));
        let close = Arc::new(Mutex::new(CloseState::default()));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(Self::run_event_loop(
            Arc::clone(&path),
            stream,
            command_rx,
            Arc::clone(&line_handler),
            Arc::clone(&close),
            Arc::clone(&closed),
        ));

        Self {
            path,
            command_tx,
            line_handler,
            close,
            closed,
        }
    }

    /// Returns the device path.
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` once the event loop has exited.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sets the inbound line handler.
    pub fn set_line_handler(&self, handler: LineHandler) {
        *self.line_handler.lock() = Some(handler);
    }

    /// Clears the inbound line handler.
    ///
    /// Lines received afterwards are dropped.
    pub fn clear_line_handler(&self) {
        *self.line_handler.lock() = None;
    }

    /// Registers a close handler.
    ///
    /// If the connection is already closed the handler runs immediately.
    pub fn on_close(&self, handler: CloseHandler) {
        let reason = {
            let mut close = self.close.lock();
            match close.reason.clone() {
                Some(reason) => reason,
                None => {
                    close.handlers.push(handler);
                    return;
                }
            }
        };
        handler(&reason);
    }

    /// Queues one line for writing.
    ///
    /// A trailing newline is added when missing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the event loop has exited.
    pub fn write_line(&self, line: impl Into<String>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let mut line = line.into();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.command_tx
            .send(ConnectionCommand::Write(line))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Closes the stream.
    ///
    /// Lines queued before this call are still written. Safe to call more
    /// than once.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(ConnectionCommand::Shutdown);
    }

    /// Event loop that handles stream I/O.
    async fn run_event_loop<S: ByteStream>(
        path: Arc<PathBuf>,
        stream: S,
        mut command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
        line_handler: Arc<Mutex<Option<LineHandler>>>,
        close: Arc<Mutex<CloseState>>,
        closed: Arc<AtomicBool>,
    ) {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        let reason = loop {
            tokio::select! {
                // Incoming lines from the device
                read = reader.read_until(b'\n', &mut buf) => {
                    match read {
                        Ok(0) => {
                            debug!(path = %path.display(), "Stream ended");
                            break CloseReason::Disconnected;
                        }
                        Ok(_) => {
                            let line = String::from_utf8_lossy(&buf);
                            let line = line.trim_end_matches(['\r', '\n']);
                            if !line.is_empty() {
                                trace!(path = %path.display(), %line, "Line received");
                                let handler = line_handler.lock().clone();
                                if let Some(handler) = handler {
                                    handler(line);
                                }
                            }
                            buf.clear();
                        }
                        Err(e) => {
                            error!(path = %path.display(), error = %e, "Read failed");
                            break CloseReason::Error(e.to_string());
                        }
                    }
                }

                // Lines from the drain loop
                command = command_rx.recv() => {
                    match command {
                        Some(ConnectionCommand::Write(line)) => {
                            Self::write(&path, &mut writer, &line).await;
                        }

                        Some(ConnectionCommand::Shutdown) => {
                            debug!(path = %path.display(), "Shutdown command received");
                            let _ = writer.shutdown().await;
                            break CloseReason::Shutdown;
                        }

                        None => {
                            debug!(path = %path.display(), "Command channel closed");
                            break CloseReason::Shutdown;
                        }
                    }
                }
            }
        };

        closed.store(true, Ordering::SeqCst);
        *line_handler.lock() = None;

        let handlers = {
            let mut close = close.lock();
            close.reason = Some(reason.clone());
            std::mem::take(&mut close.handlers)
        };
        for handler in handlers {
            handler(&reason);
        }

        debug!(path = %path.display(), %reason, "Event loop terminated");
    }

    /// Writes one line, logging instead of failing.
    async fn write<W: AsyncWrite + Unpin>(path: &Path, writer: &mut W, line: &str) {
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => trace!(path = %path.display(), line = %line.trim_end(), "Line written"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to write line"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};
    use tokio::sync::{mpsc, oneshot};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_lines_are_delivered_without_terminator() {
        let (local, mut remote) = duplex(1024);
        let connection = Connection::new("/dev/teensy0", local);

        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.set_line_handler(Arc::new(move |line| {
            let _ = tx.send(line.to_string());
        }));

        remote.write_all(b"[1,1]\r\n\n[0,132,\"hi\"]\n").await.expect("write");

        let first = timeout(WAIT, rx.recv()).await.expect("timely").expect("line");
        let second = timeout(WAIT, rx.recv()).await.expect("timely").expect("line");
        assert_eq!(first, "[1,1]");
        assert_eq!(second, "[0,132,\"hi\"]");
    }

    #[tokio::test]
    async fn test_write_line_appends_newline() {
        let (local, remote) = duplex(1024);
        let connection = Connection::new("/dev/teensy0", local);
        let mut remote = BufReader::new(remote);

        connection.write_line("[[1,1],[1]]").expect("write");
        connection.write_line("[[2,1],[11]]\n").expect("write");

        let mut line = String::new();
        remote.read_line(&mut line).await.expect("read");
        assert_eq!(line, "[[1,1],[1]]\n");
        line.clear();
        remote.read_line(&mut line).await.expect("read");
        assert_eq!(line, "[[2,1],[11]]\n");
    }

    #[tokio::test]
    async fn test_remote_close_runs_close_handlers_once() {
        let (local, remote) = duplex(64);
        let connection = Connection::new("/dev/rfcomm3", local);

        let (tx, rx) = oneshot::channel();
        connection.on_close(Box::new(move |reason| {
            let _ = tx.send(reason.clone());
        }));

        drop(remote);

        let reason = timeout(WAIT, rx).await.expect("timely").expect("reason");
        assert_eq!(reason, CloseReason::Disconnected);
        assert!(connection.is_closed());
        assert!(matches!(
            connection.write_line("late"),
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_on_close_after_close_runs_immediately() {
        let (local, _remote) = duplex(64);
        let connection = Connection::new("/dev/teensy0", local);

        let (tx, rx) = oneshot::channel();
        connection.on_close(Box::new(move |_| {
            let _ = tx.send(());
        }));
        connection.shutdown();
        timeout(WAIT, rx).await.expect("timely").expect("closed");

        let (late_tx, late_rx) = oneshot::channel();
        connection.on_close(Box::new(move |reason| {
            let _ = late_tx.send(reason.clone());
        }));
        assert_eq!(late_rx.await.expect("ran"), CloseReason::Shutdown);

        // Idempotent
        connection.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_close() {
        let (local, mut remote) = duplex(1024);
        let connection = Connection::new("/dev/teensy0", local);

        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.set_line_handler(Arc::new(move |line| {
            let _ = tx.send(line.to_string());
        }));

        remote.write_all(b"\xff\xfe\n[1]\n").await.expect("write");

        let _garbled = timeout(WAIT, rx.recv()).await.expect("timely").expect("line");
        let next = timeout(WAIT, rx.recv()).await.expect("timely").expect("line");
        assert_eq!(next, "[1]");
        assert!(!connection.is_closed());
    }
}
