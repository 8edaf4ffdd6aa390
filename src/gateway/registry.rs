//! Ready sessions by device identity.

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::identifiers::DeviceId;
use crate::session::DeviceSession;

// ============================================================================
// DeviceRegistry
// ============================================================================

/// Ready sessions keyed by device identity.
///
/// Owned by the [`Gateway`](super::Gateway); an entry exists from the
/// moment a session becomes Ready until that session closes.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    sessions: FxHashMap<DeviceId, DeviceSession>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a Ready session.
    ///
    /// Returns the session previously registered under the same identity.
    pub fn insert(&mut self, device_id: DeviceId, session: DeviceSession) -> Option<DeviceSession> {
        let previous = self.sessions.insert(device_id, session);
        if let Some(previous) = &previous {
            warn!(%device_id, path = %previous.path().display(), "Device identity registered twice, replacing");
        }
        previous
    }

    /// Removes `session` if it is the one registered for `device_id`.
    ///
    /// A newer session for the same device is left alone.
    pub fn remove(&mut self, device_id: DeviceId, session: &DeviceSession) -> bool {
        let owned = self
            .sessions
            .get(&device_id)
            .is_some_and(|current| current.same_session(session));
        if owned {
            self.sessions.remove(&device_id);
        }
        owned
    }

    /// Returns the session for `device_id`.
    #[must_use]
    pub fn get(&self, device_id: DeviceId) -> Option<DeviceSession> {
        self.sessions.get(&device_id).cloned()
    }

    /// Returns every registered identity.
    #[must_use]
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.sessions.keys().copied().collect()
    }

    /// Returns every registered session.
    #[must_use]
    pub fn sessions(&self) -> Vec<DeviceSession> {
        self.sessions.values().cloned().collect()
    }

    /// Removes and returns every session.
    pub fn drain(&mut self) -> Vec<DeviceSession> {
        self.sessions.drain().map(|(_, session)| session).collect()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
