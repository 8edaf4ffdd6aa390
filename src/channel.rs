//! Network channel collaborator.
//!
//! The gateway publishes device events to a coordinating service and
//! receives command requests from it. The relay itself lives elsewhere;
//! this module defines the messages and the [`Channel`] seam, plus an
//! in-process [`LocalChannel`].
//!
//! # Messages
//!
//! | Message | Direction | Purpose |
//! |---------|-----------|---------|
//! | `ChannelEvent` | Gateway → Service | Device lifecycle and state |
//! | `ChannelRequest` | Service → Gateway | Commands for one or all devices |

// ============================================================================
// Imports
// ============================================================================

use std::path::PathBuf;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::identifiers::{DeviceId, SegmentId};
use crate::protocol::{CommandBody, DeviceEntity, Direction};

// ============================================================================
// Constants
// ============================================================================

/// Default event buffer of [`LocalChannel`].
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

// ============================================================================
// ChannelEvent
// ============================================================================

/// Event published by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelEvent {
    /// A session became Ready.
    DeviceInitialized {
        /// The device's identity.
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
    },

    /// A state query completed; carries the reconciled entity.
    DeviceStateChanged(DeviceEntity),

    /// A transport closed.
    PortDisconnected {
        /// Device path.
        path: PathBuf,
        /// Close reason.
        message: String,
    },

    /// Ready devices went away.
    DevicesRemoved {
        /// Their identities.
        #[serde(rename = "deviceIds")]
        device_ids: Vec<DeviceId>,
    },
}

// ============================================================================
// DeviceRequest
// ============================================================================

/// Operation requested for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceRequest {
    /// Reboot the firmware.
    Reset,
    /// Persist the running configuration.
    WritePersistedConfig,
    /// Reload the persisted configuration.
    LoadPersistedConfig,
    /// Re-query and re-publish the device state.
    QueryState,

    /// Split a segment.
    #[serde(rename_all = "camelCase")]
    SplitSegment {
        /// Effect of the new segment.
        effect: u8,
        /// Side the new segment takes.
        direction: Direction,
        /// Segment being split.
        segment_id: SegmentId,
        /// Identity of the new segment.
        new_segment_id: SegmentId,
    },

    /// Merge a segment into its neighbour.
    #[serde(rename_all = "camelCase")]
    MergeSegments {
        /// Neighbour to merge with.
        direction: Direction,
        /// Segment being merged.
        segment_id: SegmentId,
    },

    /// Move segment boundaries.
    ResizeSegments {
        /// New boundaries, strictly increasing.
        boundaries: Vec<u32>,
    },

    /// Change one segment's effect.
    #[serde(rename_all = "camelCase")]
    SetSegmentEffect {
        /// New effect.
        effect: u8,
        /// Target segment.
        segment_id: SegmentId,
    },

    /// Change the global brightness.
    SetBrightness {
        /// New brightness.
        brightness: u8,
    },
}

impl DeviceRequest {
    /// Returns the command this request maps to.
    ///
    /// `None` for [`DeviceRequest::QueryState`], which needs the session's
    /// state handling.
    #[must_use]
    pub fn into_command_body(self) -> Option<CommandBody> {
        Some(match self {
            Self::Reset => CommandBody::ResetDevice,
            Self::WritePersistedConfig => CommandBody::WritePersistedConfig,
            Self::LoadPersistedConfig => CommandBody::LoadPersistedConfig,
            Self::QueryState => return None,
            Self::SplitSegment {
                effect,
                direction,
                segment_id,
                new_segment_id,
            } => CommandBody::SplitSegment {
                effect,
                direction,
                segment_id,
                new_segment_id,
            },
            Self::MergeSegments {
                direction,
                segment_id,
            } => CommandBody::MergeSegments {
                direction,
                segment_id,
            },
            Self::ResizeSegments { boundaries } => CommandBody::ResizeSegments { boundaries },
            Self::SetSegmentEffect { effect, segment_id } => {
                CommandBody::SetSegmentEffect { effect, segment_id }
            }
            Self::SetBrightness { brightness } => CommandBody::SetBrightness { brightness },
        })
    }
}

// ============================================================================
// ChannelRequest
// ============================================================================

/// Request received from the coordinating service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelRequest {
    /// Route `request` to the session holding `device_id`.
    Device {
        /// Target device.
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
        /// Requested operation.
        request: DeviceRequest,
    },

    /// Re-query every Ready device.
    ReinitState,
}

// ============================================================================
// Channel
// ============================================================================

/// Outbound side of the network channel.
///
/// Calls never block and never fail; delivery problems are the channel's
/// to log.
pub trait Channel: Send + Sync {
    /// Publishes an event.
    fn publish(&self, event: ChannelEvent);

    /// Opens the per-device route for `device_id`.
    fn attach(&self, device_id: DeviceId);

    /// Closes the per-device route for `device_id`.
    fn detach(&self, device_id: DeviceId);
}

// ============================================================================
// LocalChannel
// ============================================================================

/// In-process [`Channel`] backed by a broadcast queue.
#[derive(Debug)]
pub struct LocalChannel {
    events: broadcast::Sender<ChannelEvent>,
    attached: Mutex<FxHashSet<DeviceId>>,
}

impl Default for LocalChannel {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl LocalChannel {
    /// Creates a channel buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            events,
            attached: Mutex::new(FxHashSet::default()),
        }
    }

    /// Subscribes to events published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Returns `true` if the device route is open.
    #[inline]
    #[must_use]
    pub fn is_attached(&self, device_id: DeviceId) -> bool {
        self.attached.lock().contains(&device_id)
    }

    /// Returns the open device routes.
    #[must_use]
    pub fn attached(&self) -> Vec<DeviceId> {
        self.attached.lock().iter().copied().collect()
    }
}

impl Channel for LocalChannel {
    fn publish(&self, event: ChannelEvent) {
        trace!(?event, "Publishing event");
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn attach(&self, device_id: DeviceId) {
        if self.attached.lock().insert(device_id) {
            debug!(%device_id, "Device route attached");
        }
    }

    fn detach(&self, device_id: DeviceId) {
        if self.attached.lock().remove(&device_id) {
            debug!(%device_id, "Device route detached");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
