//! Device state replies and the normalised device entity.
//!
//! # State payload
//!
//! ```json
//! [deviceId, brightness, totalLeds, [[offset, numLeds, effect, segmentId], ...]]
//! ```
//!
//! The payload may arrive wrapped once (`[[deviceId, ...]]`) when the
//! firmware omits the response kind.

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::{DeviceId, SegmentId};

// ============================================================================
// Types
// ============================================================================

/// Raw segment tuple as sent by the firmware.
type SegmentTuple = (u32, u32, u8, u32);

/// Raw state tuple as sent by the firmware.
type StateTuple = (u32, u8, u32, Vec<SegmentTuple>);

// ============================================================================
// DeviceState
// ============================================================================

/// One segment as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentState {
    /// First LED of the segment.
    pub offset: u32,
    /// LED count.
    pub num_leds: u32,
    /// Running effect.
    pub effect: u8,
    /// Segment identity.
    pub segment_id: SegmentId,
}

/// Full device state as reported by a `GetState` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    /// Self-reported identity (`0` = placeholder).
    pub device_id: DeviceId,
    /// Global brightness.
    pub brightness: u8,
    /// LEDs attached to the device.
    pub total_leds: u32,
    /// Segments in strip order.
    pub segments: Vec<SegmentState>,
}

impl DeviceState {
    /// Decodes a reply payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the payload does not have the state
    /// layout.
    pub fn from_payload(mut payload: Vec<Value>) -> Result<Self> {
        if payload.len() == 1 && matches!(payload[0], Value::Array(_)) {
            if let Some(Value::Array(inner)) = payload.pop() {
                payload = inner;
            }
        }

        let (device_id, brightness, total_leds, segments): StateTuple =
            serde_json::from_value(Value::Array(payload))
                .map_err(|e| Error::protocol(format!("invalid state reply: {e}")))?;

        Ok(Self {
            device_id: DeviceId::new(device_id),
            brightness,
            total_leds,
            segments: segments
                .into_iter()
                .map(|(offset, num_leds, effect, segment_id)| SegmentState {
                    offset,
                    num_leds,
                    effect,
                    segment_id: SegmentId::new(segment_id),
                })
                .collect(),
        })
    }
}

// ============================================================================
// DeviceEntity
// ============================================================================

/// Device row of the entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    /// Device identity.
    pub device_id: DeviceId,
    /// Global brightness.
    pub brightness: u8,
    /// LEDs attached to the device.
    pub total_leds: u32,
    /// Owned segments in strip order.
    pub segment_ids: Vec<SegmentId>,
}

/// Segment row of the entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRecord {
    /// Segment identity.
    pub segment_id: SegmentId,
    /// Owning device.
    pub device_id: DeviceId,
    /// First LED of the segment.
    pub offset: u32,
    /// LED count.
    pub num_leds: u32,
    /// Running effect.
    pub effect: u8,
}

/// Segments keyed by id, with their strip order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentTable {
    /// Segment rows by id.
    pub by_id: FxHashMap<SegmentId, SegmentRecord>,
    /// Segment ids in strip order.
    pub all_ids: Vec<SegmentId>,
}

/// Normalised device + segment entity published to the network channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEntity {
    /// The device row.
    pub device: DeviceRecord,
    /// Its segments.
    pub segments: SegmentTable,
}

impl DeviceEntity {
    /// Builds the entity for a decoded state.
    #[must_use]
    pub fn from_state(state: &DeviceState) -> Self {
        let device_id = state.device_id;
        let all_ids: Vec<SegmentId> = state.segments.iter().map(|s| s.segment_id).collect();
        let by_id = state
            .segments
            .iter()
            .map(|s| {
                (
                    s.segment_id,
                    SegmentRecord {
                        segment_id: s.segment_id,
                        device_id,
                        offset: s.offset,
                        num_leds: s.num_leds,
                        effect: s.effect,
                    },
                )
            })
            .collect();

        Self {
            device: DeviceRecord {
                device_id,
                brightness: state.brightness,
                total_leds: state.total_leds,
                segment_ids: all_ids.clone(),
            },
            segments: SegmentTable { by_id, all_ids },
        }
    }

    /// Returns the device identity.
    #[inline]
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.device.device_id
    }
}

// ============================================================================
// Tests
// ============================================================================
