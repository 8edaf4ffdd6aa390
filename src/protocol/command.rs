//! Command vocabulary understood by the microcontroller firmware.
//!
//! Each command is written as a positional array whose first element is
//! the vocabulary tag:
//!
//! | Tag | Command | Arguments |
//! |-----|---------|-----------|
//! | 1 | `GetState` | none |
//! | 2 | `ResizeSegments` | boundary list |
//! | 3 | `SetSegmentEffect` | effect, segment id |
//! | 4 | `SplitSegment` | effect, direction, segment id, new segment id |
//! | 5 | `MergeSegments` | direction, segment id |
//! | 6 | `SetBrightness` | brightness |
//! | 7 | `SetDeviceId` | device id |
//! | 8 | `SetSegmentId` | old id, new id |
//! | 9 | `WritePersistedConfig` | none |
//! | 10 | `LoadPersistedConfig` | none |
//! | 11 | `ResetDevice` | none |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::identifiers::{DeviceId, SegmentId};

// ============================================================================
// CommandTag
// ============================================================================

/// Wire-level vocabulary tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandTag {
    /// Report full device state.
    GetState = 1,
    /// Resize all segments from a boundary list.
    ResizeSegments = 2,
    /// Change the effect of one segment.
    SetSegmentEffect = 3,
    /// Split one segment in two.
    SplitSegment = 4,
    /// Merge a segment into its neighbour.
    MergeSegments = 5,
    /// Set global brightness.
    SetBrightness = 6,
    /// Persist a device identity.
    SetDeviceId = 7,
    /// Rename one segment.
    SetSegmentId = 8,
    /// Write current state to persistent storage.
    WritePersistedConfig = 9,
    /// Reload state from persistent storage.
    LoadPersistedConfig = 10,
    /// Reboot the device.
    ResetDevice = 11,
}

impl CommandTag {
    /// Returns the wire value.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Returns the command name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::GetState => "GET_STATE",
            Self::ResizeSegments => "RESIZE_SEGMENTS_FROM_BOUNDARIES",
            Self::SetSegmentEffect => "SET_SEGMENT_EFFECT",
            Self::SplitSegment => "SPLIT_SEGMENT",
            Self::MergeSegments => "MERGE_SEGMENTS",
            Self::SetBrightness => "SET_MICRO_BRIGHTNESS",
            Self::SetDeviceId => "SET_MICRO_ID",
            Self::SetSegmentId => "SET_SEGMENT_ID",
            Self::WritePersistedConfig => "WRITE_EEPROM",
            Self::LoadPersistedConfig => "LOAD_EEPROM",
            Self::ResetDevice => "RESET_MICRO",
        }
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Direction
// ============================================================================

/// Side of a segment a split or merge applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Towards the start of the strip.
    Left,
    /// Towards the end of the strip.
    Right,
}

impl Direction {
    /// Returns the wire value.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Left => 0,
            Self::Right => 1,
        }
    }
}

impl TryFrom<u8> for Direction {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Left),
            1 => Ok(Self::Right),
            other => Err(Error::invalid_argument(format!("unknown direction {other}"))),
        }
    }
}

impl Serialize for Direction {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for Direction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = u8::deserialize(deserializer)?;
        Self::try_from(raw).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// CommandBody
// ============================================================================

/// A vocabulary tag together with its positional arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBody {
    /// Report full device state.
    GetState,
    /// Resize all segments from a boundary list.
    ResizeSegments {
        /// Strictly increasing LED offsets where segments start.
        boundaries: Vec<u32>,
    },
    /// Change the effect of one segment.
    SetSegmentEffect {
        /// Effect number.
        effect: u8,
        /// Target segment.
        segment_id: SegmentId,
    },
    /// Split one segment in two.
    SplitSegment {
        /// Effect for the new segment.
        effect: u8,
        /// Side the new segment is created on.
        direction: Direction,
        /// Segment being split.
        segment_id: SegmentId,
        /// Identity of the new segment.
        new_segment_id: SegmentId,
    },
    /// Merge a segment into its neighbour.
    MergeSegments {
        /// Neighbour to merge into.
        direction: Direction,
        /// Segment being merged.
        segment_id: SegmentId,
    },
    /// Set global brightness.
    SetBrightness {
        /// Brightness value.
        brightness: u8,
    },
    /// Persist a device identity.
    SetDeviceId {
        /// New identity.
        device_id: DeviceId,
    },
    /// Rename one segment.
    SetSegmentId {
        /// Current identity.
        old_id: SegmentId,
        /// Replacement identity.
        new_id: SegmentId,
    },
    /// Write current state to persistent storage.
    WritePersistedConfig,
    /// Reload state from persistent storage.
    LoadPersistedConfig,
    /// Reboot the device.
    ResetDevice,
}

impl CommandBody {
    /// Returns the vocabulary tag.
    #[must_use]
    pub const fn tag(&self) -> CommandTag {
        match self {
            Self::GetState => CommandTag::GetState,
            Self::ResizeSegments { .. } => CommandTag::ResizeSegments,
            Self::SetSegmentEffect { .. } => CommandTag::SetSegmentEffect,
            Self::SplitSegment { .. } => CommandTag::SplitSegment,
            Self::MergeSegments { .. } => CommandTag::MergeSegments,
            Self::SetBrightness { .. } => CommandTag::SetBrightness,
            Self::SetDeviceId { .. } => CommandTag::SetDeviceId,
            Self::SetSegmentId { .. } => CommandTag::SetSegmentId,
            Self::WritePersistedConfig => CommandTag::WritePersistedConfig,
            Self::LoadPersistedConfig => CommandTag::LoadPersistedConfig,
            Self::ResetDevice => CommandTag::ResetDevice,
        }
    }

    /// Checks the arguments before the command is queued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the payload cannot be
    /// executed by the firmware.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::ResizeSegments { boundaries } => {
                if boundaries.is_empty() {
                    return Err(Error::invalid_argument("boundary list is empty"));
                }
                if boundaries.windows(2).any(|pair| pair[0] >= pair[1]) {
                    return Err(Error::invalid_argument(
                        "boundaries must be strictly increasing",
                    ));
                }
            }
            Self::SplitSegment {
                segment_id,
                new_segment_id,
                ..
            } => {
                if new_segment_id.is_placeholder() || new_segment_id == segment_id {
                    return Err(Error::invalid_argument(format!(
                        "cannot split segment {segment_id} into {new_segment_id}"
                    )));
                }
            }
            Self::SetDeviceId { device_id } if device_id.is_placeholder() => {
                return Err(Error::invalid_argument("device id must be non-zero"));
            }
            Self::SetSegmentId { old_id, new_id } => {
                if new_id.is_placeholder() || old_id == new_id {
                    return Err(Error::invalid_argument(format!(
                        "cannot rename segment {old_id} to {new_id}"
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Returns the positional wire array `[tag, ...args]`.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        let tag = self.tag().as_u8();
        match self {
            Self::GetState
            | Self::WritePersistedConfig
            | Self::LoadPersistedConfig
            | Self::ResetDevice => json!([tag]),
            Self::ResizeSegments { boundaries } => json!([tag, boundaries]),
            Self::SetSegmentEffect { effect, segment_id } => json!([tag, effect, segment_id]),
            Self::SplitSegment {
                effect,
                direction,
                segment_id,
                new_segment_id,
            } => json!([tag, effect, direction, segment_id, new_segment_id]),
            Self::MergeSegments {
                direction,
                segment_id,
            } => json!([tag, direction, segment_id]),
            Self::SetBrightness { brightness } => json!([tag, brightness]),
            Self::SetDeviceId { device_id } => json!([tag, device_id]),
            Self::SetSegmentId { old_id, new_id } => json!([tag, old_id, new_id]),
        }
    }
}

impl fmt::Display for CommandBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.tag(), f)
    }
}

// ============================================================================
// Tests
// ============================================================================
