//! Type-safe identifiers for gateway entities.
//!
//! Newtype wrappers prevent mixing incompatible IDs at compile time.
//!
//! | Type | Width | Meaning |
//! |------|-------|---------|
//! | [`CorrelationId`] | `1..MAX_ID` | Outbound command tag |
//! | [`DeviceId`] | `u32` | Microcontroller identity (`0` = placeholder) |
//! | [`SegmentId`] | `u32` | Segment identity owned by a device |
//! | [`ClientId`] | `u32` | Persisted identity of this gateway |
//! | [`SlotNumber`] | `u16` | Virtual serial slot backing a Bluetooth link |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

/// Exclusive upper bound for correlation ids.
///
/// Ids wrap back to `1`; `0` marks unsolicited device messages.
pub const MAX_ID: u16 = 10_000;

/// Largest generated entity id. Ids stay within the signed 32-bit range.
const MAX_GENERATED_ID: u32 = i32::MAX as u32;

// ============================================================================
// CorrelationId
// ============================================================================

/// Tag linking an outbound command to its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u16);

impl CorrelationId {
    /// The first id handed out by a fresh queue.
    pub const FIRST: Self = Self(1);

    /// Creates a correlation id, rejecting `0` and values `>= MAX_ID`.
    #[inline]
    #[must_use]
    pub const fn new(value: u16) -> Option<Self> {
        if value == 0 || value >= MAX_ID {
            None
        } else {
            Some(Self(value))
        }
    }

    /// Creates a correlation id from a wire value.
    #[inline]
    #[must_use]
    pub fn from_wire(value: u64) -> Option<Self> {
        u16::try_from(value).ok().and_then(Self::new)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Returns the id following this one, wrapping to [`Self::FIRST`].
    #[inline]
    #[must_use]
    pub const fn successor(self) -> Self {
        if self.0 + 1 >= MAX_ID {
            Self::FIRST
        } else {
            Self(self.0 + 1)
        }
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// DeviceId / SegmentId / ClientId
// ============================================================================

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Sentinel meaning "not yet assigned".
            pub const PLACEHOLDER: Self = Self(0);

            /// Wraps a raw value.
            #[inline]
            #[must_use]
            pub const fn new(value: u32) -> Self {
                Self(value)
            }

            /// Returns the raw value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u32 {
                self.0
            }

            /// Returns `true` for the placeholder value `0`.
            #[inline]
            #[must_use]
            pub const fn is_placeholder(self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u32> for $name {
            fn from(value: u32) -> Self {
                Self(value)
            }
        }
    };
}

entity_id!(
    /// Identity of one microcontroller.
    DeviceId
);

entity_id!(
    /// Identity of one segment owned by a microcontroller.
    SegmentId
);

entity_id!(
    /// Identity of this gateway process, persisted across restarts.
    ClientId
);

// ============================================================================
// SlotNumber
// ============================================================================

/// Virtual serial slot number (`/dev/rfcommN`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotNumber(u16);

impl SlotNumber {
    /// Wraps a raw slot number.
    #[inline]
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for SlotNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Id Generation
// ============================================================================

/// Source of fresh entity identities.
///
/// Implementations must never return `0`.
pub trait IdSource: Send + Sync {
    /// Returns a fresh non-zero identity.
    fn generate(&self) -> u32;
}

/// Random identities drawn from UUID v4 entropy.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIds;

impl IdSource for RandomIds {
    fn generate(&self) -> u32 {
        generate_id()
    }
}

/// Generates a collision-resistant, non-zero entity id.
#[must_use]
pub fn generate_id() -> u32 {
    loop {
        let bits = Uuid::new_v4().as_u128();
        let id = (bits as u32) & MAX_GENERATED_ID;
        if id != 0 {
            return id;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
