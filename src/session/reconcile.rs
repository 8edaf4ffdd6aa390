//! Identity reconciliation for devices reporting the placeholder identity.
//!
//! A device that has never been assigned an identity reports device id `0`.
//! [`Reconciliation::plan`] mints a fresh device id and a fresh id for every
//! segment; the session enqueues [`Reconciliation::commands`] under a single
//! queue lock and rewrites its state with [`Reconciliation::apply`], so the
//! device and its segments are renamed together or not at all.

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashSet;

use crate::error::{Error, Result};
use crate::identifiers::{DeviceId, IdSource, SegmentId};
use crate::protocol::{CommandBody, DeviceState};

// ============================================================================
// Constants
// ============================================================================

/// Draws allowed per fresh id before giving up on the id source.
const MAX_DRAWS: usize = 64;

// ============================================================================
// Reconciliation
// ============================================================================

/// Planned renaming of a placeholder device and its segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Fresh device identity.
    device_id: DeviceId,
    /// `(old, new)` segment identities in strip order.
    segments: Vec<(SegmentId, SegmentId)>,
}

impl Reconciliation {
    /// Plans the renaming for a decoded state.
    ///
    /// Returns `None` when the device already has an identity. Fresh ids
    /// are non-zero, pairwise distinct and distinct from every id in
    /// `state`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if `ids` keeps producing collisions.
    pub fn plan(state: &DeviceState, ids: &dyn IdSource) -> Result<Option<Self>> {
        if !state.device_id.is_placeholder() {
            return Ok(None);
        }

        let mut taken: FxHashSet<u32> = state.segments.iter().map(|s| s.segment_id.get()).collect();
        taken.insert(0);

        let device_id = DeviceId::new(draw(ids, &mut taken)?);
        let segments = state
            .segments
            .iter()
            .map(|segment| Ok((segment.segment_id, SegmentId::new(draw(ids, &mut taken)?))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(Self {
            device_id,
            segments,
        }))
    }

    /// Returns the fresh device identity.
    #[inline]
    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Returns the `(old, new)` segment identities in strip order.
    #[inline]
    #[must_use]
    pub fn renames(&self) -> &[(SegmentId, SegmentId)] {
        &self.segments
    }

    /// Returns the commands persisting the new identities on the device.
    ///
    /// Device identity first, then one rename per segment in strip order.
    #[must_use]
    pub fn commands(&self) -> Vec<CommandBody> {
        std::iter::once(CommandBody::SetDeviceId {
            device_id: self.device_id,
        })
        .chain(
            self.segments
                .iter()
                .map(|&(old_id, new_id)| CommandBody::SetSegmentId { old_id, new_id }),
        )
        .collect()
    }

    /// Rewrites `state` with the new identities.
    ///
    /// Segments are renamed by position, so duplicate placeholder segment
    /// ids are handled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if `state` is not the state this plan was
    /// made for; `state` is left untouched then.
    pub fn apply(&self, state: &mut DeviceState) -> Result<()> {
        let matches = state.device_id.is_placeholder()
            && state.segments.len() == self.segments.len()
            && state
                .segments
                .iter()
                .zip(&self.segments)
                .all(|(segment, &(old_id, _))| segment.segment_id == old_id);
        if !matches {
            return Err(Error::protocol("reconciliation does not match device state"));
        }

        state.device_id = self.device_id;
        for (segment, &(_, new_id)) in state.segments.iter_mut().zip(&self.segments) {
            segment.segment_id = new_id;
        }
        Ok(())
    }
}

/// Draws one id not yet taken.
fn draw(ids: &dyn IdSource, taken: &mut FxHashSet<u32>) -> Result<u32> {
    for _ in 0..MAX_DRAWS {
        let id = ids.generate();
        if taken.insert(id) {
            return Ok(id);
        }
    }
    Err(Error::protocol("identity source keeps colliding"))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::identifiers::RandomIds;
    use crate::protocol::SegmentState;

    /// Counts up from a start value.
    struct Sequential(AtomicU32);

    impl IdSource for Sequential {
        fn generate(&self) -> u32 {
            self.0.fetch_add(1, Ordering::SeqCst)
        }
    }

    struct Constant(u32);

    impl IdSource for Constant {
        fn generate(&self) -> u32 {
            self.0
        }
    }

    fn segment(offset: u32, segment_id: u32) -> SegmentState {
        SegmentState {
            offset,
            num_leds: 50,
            effect: 1,
            segment_id: SegmentId::new(segment_id),
        }
    }

    fn placeholder_state(segment_ids: &[u32]) -> DeviceState {
        DeviceState {
            device_id: DeviceId::PLACEHOLDER,
            brightness: 50,
            total_leds: 50 * segment_ids.len() as u32,
            segments: segment_ids
                .iter()
                .enumerate()
                .map(|(i, &id)| segment(50 * i as u32, id))
                .collect(),
        }
    }

    #[test]
    fn test_identified_device_needs_nothing() {
        let mut state = placeholder_state(&[3, 9]);
        state.device_id = DeviceId::new(7);
        assert_eq!(Reconciliation::plan(&state, &RandomIds).expect("plan"), None);
    }

    #[test]
    fn test_plan_renames_device_and_every_segment() {
        let state = placeholder_state(&[3, 9]);
        let ids = Sequential(AtomicU32::new(100));

        let plan = Reconciliation::plan(&state, &ids)
            .expect("plan")
            .expect("placeholder");

        assert_eq!(plan.device_id(), DeviceId::new(100));
        assert_eq!(
            plan.renames(),
            &[
                (SegmentId::new(3), SegmentId::new(101)),
                (SegmentId::new(9), SegmentId::new(102)),
            ]
        );
        assert_eq!(
            plan.commands(),
            vec![
                CommandBody::SetDeviceId {
                    device_id: DeviceId::new(100)
                },
                CommandBody::SetSegmentId {
                    old_id: SegmentId::new(3),
                    new_id: SegmentId::new(101)
                },
                CommandBody::SetSegmentId {
                    old_id: SegmentId::new(9),
                    new_id: SegmentId::new(102)
                },
            ]
        );
    }

    #[test]
    fn test_apply_preserves_order_and_second_pass_is_noop() {
        let mut state = placeholder_state(&[3, 9, 4]);
        let plan = Reconciliation::plan(&state, &RandomIds)
            .expect("plan")
            .expect("placeholder");

        plan.apply(&mut state).expect("apply");

        assert_eq!(state.device_id, plan.device_id());
        assert!(!state.device_id.is_placeholder());
        let new_ids: Vec<SegmentId> = state.segments.iter().map(|s| s.segment_id).collect();
        let planned: Vec<SegmentId> = plan.renames().iter().map(|&(_, new)| new).collect();
        assert_eq!(new_ids, planned);
        assert_eq!(
            state.segments.iter().map(|s| s.offset).collect::<Vec<_>>(),
            vec![0, 50, 100]
        );

        let unique: FxHashSet<SegmentId> = new_ids.iter().copied().collect();
        assert_eq!(unique.len(), 3);
        assert!(!unique.contains(&SegmentId::PLACEHOLDER));

        assert_eq!(Reconciliation::plan(&state, &RandomIds).expect("plan"), None);
    }

    #[test]
    fn test_duplicate_placeholder_segments_get_distinct_ids() {
        let mut state = placeholder_state(&[0, 0]);
        let plan = Reconciliation::plan(&state, &Sequential(AtomicU32::new(1)))
            .expect("plan")
            .expect("placeholder");
        plan.apply(&mut state).expect("apply");

        assert_eq!(state.device_id, DeviceId::new(1));
        assert_eq!(state.segments[0].segment_id, SegmentId::new(2));
        assert_eq!(state.segments[1].segment_id, SegmentId::new(3));
    }

    #[test]
    fn test_fresh_ids_avoid_existing_segment_ids() {
        let state = placeholder_state(&[5, 6]);
        let plan = Reconciliation::plan(&state, &Sequential(AtomicU32::new(5)))
            .expect("plan")
            .expect("placeholder");

        assert_eq!(plan.device_id(), DeviceId::new(7));
        assert_eq!(plan.renames()[0].1, SegmentId::new(8));
        assert_eq!(plan.renames()[1].1, SegmentId::new(9));
    }

    #[test]
    fn test_apply_to_other_state_is_rejected() {
        let state = placeholder_state(&[3, 9]);
        let plan = Reconciliation::plan(&state, &RandomIds)
            .expect("plan")
            .expect("placeholder");

        let mut other = placeholder_state(&[3]);
        assert!(plan.apply(&mut other).is_err());
        assert_eq!(other, placeholder_state(&[3]));
    }

    #[test]
    fn test_colliding_source_is_error() {
        let state = placeholder_state(&[3, 9]);
        assert!(Reconciliation::plan(&state, &Constant(42)).is_err());
    }
}
