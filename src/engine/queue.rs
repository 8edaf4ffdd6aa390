//! Correlation id allocation, FIFO outbound queue and pending table.
//!
//! # Invariants
//!
//! - Every id in the pending table belongs to exactly one command that was
//!   enqueued and not yet answered.
//! - At most `MAX_ID - 1` commands are outstanding, so an allocated id is
//!   never one that is still pending.
//! - The outbound queue is drained strictly in enqueue order.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::{CorrelationId, MAX_ID};
use crate::protocol::Request;

use super::command::{Command, Response};

// ============================================================================
// Constants
// ============================================================================

/// Maximum simultaneously outstanding commands per session.
pub const MAX_PENDING: usize = MAX_ID as usize - 1;

// ============================================================================
// CommandQueue
// ============================================================================

/// Per-session command correlation engine.
///
/// Not synchronised on its own: the owning session guards it with a mutex
/// and never holds the guard across an `.await`.
#[derive(Debug)]
pub struct CommandQueue {
    /// Frames awaiting transmission, oldest first.
    outbound: VecDeque<Request>,
    /// In-flight commands by correlation id.
    pending: FxHashMap<CorrelationId, Command>,
    /// Next id handed out by [`Self::next_id`].
    next_id: CorrelationId,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    /// Creates an empty queue whose first id is `1`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            outbound: VecDeque::new(),
            pending: FxHashMap::default(),
            next_id: CorrelationId::FIRST,
        }
    }

    /// Returns the current counter value and advances it, wrapping to `1`.
    ///
    /// Use it to pre-allocate an id for a command built out of the normal
    /// queue order.
    pub fn next_id(&mut self) -> CorrelationId {
        let id = self.next_id;
        self.next_id = id.successor();
        id
    }

    /// Registers a command and queues it for transmission.
    ///
    /// Assigns an id unless the command carries a pre-allocated one.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the payload is malformed
    /// - [`Error::TooManyPending`] if every usable id is outstanding
    /// - [`Error::DuplicateCommand`] if the pre-allocated id is pending
    pub fn enqueue(&mut self, mut command: Command) -> Result<CorrelationId> {
        command.body().validate()?;

        if self.pending.len() >= MAX_PENDING {
            return Err(Error::TooManyPending {
                pending: self.pending.len(),
            });
        }

        let id = match command.id() {
            Some(id) if self.pending.contains_key(&id) => {
                return Err(Error::DuplicateCommand { id });
            }
            Some(id) => id,
            None => {
                let id = self.allocate_id();
                command.assign_id(id);
                id
            }
        };

        let request = Request::new(id, command.kind(), command.body().clone());
        trace!(%id, command = %command.body(), "Command queued");

        self.outbound.push_back(request);
        self.pending.insert(id, command);
        Ok(id)
    }

    /// Pops the oldest frame awaiting transmission.
    ///
    /// The frame is the queued command's wire form; the command itself stays
    /// in the pending table until its reply is resolved.
    pub fn drain_next(&mut self) -> Option<Request> {
        self.outbound.pop_front()
    }

    /// Removes a pending command, freeing its id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCommand`] if the id is not pending.
    pub fn take(&mut self, id: CorrelationId) -> Result<Command> {
        self.pending
            .remove(&id)
            .ok_or_else(|| Error::missing_command(id))
    }

    /// Matches a reply to its command and runs its completion handlers.
    ///
    /// The id is released before the handlers run, so handlers may enqueue
    /// follow-up commands.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingCommand`] if the id is not pending
    /// - the transform's error if the payload cannot be decoded
    pub fn resolve(&mut self, id: CorrelationId, payload: Vec<Value>) -> Result<Response> {
        self.take(id)?.complete(payload)
    }

    /// Drops every queued frame and pending command.
    ///
    /// Returns the number of pending commands discarded.
    pub fn purge(&mut self) -> usize {
        let count = self.pending.len();
        self.outbound.clear();
        self.pending.clear();
        if count > 0 {
            debug!(count, "Purged pending commands");
        }
        count
    }

    /// Returns `true` if the id is outstanding.
    #[inline]
    #[must_use]
    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Returns the number of outstanding commands.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns the number of frames awaiting transmission.
    #[inline]
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.outbound.len()
    }

    /// Returns the next id not currently outstanding.
    fn allocate_id(&mut self) -> CorrelationId {
        loop {
            let id = self.next_id();
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;
    use rustc_hash::FxHashSet;
    use serde_json::json;

    use crate::engine::decode_state;
    use crate::identifiers::DeviceId;
    use crate::protocol::{CommandBody, ResponseKind};

    fn id(n: u16) -> CorrelationId {
        CorrelationId::new(n).expect("valid id")
    }

    #[test]
    fn test_first_id_is_one() {
        let mut queue = CommandQueue::new();
        let assigned = queue
            .enqueue(Command::new(CommandBody::GetState))
            .expect("enqueue");
        assert_eq!(assigned, id(1));
        assert!(queue.is_pending(assigned));
    }

    #[test]
    fn test_next_id_wraps_to_one() {
        let mut queue = CommandQueue::new();
        for expected in 1..MAX_ID {
            assert_eq!(queue.next_id().get(), expected);
        }
        assert_eq!(queue.next_id(), id(1));
    }

    #[test]
    fn test_fifo_drain() {
        let mut queue = CommandQueue::new();
        let bodies = [
            CommandBody::SetBrightness { brightness: 10 },
            CommandBody::SetBrightness { brightness: 10 },
            CommandBody::ResetDevice,
        ];
        for body in bodies.iter().cloned() {
            queue.enqueue(Command::new(body)).expect("enqueue");
        }

        let drained: Vec<_> = std::iter::from_fn(|| queue.drain_next()).collect();
        assert_eq!(drained.len(), 3);
        assert_eq!(
            drained.iter().map(|r| r.id.get()).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(
            drained.iter().map(|r| r.body.clone()).collect::<Vec<_>>(),
            bodies.to_vec()
        );
        assert_eq!(queue.pending_count(), 3);
        assert!(queue.drain_next().is_none());
    }

    #[test]
    fn test_resolve_out_of_order() {
        let mut queue = CommandQueue::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for _ in 0..3 {
            let order = Arc::clone(&order);
            queue
                .enqueue(Command::new(CommandBody::ResetDevice).on_complete(
                    move |_, command| order.lock().push(command.id().map(CorrelationId::get)),
                ))
                .expect("enqueue");
        }

        queue.resolve(id(3), vec![]).expect("resolve 3");
        queue.resolve(id(1), vec![]).expect("resolve 1");
        queue.resolve(id(2), vec![]).expect("resolve 2");

        assert_eq!(*order.lock(), vec![Some(3), Some(1), Some(2)]);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_at_most_once_delivery() {
        let mut queue = CommandQueue::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let assigned = queue
            .enqueue(
                Command::new(CommandBody::WritePersistedConfig)
                    .on_complete(move |_, _| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .expect("enqueue");

        queue.resolve(assigned, vec![json!(1)]).expect("resolve");
        let second = queue.resolve(assigned, vec![json!(1)]);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(second, Err(Error::MissingCommand { id }) if id == assigned));
    }

    #[test]
    fn test_resolve_unknown_id_is_missing_command() {
        let mut queue = CommandQueue::new();
        let err = queue.resolve(id(99), vec![]).unwrap_err();
        assert!(err.is_protocol_desync());
    }

    #[test]
    fn test_preallocated_id() {
        let mut queue = CommandQueue::new();
        let reserved = queue.next_id();
        let assigned = queue
            .enqueue(
                Command::new(CommandBody::SetBrightness { brightness: 40 })
                    .with_id(reserved)
                    .with_kind(ResponseKind::Test)
                    .with_transform(decode_state()),
            )
            .expect("enqueue");
        assert_eq!(assigned, reserved);

        let next = queue
            .enqueue(Command::new(CommandBody::GetState))
            .expect("enqueue");
        assert_eq!(next, id(2));

        let frame = queue.drain_next().expect("frame");
        assert_eq!(frame.kind, ResponseKind::Test);

        let response = queue
            .resolve(reserved, vec![json!(5), json!(40), json!(10), json!([])])
            .expect("resolve");
        assert_eq!(
            response.as_state().map(|s| s.device_id),
            Some(DeviceId::new(5))
        );
    }

    #[test]
    fn test_duplicate_preallocated_id_rejected() {
        let mut queue = CommandQueue::new();
        queue
            .enqueue(Command::new(CommandBody::GetState).with_id(id(5)))
            .expect("enqueue");
        let err = queue
            .enqueue(Command::new(CommandBody::GetState).with_id(id(5)))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateCommand { .. }));
    }

    #[test]
    fn test_invalid_payload_rejected_before_registration() {
        let mut queue = CommandQueue::new();
        let err = queue
            .enqueue(Command::new(CommandBody::ResizeSegments { boundaries: vec![] }))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.queued_count(), 0);
    }

    #[test]
    fn test_capacity_is_max_id_minus_one() {
        let mut queue = CommandQueue::new();
        for _ in 0..MAX_PENDING {
            queue
                .enqueue(Command::new(CommandBody::GetState))
                .expect("enqueue");
        }
        let err = queue
            .enqueue(Command::new(CommandBody::GetState))
            .unwrap_err();
        assert!(matches!(err, Error::TooManyPending { .. }));
    }

    #[test]
    fn test_wrapped_allocation_skips_outstanding_ids() {
        let mut queue = CommandQueue::new();
        let first = queue
            .enqueue(Command::new(CommandBody::GetState))
            .expect("enqueue");
        // Burn through the id space while id 1 stays outstanding.
        for _ in 2..MAX_ID {
            let _ = queue.next_id();
        }
        let wrapped = queue
            .enqueue(Command::new(CommandBody::GetState))
            .expect("enqueue");
        assert_eq!(first, id(1));
        assert_eq!(wrapped, id(2));
    }

    #[test]
    fn test_purge() {
        let mut queue = CommandQueue::new();
        queue
            .enqueue(Command::new(CommandBody::GetState))
            .expect("enqueue");
        queue
            .enqueue(Command::new(CommandBody::ResetDevice))
            .expect("enqueue");
        assert_eq!(queue.purge(), 2);
        assert_eq!(queue.pending_count(), 0);
        assert!(queue.drain_next().is_none());
    }

    proptest! {
        #[test]
        fn prop_ids_unique_without_resolution(count in 1usize..2_000) {
            let mut queue = CommandQueue::new();
            let mut seen = FxHashSet::default();
            for _ in 0..count {
                let assigned = queue.enqueue(Command::new(CommandBody::GetState)).expect("enqueue");
                prop_assert!(seen.insert(assigned));
            }
        }

        #[test]
        fn prop_resolved_ids_are_freed(resolve_mask in proptest::collection::vec(any::<bool>(), 1..200)) {
            let mut queue = CommandQueue::new();
            let ids: Vec<_> = resolve_mask
                .iter()
                .map(|_| queue.enqueue(Command::new(CommandBody::GetState)).expect("enqueue"))
                .collect();
            let mut outstanding = ids.len();
            for (assigned, resolve) in ids.iter().zip(&resolve_mask) {
                if *resolve {
                    queue.resolve(*assigned, vec![]).expect("resolve");
                    outstanding -= 1;
                    prop_assert!(!queue.is_pending(*assigned));
                }
            }
            prop_assert_eq!(queue.pending_count(), outstanding);
        }
    }
}
