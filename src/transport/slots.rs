//! Bluetooth serial bridge slot pool.
//!
//! Slots are the numbered `/dev/rfcommN` bindings that back Bluetooth
//! transports. The pool hands out numbers from `[0, slot_max]`, records
//! which address each held slot is bound to, and gives numbers back on
//! release.
//!
//! # Exclusivity
//!
//! [`SlotPool::allocate`] observes external slot usage first (the only
//! suspension point), then decides and records the allocation inside one
//! critical section. Two concurrent allocations can never return the same
//! number.
//!
//! ```text
//! allocate ──► in_use().await ──► lock { rotate free list, hold slot }
//! bind     ──► allocate ──► lock { record address } ──► rfcomm bind
//! release  ──► lock { unhold, push free } ──► rfcomm release
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::identifiers::SlotNumber;

use super::discovery::DeviceDirectory;

// ============================================================================
// Constants
// ============================================================================

/// Default highest slot number.
pub const DEFAULT_SLOT_MAX: u16 = 100;

/// Default RFCOMM channel used when binding.
pub const DEFAULT_RFCOMM_CHANNEL: u8 = 1;

// ============================================================================
// SlotDetails
// ============================================================================

/// Binding reported by the system for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotDetails {
    /// Device name, e.g. `rfcomm0`.
    pub device: String,
    /// Remote Bluetooth address.
    pub address: String,
}

impl SlotDetails {
    /// Parses one line of `rfcomm show` output.
    ///
    /// Accepts both `rfcomm0: AA:BB:.. -> 11:22:.. channel 1 clean` and
    /// `rfcomm0: 11:22:.. channel 1 clean`.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let device = tokens.first()?.trim_end_matches(':');
        let address = match tokens.get(2) {
            Some(&"->") => tokens.get(3)?,
            _ => tokens.get(1)?,
        };
        if device.is_empty() || address.is_empty() {
            return None;
        }
        Some(Self {
            device: device.to_string(),
            address: (*address).to_string(),
        })
    }
}

// ============================================================================
// SlotControl
// ============================================================================

/// System side of slot management.
#[async_trait]
pub trait SlotControl: Send + Sync {
    /// Lists slots currently in use on the system, by anyone.
    async fn in_use(&self) -> Result<Vec<SlotNumber>>;

    /// Binds `slot` to `address` on `channel`.
    async fn bind(&self, slot: SlotNumber, address: &str, channel: u8) -> Result<()>;

    /// Releases `slot`.
    async fn release(&self, slot: SlotNumber) -> Result<()>;

    /// Reports the current binding of `slot`.
    async fn show(&self, slot: SlotNumber) -> Result<SlotDetails>;
}

// ============================================================================
// RfcommControl
// ============================================================================

/// [`SlotControl`] backed by the `rfcomm` utility and the device directory.
#[derive(Debug, Clone)]
pub struct RfcommControl {
    /// Directory scanned for existing bridges.
    directory: DeviceDirectory,
    /// Utility to invoke.
    program: String,
}

impl RfcommControl {
    /// Creates a control using the `rfcomm` utility on `PATH`.
    #[must_use]
    pub fn new(directory: DeviceDirectory) -> Self {
        Self {
            directory,
            program: "rfcomm".to_string(),
        }
    }

    /// Overrides the utility path.
    #[must_use]
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Runs the utility and returns its stdout.
    async fn run(&self, slot: SlotNumber, args: &[&str]) -> Result<String> {
        debug!(program = %self.program, ?args, "Running slot command");

        let output = Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::slot_command(slot, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::slot_command(
                slot,
                format!("{} ({})", stderr.trim(), output.status),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SlotControl for RfcommControl {
    async fn in_use(&self) -> Result<Vec<SlotNumber>> {
        self.directory.slots_present().await
    }

    async fn bind(&self, slot: SlotNumber, address: &str, channel: u8) -> Result<()> {
        let slot_arg = slot.to_string();
        let channel_arg = channel.to_string();
        self.run(slot, &["bind", &slot_arg, address, &channel_arg])
            .await
            .map(|_| ())
    }

    async fn release(&self, slot: SlotNumber) -> Result<()> {
        let slot_arg = slot.to_string();
        self.run(slot, &["release", &slot_arg]).await.map(|_| ())
    }

    async fn show(&self, slot: SlotNumber) -> Result<SlotDetails> {
        let slot_arg = slot.to_string();
        let stdout = self.run(slot, &["show", &slot_arg]).await?;
        stdout
            .lines()
            .find_map(SlotDetails::parse)
            .ok_or_else(|| Error::slot_command(slot, format!("unparsable output: {stdout:?}")))
    }
}

// ============================================================================
// SlotState
// ============================================================================

/// Free list and holdings, guarded together.
#[derive(Debug)]
struct SlotState {
    /// Candidates in hand-out order.
    free: VecDeque<SlotNumber>,
    /// Held slots and the address each is bound to, once known.
    held: FxHashMap<SlotNumber, Option<String>>,
}

impl SlotState {
    /// Pops the first candidate not observed in use.
    ///
    /// Conflicting candidates rotate to the back instead of being lost.
    fn take_free(&mut self, observed: &[SlotNumber]) -> Option<SlotNumber> {
        for _ in 0..self.free.len() {
            let candidate = self.free.pop_front()?;
            if observed.contains(&candidate) || self.held.contains_key(&candidate) {
                debug!(slot = %candidate, "Slot in use, trying next");
                self.free.push_back(candidate);
                continue;
            }
            self.held.insert(candidate, None);
            return Some(candidate);
        }
        None
    }

    /// Returns the held slot recorded for `address`.
    fn slot_for(&self, address: &str) -> Option<SlotNumber> {
        self.held
            .iter()
            .find(|(_, bound)| bound.as_deref() == Some(address))
            .map(|(&slot, _)| slot)
    }
}

// ============================================================================
// SlotPool
// ============================================================================

/// Bounded pool of bridge slot numbers.
///
/// Shared by every session through an `Arc`.
pub struct SlotPool {
    /// System side.
    control: Arc<dyn SlotControl>,
    /// RFCOMM channel used on bind.
    channel: u8,
    /// Free list and holdings.
    state: Mutex<SlotState>,
}

impl fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SlotPool")
            .field("channel", &self.channel)
            .field("free", &state.free.len())
            .field("held", &state.held.len())
            .finish_non_exhaustive()
    }
}

impl SlotPool {
    /// Creates a full pool over `[0, slot_max]`.
    #[must_use]
    pub fn new(control: Arc<dyn SlotControl>, slot_max: u16, channel: u8) -> Self {
        let free = (0..=slot_max).map(SlotNumber::new).collect();
        Self {
            control,
            channel,
            state: Mutex::new(SlotState {
                free,
                held: FxHashMap::default(),
            }),
        }
    }

    /// Hands out a slot not held here and not observed in use.
    ///
    /// # Errors
    ///
    /// - [`Error::SlotsExhausted`] if no candidate is free
    /// - the control's error if usage cannot be observed
    pub async fn allocate(&self) -> Result<SlotNumber> {
        let observed = self.control.in_use().await?;

        let slot = self
            .state
            .lock()
            .take_free(&observed)
            .ok_or(Error::SlotsExhausted)?;

        debug!(%slot, "Slot allocated");
        Ok(slot)
    }

    /// Allocates a slot and binds it to `address`.
    ///
    /// Returns the existing slot if `address` is already bound or being
    /// bound here. The address is recorded in the same critical section
    /// that picks the slot. The slot goes back to the pool if the bind
    /// command fails.
    ///
    /// # Errors
    ///
    /// - [`Error::SlotsExhausted`] if no candidate is free
    /// - [`Error::SlotCommand`] if the bind command fails
    pub async fn bind(&self, address: &str) -> Result<SlotNumber> {
        if let Some(slot) = self.slot_for(address) {
            debug!(%slot, address, "Address already bound");
            return Ok(slot);
        }

        let observed = self.control.in_use().await?;

        let slot = {
            let mut state = self.state.lock();
            if let Some(slot) = state.slot_for(address) {
                debug!(%slot, address, "Address bound concurrently");
                return Ok(slot);
            }
            let slot = state.take_free(&observed).ok_or(Error::SlotsExhausted)?;
            state.held.insert(slot, Some(address.to_string()));
            slot
        };
        debug!(%slot, address, "Slot reserved");

        match self.control.bind(slot, address, self.channel).await {
            Ok(()) => {
                info!(%slot, address, "Slot bound");
                Ok(slot)
            }
            Err(e) => {
                error!(%slot, address, error = %e, "Slot bind failed");
                self.unhold(slot);
                Err(e)
            }
        }
    }

    /// Records a slot that was bound outside this pool.
    ///
    /// Used when discovery finds a bridge this process did not bind, so
    /// its release on close goes through the pool. No-op if already held.
    pub async fn adopt(&self, slot: SlotNumber) {
        {
            let mut state = self.state.lock();
            if state.held.contains_key(&slot) {
                return;
            }
            state.free.retain(|&s| s != slot);
            state.held.insert(slot, None);
        }

        match self.control.show(slot).await {
            Ok(details) => {
                debug!(%slot, address = %details.address, "Slot adopted");
                if let Some(entry) = self.state.lock().held.get_mut(&slot)
                    && entry.is_none()
                {
                    *entry = Some(details.address);
                }
            }
            Err(e) => debug!(%slot, error = %e, "Slot adopted without details"),
        }
    }

    /// Returns a slot to the pool and releases it on the system.
    ///
    /// Releasing a slot that is not held logs a warning and does nothing.
    ///
    /// # Errors
    ///
    /// Returns the control's error if the release command fails. The slot
    /// is back in the pool either way.
    pub async fn release(&self, slot: SlotNumber) -> Result<()> {
        let Some(address) = self.unhold(slot) else {
            warn!(%slot, "Slot already released");
            return Ok(());
        };

        info!(%slot, address = address.as_deref().unwrap_or("unknown"), "Releasing slot");
        self.control.release(slot).await
    }

    /// Reports the system binding of a slot.
    ///
    /// # Errors
    ///
    /// Returns the control's error.
    pub async fn details(&self, slot: SlotNumber) -> Result<SlotDetails> {
        self.control.show(slot).await
    }

    /// Returns the slot bound to `address`, if any.
    #[must_use]
    pub fn slot_for(&self, address: &str) -> Option<SlotNumber> {
        self.state.lock().slot_for(address)
    }

    /// Returns the address a held slot is bound to.
    #[must_use]
    pub fn address_of(&self, slot: SlotNumber) -> Option<String> {
        self.state.lock().held.get(&slot).cloned().flatten()
    }

    /// Returns `true` if the slot is held here.
    #[inline]
    #[must_use]
    pub fn is_held(&self, slot: SlotNumber) -> bool {
        self.state.lock().held.contains_key(&slot)
    }

    /// Returns the number of held slots.
    #[inline]
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Returns the number of free candidates.
    #[inline]
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Drops a holding and returns the number to the free list.
    ///
    /// Returns the recorded address, or `None` if the slot was not held.
    fn unhold(&self, slot: SlotNumber) -> Option<Option<String>> {
        let mut state = self.state.lock();
        let address = state.held.remove(&slot)?;
        state.free.push_back(slot);
        Some(address)
    }
}

// ============================================================================
// Tests
// ============================================================================
