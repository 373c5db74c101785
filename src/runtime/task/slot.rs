//! Dependency slots
//!
//! A slot goes Unbound -> Bound -> Satisfied (or Failed), or straight from
//! Unbound to Satisfied when something satisfies it without a prior binding.
//! Every transition is a compare-and-swap, so a slot resolves at most once
//! no matter how many producers race on it.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::runtime::datablock::AccessMode;
use crate::runtime::guid::Guid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Unbound = 0,
    /// A binder won the race and is writing the source.
    Binding = 1,
    Bound = 2,
    /// A resolver won the race and is writing the payload.
    Resolving = 3,
    Satisfied = 4,
    Failed = 5,
}

impl SlotState {
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => SlotState::Unbound,
            1 => SlotState::Binding,
            2 => SlotState::Bound,
            3 => SlotState::Resolving,
            4 => SlotState::Satisfied,
            _ => SlotState::Failed,
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn is_resolved(self) -> bool {
        matches!(
            self,
            SlotState::Resolving | SlotState::Satisfied | SlotState::Failed
        )
    }
}

/// Why a resolution attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRefusal {
    AlreadyBound,
    AlreadyResolved,
}

#[derive(Debug)]
pub struct DepSlot {
    state: AtomicU8,
    source: AtomicU64,
    payload: AtomicU64,
    mode: AtomicU8,
}

impl DepSlot {
    pub fn new() -> Self {
        DepSlot {
            state: AtomicU8::new(SlotState::Unbound.as_u8()),
            source: AtomicU64::new(Guid::UNINITIALIZED.raw()),
            payload: AtomicU64::new(Guid::UNINITIALIZED.raw()),
            mode: AtomicU8::new(AccessMode::default().as_u8()),
        }
    }

    #[inline]
    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn source(&self) -> Guid {
        Guid::from_raw(self.source.load(Ordering::Acquire))
    }

    #[inline]
    pub fn payload(&self) -> Guid {
        Guid::from_raw(self.payload.load(Ordering::Acquire))
    }

    #[inline]
    pub fn mode(&self) -> AccessMode {
        AccessMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Record `source` as the producer feeding this slot.
    pub fn bind(
        &self,
        source: Guid,
        mode: AccessMode,
    ) -> Result<(), SlotRefusal> {
        // Mode and source are written before the state flips so a resolver
        // that observes Bound also observes them.
        match self.state.compare_exchange(
            SlotState::Unbound.as_u8(),
            SlotState::Binding.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.source.store(source.raw(), Ordering::Relaxed);
                self.mode.store(mode.as_u8(), Ordering::Relaxed);
                self.state.store(SlotState::Bound.as_u8(), Ordering::Release);
                Ok(())
            },
            Err(seen) if matches!(SlotState::from_u8(seen), SlotState::Binding | SlotState::Bound) => {
                Err(SlotRefusal::AlreadyBound)
            },
            Err(_) => Err(SlotRefusal::AlreadyResolved),
        }
    }

    /// Claim the slot for resolution and write its outcome.
    fn resolve(
        &self,
        payload: Guid,
        mode: Option<AccessMode>,
        outcome: SlotState,
    ) -> Result<(), SlotRefusal> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match SlotState::from_u8(current) {
                SlotState::Unbound | SlotState::Bound => {},
                SlotState::Binding => {
                    std::hint::spin_loop();
                    current = self.state.load(Ordering::Acquire);
                    continue;
                },
                _ => return Err(SlotRefusal::AlreadyResolved),
            }
            match self.state.compare_exchange_weak(
                current,
                SlotState::Resolving.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }
        self.payload.store(payload.raw(), Ordering::Relaxed);
        if let Some(mode) = mode {
            self.mode.store(mode.as_u8(), Ordering::Relaxed);
        }
        self.state.store(outcome.as_u8(), Ordering::Release);
        Ok(())
    }

    pub fn satisfy(
        &self,
        payload: Guid,
        mode: Option<AccessMode>,
    ) -> Result<(), SlotRefusal> {
        self.resolve(payload, mode, SlotState::Satisfied)
    }

    pub fn fail(&self) -> Result<(), SlotRefusal> {
        self.resolve(Guid::ERROR, None, SlotState::Failed)
    }

    /// Replace the payload of a satisfied slot before dispatch.
    pub(crate) fn patch_payload(
        &self,
        payload: Guid,
    ) {
        self.payload.store(payload.raw(), Ordering::Release);
    }

    /// Mark a satisfied slot as failed before dispatch.
    pub(crate) fn mark_failed(&self) {
        self.payload.store(Guid::ERROR.raw(), Ordering::Relaxed);
        self.state.store(SlotState::Failed.as_u8(), Ordering::Release);
    }
}

impl Default for DepSlot {
    fn default() -> Self {
        Self::new()
    }
}
