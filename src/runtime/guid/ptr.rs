//! Arena GUID provider
//!
//! The counter field of a GUID holds an arena index plus the generation of
//! the slot at creation time. Freeing a slot bumps its generation, so a GUID
//! that outlived its object no longer matches and resolves to `UnknownGuid`
//! even after the slot is reused.
//!
//! The arena is split into shards, each under its own lock; the low bits of
//! an index select the shard.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{footprint, DomainId, Entry, Guid, GuidKind, ProviderStats, COUNTER_MASK};
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::memory::DomainAllocator;
use crate::runtime::metadata::Metadata;

const INDEX_BITS: u32 = 32;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: u64 = COUNTER_MASK >> INDEX_BITS;
const SHARDS: usize = 16;

#[derive(Debug)]
enum SlotState {
    Free,
    /// Handed out to a creation that has not published yet.
    Reserved,
    Live(Arc<Entry>),
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    state: SlotState,
}

impl Slot {
    fn vacate(&mut self) {
        self.state = SlotState::Free;
        self.generation = (self.generation + 1) & GENERATION_MASK;
        if self.generation == 0 {
            self.generation = 1;
        }
    }
}

#[derive(Debug, Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

#[derive(Debug)]
pub struct PtrProvider {
    location: DomainId,
    shards: Box<[RwLock<Arena>]>,
    /// Round-robin shard choice for new slots.
    cursor: AtomicUsize,
    live: AtomicUsize,
    max_entries: usize,
    created: AtomicU64,
    released: AtomicU64,
    allocator: DomainAllocator,
}

#[inline]
fn encode(
    index: u32,
    generation: u64,
) -> u64 {
    (generation << INDEX_BITS) | index as u64
}

#[inline]
fn decode(guid: Guid) -> (usize, u64) {
    let counter = guid.counter();
    ((counter & INDEX_MASK) as usize, counter >> INDEX_BITS)
}

/// Shard and position inside the shard of a global index.
#[inline]
fn split(index: usize) -> (usize, usize) {
    (index % SHARDS, index / SHARDS)
}

impl PtrProvider {
    pub fn new(
        location: DomainId,
        max_entries: usize,
        allocator: DomainAllocator,
    ) -> Self {
        PtrProvider {
            location,
            shards: (0..SHARDS).map(|_| RwLock::new(Arena::default())).collect(),
            cursor: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            max_entries: max_entries.min(INDEX_MASK as usize),
            created: AtomicU64::new(0),
            released: AtomicU64::new(0),
            allocator,
        }
    }

    pub fn create<F>(
        &self,
        kind: GuidKind,
        extra_bytes: usize,
        build: F,
    ) -> Result<(Guid, Metadata)>
    where
        F: FnOnce(Guid) -> Metadata,
    {
        let live = self.live.fetch_add(1, Ordering::AcqRel);
        if live >= self.max_entries {
            self.live.fetch_sub(1, Ordering::AcqRel);
            return Err(RuntimeError::GuidTableFull(live));
        }
        let shard = self.cursor.fetch_add(1, Ordering::Relaxed) % SHARDS;
        let (index, generation) = {
            let mut arena = self.shards[shard].write();
            let local = match arena.free.pop() {
                Some(local) => local as usize,
                None => {
                    arena.slots.push(Slot {
                        generation: 1,
                        state: SlotState::Free,
                    });
                    arena.slots.len() - 1
                },
            };
            let slot = &mut arena.slots[local];
            slot.state = SlotState::Reserved;
            (local * SHARDS + shard, slot.generation)
        };

        let block = match self.allocator.allocate(footprint(kind, extra_bytes)) {
            Ok(block) => block,
            Err(err) => {
                self.vacate(index);
                return Err(err);
            },
        };

        let guid = Guid::compose(self.location, kind, false, encode(index as u32, generation));
        let meta = build(guid);
        let (shard, local) = split(index);
        self.shards[shard].write().slots[local].state =
            SlotState::Live(Arc::new(Entry::new(meta.clone(), block)));
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok((guid, meta))
    }

    /// Return a slot to its shard's free list under a new generation.
    fn vacate(
        &self,
        index: usize,
    ) {
        let (shard, local) = split(index);
        let mut arena = self.shards[shard].write();
        arena.slots[local].vacate();
        arena.free.push(local as u32);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    fn entry(
        &self,
        guid: Guid,
    ) -> Result<Arc<Entry>> {
        if guid.is_sentinel() || guid.location() != self.location {
            return Err(RuntimeError::UnknownGuid(guid));
        }
        let (index, generation) = decode(guid);
        let (shard, local) = split(index);
        let arena = self.shards[shard].read();
        match arena.slots.get(local) {
            Some(Slot {
                generation: current,
                state: SlotState::Live(entry),
            }) if *current == generation => Ok(Arc::clone(entry)),
            _ => Err(RuntimeError::UnknownGuid(guid)),
        }
    }

    pub fn resolve(
        &self,
        guid: Guid,
    ) -> Result<Metadata> {
        self.entry(guid).map(|e| e.meta.clone())
    }

    pub fn share(
        &self,
        guid: Guid,
    ) -> Result<()> {
        if self.entry(guid)?.retain() {
            Ok(())
        } else {
            Err(RuntimeError::UnknownGuid(guid))
        }
    }

    pub fn release(
        &self,
        guid: Guid,
    ) -> Result<bool> {
        let entry = self.entry(guid)?;
        match entry.drop_holder() {
            None => Err(RuntimeError::UnknownGuid(guid)),
            Some(false) => Ok(false),
            Some(true) => {
                let (index, _) = decode(guid);
                self.vacate(index);
                self.allocator.free(entry.block);
                self.released.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            },
        }
    }

    pub fn stats(&self) -> ProviderStats {
        ProviderStats {
            live: self.live.load(Ordering::Acquire),
            created: self.created.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        for shard in self.shards.iter() {
            let mut arena = shard.write();
            let Arena { slots, free } = &mut *arena;
            for (local, slot) in slots.iter_mut().enumerate() {
                if let SlotState::Live(entry) = std::mem::replace(&mut slot.state, SlotState::Free) {
                    self.allocator.free(entry.block);
                    slot.vacate();
                    free.push(local as u32);
                    dropped += 1;
                }
            }
        }
        self.live.fetch_sub(dropped, Ordering::AcqRel);
        dropped
    }
}
