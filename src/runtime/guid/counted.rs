//! Counted GUID provider
//!
//! GUIDs come from a per-domain monotone counter and are resolved through a
//! sharded hash map. Counters are never reused, so a stale GUID can only
//! ever observe `UnknownGuid`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use super::{footprint, DomainId, Entry, Guid, GuidKind, ProviderStats, COUNTER_MASK};
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::memory::{DomainAllocator, MetaBlock};
use crate::runtime::metadata::Metadata;

const SHARDS: usize = 16;

type Shard = RwLock<HashMap<u64, Arc<Entry>>>;

#[derive(Debug)]
pub struct CountedProvider {
    location: DomainId,
    next: AtomicU64,
    shards: Box<[Shard]>,
    live: AtomicUsize,
    max_entries: usize,
    created: AtomicU64,
    released: AtomicU64,
    allocator: DomainAllocator,
}

impl CountedProvider {
    pub fn new(
        location: DomainId,
        max_entries: usize,
        allocator: DomainAllocator,
    ) -> Self {
        CountedProvider {
            location,
            next: AtomicU64::new(1),
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            live: AtomicUsize::new(0),
            max_entries,
            created: AtomicU64::new(0),
            released: AtomicU64::new(0),
            allocator,
        }
    }

    #[inline]
    fn shard(
        &self,
        guid: Guid,
    ) -> &Shard {
        &self.shards[(guid.counter() as usize) % SHARDS]
    }

    /// Claim a live slot and charge metadata space for it.
    pub(super) fn admit(
        &self,
        kind: GuidKind,
        extra_bytes: usize,
    ) -> Result<MetaBlock> {
        let live = self.live.fetch_add(1, Ordering::AcqRel);
        if live >= self.max_entries {
            self.live.fetch_sub(1, Ordering::AcqRel);
            return Err(RuntimeError::GuidTableFull(live));
        }
        self.allocator
            .allocate(footprint(kind, extra_bytes))
            .inspect_err(|_| {
                self.live.fetch_sub(1, Ordering::AcqRel);
            })
    }

    /// Undo an `admit` whose object was never published.
    pub(super) fn reject(
        &self,
        block: MetaBlock,
    ) {
        self.allocator.free(block);
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    /// Publish a built record under a freshly minted GUID.
    fn publish(
        &self,
        guid: Guid,
        meta: Metadata,
        block: MetaBlock,
    ) {
        let entry = Arc::new(Entry::new(meta, block));
        self.shard(guid).write().insert(guid.raw(), entry);
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    /// Publish under a caller-chosen GUID unless it is already live.
    /// On collision the charged block is handed back untouched.
    pub(super) fn try_publish(
        &self,
        guid: Guid,
        meta: Metadata,
        block: MetaBlock,
    ) -> std::result::Result<(), MetaBlock> {
        let mut shard = self.shard(guid).write();
        if shard.contains_key(&guid.raw()) {
            return Err(block);
        }
        shard.insert(guid.raw(), Arc::new(Entry::new(meta, block)));
        drop(shard);
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub(super) fn contains(
        &self,
        guid: Guid,
    ) -> bool {
        self.shard(guid).read().contains_key(&guid.raw())
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
        let block = self.admit(kind, extra_bytes)?;
        let counter = self.next.fetch_add(1, Ordering::Relaxed);
        if counter > COUNTER_MASK {
            self.reject(block);
            return Err(RuntimeError::GuidTableFull(self.live.load(Ordering::Relaxed)));
        }
        let guid = Guid::compose(self.location, kind, false, counter);
        let meta = build(guid);
        self.publish(guid, meta.clone(), block);
        Ok((guid, meta))
    }

    fn entry(
        &self,
        guid: Guid,
    ) -> Result<Arc<Entry>> {
        if guid.is_sentinel() || guid.location() != self.location {
            return Err(RuntimeError::UnknownGuid(guid));
        }
        self.shard(guid)
            .read()
            .get(&guid.raw())
            .cloned()
            .ok_or(RuntimeError::UnknownGuid(guid))
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
        let entry = self.entry(guid)?;
        if entry.retain() {
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
                let mut shard = self.shard(guid).write();
                if shard
                    .get(&guid.raw())
                    .is_some_and(|current| Arc::ptr_eq(current, &entry))
                {
                    shard.remove(&guid.raw());
                }
                drop(shard);
                self.allocator.free(entry.block);
                self.live.fetch_sub(1, Ordering::AcqRel);
                self.released.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            },
        }
    }

    pub fn stats(&self) -> ProviderStats {
        ProviderStats {
            live: self.live.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        for shard in self.shards.iter() {
            for (_, entry) in shard.write().drain() {
                self.allocator.free(entry.block);
                dropped += 1;
            }
        }
        self.live.fetch_sub(dropped, Ordering::AcqRel);
        dropped
    }
}
