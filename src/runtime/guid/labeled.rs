//! Labeled GUID provider
//!
//! Behaves like the counted provider and additionally hands out reserved
//! ranges. Objects can then be created under a chosen GUID from such a range,
//! which lets several producers agree on a name without talking to each
//! other first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use super::counted::CountedProvider;
use super::{DomainId, Guid, GuidKind, GuidRange, ProviderStats, COUNTER_MASK};
use crate::fatal_invariant;
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::memory::DomainAllocator;
use crate::runtime::metadata::Metadata;

const BLOCK_POLL: Duration = Duration::from_millis(5);

/// How labeled creation treats a label that is already live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LabelMode {
    /// Fail with `GuidExists`.
    #[default]
    Check,
    /// Wait until the current holder releases it.
    Block,
    /// Caller guarantees the label is free; no lookup is made first.
    Trust,
}

#[derive(Debug)]
pub struct LabeledProvider {
    table: CountedProvider,
    location: DomainId,
    next_reserved: AtomicU64,
    freed: Mutex<()>,
    freed_signal: Condvar,
}

impl LabeledProvider {
    pub fn new(
        location: DomainId,
        max_entries: usize,
        allocator: DomainAllocator,
    ) -> Self {
        LabeledProvider {
            table: CountedProvider::new(location, max_entries, allocator),
            location,
            next_reserved: AtomicU64::new(1),
            freed: Mutex::new(()),
            freed_signal: Condvar::new(),
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
        self.table.create(kind, extra_bytes, build)
    }

    /// Reserve `count` consecutive GUIDs of one kind.
    ///
    /// Reserved GUIDs carry the reserved bit, so they never collide with
    /// GUIDs minted by plain `create`.
    pub fn reserve(
        &self,
        count: u64,
        kind: GuidKind,
    ) -> Result<GuidRange> {
        if count == 0 {
            return Err(RuntimeError::InvalidArgument("cannot reserve zero GUIDs".into()));
        }
        let start = self.next_reserved.fetch_add(count, Ordering::Relaxed);
        if start.saturating_add(count - 1) > COUNTER_MASK {
            return Err(RuntimeError::GuidTableFull(self.table.stats().live));
        }
        let first = Guid::compose(self.location, kind, true, start);
        tracing::debug!(start = %first, count, "reserved GUID range");
        Ok(GuidRange::new(first, count))
    }

    pub fn create_labeled<F>(
        &self,
        guid: Guid,
        mode: LabelMode,
        extra_bytes: usize,
        build: F,
    ) -> Result<Metadata>
    where
        F: FnOnce(Guid) -> Metadata,
    {
        let kind = guid.kind().ok_or(RuntimeError::UnknownGuid(guid))?;
        if !guid.is_reserved() || guid.location() != self.location {
            return Err(RuntimeError::InvalidArgument(format!(
                "{guid} was not reserved by domain {}",
                self.location
            )));
        }

        match mode {
            LabelMode::Check => {
                if self.table.contains(guid) {
                    return Err(RuntimeError::GuidExists(guid));
                }
            },
            LabelMode::Block => {
                let mut guard = self.freed.lock();
                while self.table.contains(guid) {
                    self.freed_signal.wait_for(&mut guard, BLOCK_POLL);
                }
            },
            LabelMode::Trust => {},
        }

        let block = self.table.admit(kind, extra_bytes)?;
        let meta = build(guid);
        if let Err(block) = self.table.try_publish(guid, meta.clone(), block) {
            if mode == LabelMode::Trust {
                fatal_invariant!("trusted label {guid} was already live");
            }
            self.table.reject(block);
            return Err(RuntimeError::GuidExists(guid));
        }
        Ok(meta)
    }

    pub fn resolve(
        &self,
        guid: Guid,
    ) -> Result<Metadata> {
        self.table.resolve(guid)
    }

    pub fn share(
        &self,
        guid: Guid,
    ) -> Result<()> {
        self.table.share(guid)
    }

    pub fn release(
        &self,
        guid: Guid,
    ) -> Result<bool> {
        let freed = self.table.release(guid)?;
        if freed && guid.is_reserved() {
            let _guard = self.freed.lock();
            self.freed_signal.notify_all();
        }
        Ok(freed)
    }

    pub fn stats(&self) -> ProviderStats {
        self.table.stats()
    }

    pub fn clear(&self) -> usize {
        self.table.clear()
    }
}
