//! Global unique identifiers
//!
//! Every runtime object (task, template, event, data-block) is named by a
//! 64-bit [`Guid`] and resolved through a [`GuidProvider`]. The bit layout
//! carries the owning domain and the object kind so both can be recovered
//! without a table lookup:
//!
//! ```text
//! | locality (7) | kind (5) | reserved (1) | counter (51) |
//! ```
//!
//! Three provider strategies exist ([`ProviderKind`]). The choice is made
//! once per domain from configuration.

mod counted;
mod labeled;
mod ptr;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

pub use counted::CountedProvider;
pub use labeled::{LabeledProvider, LabelMode};
pub use ptr::PtrProvider;

use super::datablock::DataBlock;
use super::error::{Result, RuntimeError};
use super::event::Event;
use super::memory::{DomainAllocator, MetaBlock};
use super::metadata::Metadata;
use super::task::{Task, TaskTemplate};

/// Index of a policy domain inside a runtime.
pub type DomainId = usize;

/// Largest number of domains the locality field can encode.
pub const MAX_DOMAINS: usize = 1 << LOCALITY_BITS;

const LOCALITY_BITS: u32 = 7;
const KIND_BITS: u32 = 5;
const RESERVED_BITS: u32 = 1;
const COUNTER_BITS: u32 = 64 - LOCALITY_BITS - KIND_BITS - RESERVED_BITS;

const COUNTER_SHIFT: u32 = 0;
const RESERVED_SHIFT: u32 = COUNTER_BITS;
const KIND_SHIFT: u32 = RESERVED_SHIFT + RESERVED_BITS;
const LOCALITY_SHIFT: u32 = KIND_SHIFT + KIND_BITS;

pub(crate) const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;
const KIND_MASK: u64 = (1 << KIND_BITS) - 1;
const LOCALITY_MASK: u64 = (1 << LOCALITY_BITS) - 1;

/// Object kind encoded in a GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum GuidKind {
    DataBlock = 2,
    Task = 3,
    Template = 4,
    EventOnce = 17,
    EventIdempotent = 18,
    EventSticky = 19,
    EventLatch = 20,
    EventChannel = 21,
}

const EVENT_BIT: u8 = 0x10;

impl GuidKind {
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            2 => Some(GuidKind::DataBlock),
            3 => Some(GuidKind::Task),
            4 => Some(GuidKind::Template),
            17 => Some(GuidKind::EventOnce),
            18 => Some(GuidKind::EventIdempotent),
            19 => Some(GuidKind::EventSticky),
            20 => Some(GuidKind::EventLatch),
            21 => Some(GuidKind::EventChannel),
            _ => None,
        }
    }

    #[inline]
    pub fn is_event(self) -> bool {
        self.as_u8() & EVENT_BIT != 0
    }

    pub fn name(self) -> &'static str {
        match self {
            GuidKind::DataBlock => "data-block",
            GuidKind::Task => "task",
            GuidKind::Template => "template",
            GuidKind::EventOnce => "once event",
            GuidKind::EventIdempotent => "idempotent event",
            GuidKind::EventSticky => "sticky event",
            GuidKind::EventLatch => "latch event",
            GuidKind::EventChannel => "channel event",
        }
    }
}

/// A 64-bit global identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Guid(u64);

impl Guid {
    pub const NULL: Guid = Guid(0);
    pub const ERROR: Guid = Guid(u64::MAX);
    pub const UNINITIALIZED: Guid = Guid(u64::MAX - 1);

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Guid(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self == Guid::NULL
    }

    /// NULL, ERROR and UNINITIALIZED never name an object.
    #[inline]
    pub fn is_sentinel(self) -> bool {
        self == Guid::NULL || self == Guid::ERROR || self == Guid::UNINITIALIZED
    }

    pub(crate) fn compose(
        location: DomainId,
        kind: GuidKind,
        reserved: bool,
        counter: u64,
    ) -> Self {
        debug_assert!(location < MAX_DOMAINS);
        debug_assert!(counter <= COUNTER_MASK);
        let raw = ((location as u64 & LOCALITY_MASK) << LOCALITY_SHIFT)
            | ((kind.as_u8() as u64 & KIND_MASK) << KIND_SHIFT)
            | ((reserved as u64) << RESERVED_SHIFT)
            | ((counter & COUNTER_MASK) << COUNTER_SHIFT);
        Guid(raw)
    }

    /// Kind of the named object, or `None` for sentinels and garbage.
    pub fn kind(self) -> Option<GuidKind> {
        if self.is_sentinel() {
            return None;
        }
        GuidKind::from_u8(((self.0 >> KIND_SHIFT) & KIND_MASK) as u8)
    }

    /// Domain that owns the object.
    #[inline]
    pub fn location(self) -> DomainId {
        ((self.0 >> LOCALITY_SHIFT) & LOCALITY_MASK) as DomainId
    }

    /// Whether the GUID was handed out through a reserved range.
    #[inline]
    pub fn is_reserved(self) -> bool {
        (self.0 >> RESERVED_SHIFT) & 1 == 1
    }

    #[inline]
    pub(crate) fn counter(self) -> u64 {
        self.0 & COUNTER_MASK
    }

    pub fn is_event(self) -> bool {
        self.kind().is_some_and(GuidKind::is_event)
    }
}

impl fmt::Debug for Guid {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match *self {
            Guid::NULL => write!(f, "Guid(NULL)"),
            Guid::ERROR => write!(f, "Guid(ERROR)"),
            Guid::UNINITIALIZED => write!(f, "Guid(UNINITIALIZED)"),
            g => write!(f, "Guid({:#018x})", g.0),
        }
    }
}

impl fmt::Display for Guid {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// A contiguous block of reserved GUIDs of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidRange {
    start: Guid,
    count: u64,
}

impl GuidRange {
    pub(crate) fn new(
        start: Guid,
        count: u64,
    ) -> Self {
        GuidRange { start, count }
    }

    #[inline]
    pub fn start(&self) -> Guid {
        self.start
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The `index`-th GUID of the range.
    pub fn nth(
        &self,
        index: u64,
    ) -> Option<Guid> {
        (index < self.count).then(|| Guid(self.start.0 + index))
    }

    pub fn contains(
        &self,
        guid: Guid,
    ) -> bool {
        guid.0 >= self.start.0 && guid.0 < self.start.0 + self.count
    }

    pub fn iter(&self) -> impl Iterator<Item = Guid> + '_ {
        (0..self.count).map(move |i| Guid(self.start.0 + i))
    }
}

/// Selectable provider strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Generational arena; GUIDs are meaningful only inside one domain.
    Ptr,
    /// Sharded map keyed by a monotone counter.
    #[default]
    Counted,
    /// Counted plus reserved ranges and user-chosen labels.
    Labeled,
}

impl ProviderKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ptr" => Some(ProviderKind::Ptr),
            "counted" => Some(ProviderKind::Counted),
            "labeled" | "labelled" => Some(ProviderKind::Labeled),
            _ => None,
        }
    }
}

/// Live-entry counters reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProviderStats {
    pub live: usize,
    pub created: u64,
    pub released: u64,
}

/// Per-domain GUID provider.
///
/// Creation first mints a GUID, then builds the metadata with that GUID,
/// then publishes the entry. A concurrent `resolve` therefore sees either
/// `UnknownGuid` or the fully built object.
#[derive(Debug)]
pub enum GuidProvider {
    Ptr(PtrProvider),
    Counted(CountedProvider),
    Labeled(LabeledProvider),
}

impl GuidProvider {
    pub fn new(
        kind: ProviderKind,
        location: DomainId,
        max_entries: usize,
        allocator: DomainAllocator,
    ) -> Self {
        match kind {
            ProviderKind::Ptr => GuidProvider::Ptr(PtrProvider::new(location, max_entries, allocator)),
            ProviderKind::Counted => {
                GuidProvider::Counted(CountedProvider::new(location, max_entries, allocator))
            },
            ProviderKind::Labeled => {
                GuidProvider::Labeled(LabeledProvider::new(location, max_entries, allocator))
            },
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            GuidProvider::Ptr(_) => ProviderKind::Ptr,
            GuidProvider::Counted(_) => ProviderKind::Counted,
            GuidProvider::Labeled(_) => ProviderKind::Labeled,
        }
    }

    /// Mint a GUID, build its metadata and publish it.
    pub fn create<F>(
        &self,
        kind: GuidKind,
        extra_bytes: usize,
        build: F,
    ) -> Result<(Guid, Metadata)>
    where
        F: FnOnce(Guid) -> Metadata,
    {
        match self {
            GuidProvider::Ptr(p) => p.create(kind, extra_bytes, build),
            GuidProvider::Counted(p) => p.create(kind, extra_bytes, build),
            GuidProvider::Labeled(p) => p.create(kind, extra_bytes, build),
        }
    }

    /// Publish metadata under a caller-chosen GUID from a reserved range.
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
        match self {
            GuidProvider::Labeled(p) => p.create_labeled(guid, mode, extra_bytes, build),
            _ => Err(RuntimeError::InvalidArgument(
                "labeled creation requires the labeled GUID provider".into(),
            )),
        }
    }

    /// Reserve `count` consecutive GUIDs of `kind`.
    pub fn reserve(
        &self,
        count: u64,
        kind: GuidKind,
    ) -> Result<GuidRange> {
        match self {
            GuidProvider::Labeled(p) => p.reserve(count, kind),
            _ => Err(RuntimeError::InvalidArgument(
                "GUID reservation requires the labeled GUID provider".into(),
            )),
        }
    }

    /// Look up the metadata of a live GUID.
    pub fn resolve(
        &self,
        guid: Guid,
    ) -> Result<Metadata> {
        match self {
            GuidProvider::Ptr(p) => p.resolve(guid),
            GuidProvider::Counted(p) => p.resolve(guid),
            GuidProvider::Labeled(p) => p.resolve(guid),
        }
    }

    /// Add a holder to a live entry. Each share needs a matching `release`.
    pub fn share(
        &self,
        guid: Guid,
    ) -> Result<()> {
        match self {
            GuidProvider::Ptr(p) => p.share(guid),
            GuidProvider::Counted(p) => p.share(guid),
            GuidProvider::Labeled(p) => p.share(guid),
        }
    }

    /// Drop one holder. Returns `true` when the entry was freed.
    pub fn release(
        &self,
        guid: Guid,
    ) -> Result<bool> {
        match self {
            GuidProvider::Ptr(p) => p.release(guid),
            GuidProvider::Counted(p) => p.release(guid),
            GuidProvider::Labeled(p) => p.release(guid),
        }
    }

    #[inline]
    pub fn location(
        &self,
        guid: Guid,
    ) -> DomainId {
        guid.location()
    }

    pub fn stats(&self) -> ProviderStats {
        match self {
            GuidProvider::Ptr(p) => p.stats(),
            GuidProvider::Counted(p) => p.stats(),
            GuidProvider::Labeled(p) => p.stats(),
        }
    }

    /// Drop every live entry; used at domain shutdown.
    pub fn clear(&self) -> usize {
        match self {
            GuidProvider::Ptr(p) => p.clear(),
            GuidProvider::Counted(p) => p.clear(),
            GuidProvider::Labeled(p) => p.clear(),
        }
    }
}

/// A published table entry.
#[derive(Debug)]
pub(crate) struct Entry {
    meta: Metadata,
    block: MetaBlock,
    holders: AtomicU32,
}

impl Entry {
    fn new(
        meta: Metadata,
        block: MetaBlock,
    ) -> Self {
        Entry {
            meta,
            block,
            holders: AtomicU32::new(1),
        }
    }

    /// Add a holder unless the entry is already being freed.
    fn retain(&self) -> bool {
        let mut current = self.holders.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.holders.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }

    /// Drop a holder. `Some(true)` means this call dropped the last one.
    fn drop_holder(&self) -> Option<bool> {
        let mut current = self.holders.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match self.holders.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current == 1),
                Err(seen) => current = seen,
            }
        }
    }
}

/// Bytes charged to the allocator for a record of `kind`.
pub(crate) fn footprint(
    kind: GuidKind,
    extra_bytes: usize,
) -> usize {
    let base = match kind {
        GuidKind::Task => std::mem::size_of::<Task>(),
        GuidKind::Template => std::mem::size_of::<TaskTemplate>(),
        GuidKind::DataBlock => std::mem::size_of::<DataBlock>(),
        _ => std::mem::size_of::<Event>(),
    };
    base + std::mem::size_of::<Entry>() + extra_bytes
}
