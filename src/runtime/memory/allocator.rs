//! Metadata allocator interface
//!
//! GUID providers account every metadata record against an allocator owned
//! by the domain. The record itself lives in an `Arc`; the allocator hands
//! out a [`MetaBlock`] describing the space charged for it and takes it
//! back on release.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Metadata allocation error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// Not enough space left to satisfy the request
    OutOfMemory { requested: usize, available: usize },
}

impl fmt::Display for AllocError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            AllocError::OutOfMemory {
                requested,
                available,
            } => write!(f, "out of memory ({requested} requested, {available} available)"),
        }
    }
}

impl std::error::Error for AllocError {}

/// Size and alignment of a metadata record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    size: usize,
    align: usize,
}

impl MemoryLayout {
    /// Create a layout from size and alignment
    ///
    /// # Returns
    /// `Some(MemoryLayout)` if alignment is valid (power of 2), `None` otherwise.
    pub fn from_size_align(
        size: usize,
        align: usize,
    ) -> Option<Self> {
        if align == 0 || !align.is_power_of_two() {
            return None;
        }
        Some(Self {
            size: (size + align - 1) & !(align - 1),
            align,
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn align(&self) -> usize {
        self.align
    }
}

/// Space charged for one metadata record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaBlock {
    offset: usize,
    size: usize,
}

impl MetaBlock {
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Core metadata allocator trait
///
/// # Implementations
/// - `SystemAllocator`: unbounded, only keeps usage counters
/// - `BoundedAllocator`: fixed capacity arena with span reuse
pub trait MetadataAllocator: Send + Sync {
    /// Charge space for a new record
    fn allocate(
        &self,
        layout: MemoryLayout,
    ) -> Result<MetaBlock, AllocError>;

    /// Return space charged by a previous `allocate`
    fn free(
        &self,
        block: MetaBlock,
    );

    /// Bytes currently charged
    fn in_use(&self) -> usize;

    /// Total capacity, `None` when unbounded
    fn capacity(&self) -> Option<usize>;
}

/// Unbounded allocator backed by the process heap
#[derive(Debug, Default)]
pub struct SystemAllocator {
    next: AtomicUsize,
    in_use: AtomicUsize,
}

impl SystemAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataAllocator for SystemAllocator {
    fn allocate(
        &self,
        layout: MemoryLayout,
    ) -> Result<MetaBlock, AllocError> {
        let offset = self.next.fetch_add(layout.size(), Ordering::Relaxed);
        self.in_use.fetch_add(layout.size(), Ordering::Relaxed);
        Ok(MetaBlock {
            offset,
            size: layout.size(),
        })
    }

    fn free(
        &self,
        block: MetaBlock,
    ) {
        self.in_use.fetch_sub(block.size, Ordering::Relaxed);
    }

    fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    fn capacity(&self) -> Option<usize> {
        None
    }
}

#[derive(Debug)]
struct Arena {
    /// Bump pointer for never-used space
    next: usize,
    /// Freed spans available for reuse, unordered
    free: Vec<MetaBlock>,
    in_use: usize,
}

/// Fixed capacity allocator
///
/// Allocates by bumping an offset and reuses freed spans first-fit. A freed
/// span larger than the request is split.
#[derive(Debug)]
pub struct BoundedAllocator {
    capacity: usize,
    arena: Mutex<Arena>,
}

impl BoundedAllocator {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            arena: Mutex::new(Arena {
                next: 0,
                free: Vec::new(),
                in_use: 0,
            }),
        }
    }
}

impl MetadataAllocator for BoundedAllocator {
    fn allocate(
        &self,
        layout: MemoryLayout,
    ) -> Result<MetaBlock, AllocError> {
        let size = layout.size();
        let align = layout.align();
        let mut arena = self.arena.lock();

        let reuse = arena
            .free
            .iter()
            .position(|span| span.offset % align == 0 && span.size >= size);
        if let Some(index) = reuse {
            let span = arena.free.swap_remove(index);
            if span.size > size {
                arena.free.push(MetaBlock {
                    offset: span.offset + size,
                    size: span.size - size,
                });
            }
            arena.in_use += size;
            return Ok(MetaBlock {
                offset: span.offset,
                size,
            });
        }

        let aligned = (arena.next + align - 1) & !(align - 1);
        if aligned + size > self.capacity {
            return Err(AllocError::OutOfMemory {
                requested: size,
                available: self.capacity - arena.in_use,
            });
        }
        arena.next = aligned + size;
        arena.in_use += size;
        Ok(MetaBlock {
            offset: aligned,
            size,
        })
    }

    fn free(
        &self,
        block: MetaBlock,
    ) {
        let mut arena = self.arena.lock();
        arena.in_use -= block.size;
        if block.offset + block.size == arena.next {
            arena.next = block.offset;
        } else {
            arena.free.push(block);
        }
        if arena.in_use == 0 {
            arena.next = 0;
            arena.free.clear();
        }
    }

    fn in_use(&self) -> usize {
        self.arena.lock().in_use
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.capacity)
    }
}
