//! Metadata memory accounting
//!
//! Each policy domain owns one [`DomainAllocator`]; its GUID provider charges
//! every task, template, event and data-block record against it. The
//! allocator variant is fixed when the domain is built.

mod allocator;

pub use allocator::{
    AllocError, BoundedAllocator, MemoryLayout, MetaBlock, MetadataAllocator, SystemAllocator,
};

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::RuntimeError;

/// Allocator variant selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorKind {
    #[default]
    System,
    Bounded,
}

/// The allocator a domain was built with
#[derive(Debug, Clone)]
pub enum DomainAllocator {
    System(Arc<SystemAllocator>),
    Bounded(Arc<BoundedAllocator>),
}

impl DomainAllocator {
    pub fn new(
        kind: AllocatorKind,
        capacity_bytes: usize,
    ) -> Self {
        match kind {
            AllocatorKind::System => DomainAllocator::System(Arc::new(SystemAllocator::new())),
            AllocatorKind::Bounded => {
                DomainAllocator::Bounded(Arc::new(BoundedAllocator::with_capacity(capacity_bytes)))
            },
        }
    }

    pub fn kind(&self) -> AllocatorKind {
        match self {
            DomainAllocator::System(_) => AllocatorKind::System,
            DomainAllocator::Bounded(_) => AllocatorKind::Bounded,
        }
    }

    fn as_dyn(&self) -> &dyn MetadataAllocator {
        match self {
            DomainAllocator::System(a) => a.as_ref(),
            DomainAllocator::Bounded(a) => a.as_ref(),
        }
    }

    /// Charge `bytes` of metadata.
    pub fn allocate(
        &self,
        bytes: usize,
    ) -> Result<MetaBlock, RuntimeError> {
        let layout = MemoryLayout::from_size_align(bytes.max(1), 16)
            .ok_or(RuntimeError::InvalidArgument("bad metadata layout".into()))?;
        self.as_dyn().allocate(layout).map_err(RuntimeError::from)
    }

    pub fn free(
        &self,
        block: MetaBlock,
    ) {
        self.as_dyn().free(block)
    }

    pub fn in_use(&self) -> usize {
        self.as_dyn().in_use()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.as_dyn().capacity()
    }
}

impl Default for DomainAllocator {
    fn default() -> Self {
        Self::new(AllocatorKind::System, 0)
    }
}

impl From<AllocError> for RuntimeError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::OutOfMemory {
                requested,
                available,
            } => RuntimeError::OutOfMetadata {
                requested,
                available,
            },
        }
    }
}

#[cfg(test)]
mod tests;
