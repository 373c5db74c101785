//! Memory 单元测试
//!
//! 测试域分配器的选择与记账

use crate::runtime::error::RuntimeError;
use crate::runtime::memory::{AllocatorKind, DomainAllocator};

#[cfg(test)]
mod domain_allocator_tests {
    use super::*;

    #[test]
    fn test_default_is_system() {
        let allocator = DomainAllocator::default();
        assert_eq!(allocator.kind(), AllocatorKind::System);
        assert_eq!(allocator.capacity(), None);
    }

    #[test]
    fn test_allocate_rounds_to_sixteen() {
        let allocator = DomainAllocator::new(AllocatorKind::System, 0);
        let block = allocator.allocate(20).unwrap();
        assert_eq!(block.size(), 32);
        assert_eq!(allocator.in_use(), 32);
        allocator.free(block);
        assert_eq!(allocator.in_use(), 0);
    }

    #[test]
    fn test_bounded_exhaustion_maps_to_out_of_metadata() {
        let allocator = DomainAllocator::new(AllocatorKind::Bounded, 64);
        let _a = allocator.allocate(64).unwrap();
        match allocator.allocate(16) {
            Err(RuntimeError::OutOfMetadata { requested, .. }) => assert_eq!(requested, 16),
            other => panic!("expected OutOfMetadata, got {other:?}"),
        }
    }

    #[test]
    fn test_clones_share_accounting() {
        let allocator = DomainAllocator::new(AllocatorKind::Bounded, 128);
        let twin = allocator.clone();
        let block = allocator.allocate(16).unwrap();
        assert_eq!(twin.in_use(), 16);
        twin.free(block);
        assert_eq!(allocator.in_use(), 0);
    }
}
