//! GUID 单元测试
//!
//! 测试 GUID 位布局、三种 provider 的创建/解析/释放与标签创建

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use crate::runtime::datablock::DataBlock;
use crate::runtime::error::RuntimeError;
use crate::runtime::guid::{
    Guid, GuidKind, GuidProvider, LabelMode, ProviderKind, COUNTER_MASK, MAX_DOMAINS,
};
use crate::runtime::memory::{AllocatorKind, DomainAllocator};
use crate::runtime::metadata::Metadata;

fn provider(kind: ProviderKind) -> GuidProvider {
    GuidProvider::new(kind, 3, 1024, DomainAllocator::default())
}

fn block(guid: Guid) -> Metadata {
    Metadata::DataBlock(Arc::new(DataBlock::new(guid, vec![0; 8], Guid::NULL)))
}

const ALL: [ProviderKind; 3] = [ProviderKind::Ptr, ProviderKind::Counted, ProviderKind::Labeled];

#[cfg(test)]
mod layout_tests {
    use super::*;

    #[test]
    fn test_fields_decode() {
        let guid = Guid::compose(MAX_DOMAINS - 1, GuidKind::EventSticky, true, COUNTER_MASK);
        assert_eq!(guid.location(), MAX_DOMAINS - 1);
        assert_eq!(guid.kind(), Some(GuidKind::EventSticky));
        assert!(guid.is_reserved());
        assert!(guid.is_event());
        assert_eq!(guid.counter(), COUNTER_MASK);

        let task = Guid::compose(5, GuidKind::Task, false, 1);
        assert_eq!(task.location(), 5);
        assert!(!task.is_reserved());
        assert!(!task.is_event());
    }

    #[test]
    fn test_sentinels_have_no_kind() {
        for sentinel in [Guid::NULL, Guid::ERROR, Guid::UNINITIALIZED] {
            assert!(sentinel.is_sentinel());
            assert_eq!(sentinel.kind(), None);
        }
        assert!(Guid::NULL.is_null());
        assert_eq!(Guid::default(), Guid::NULL);
    }

    #[test]
    fn test_kind_codes() {
        assert_eq!(GuidKind::DataBlock.as_u8(), 2);
        assert_eq!(GuidKind::Task.as_u8(), 3);
        assert_eq!(GuidKind::Template.as_u8(), 4);
        assert_eq!(GuidKind::EventOnce.as_u8(), 17);
        assert_eq!(GuidKind::EventChannel.as_u8(), 21);
        assert_eq!(GuidKind::from_u8(9), None);
        assert!(!GuidKind::Template.is_event());
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!(ProviderKind::parse("PTR"), Some(ProviderKind::Ptr));
        assert_eq!(ProviderKind::parse("labelled"), Some(ProviderKind::Labeled));
        assert_eq!(ProviderKind::parse("hash"), None);
    }
}

#[cfg(test)]
mod provider_tests {
    use super::*;

    #[test]
    fn test_create_resolve_release() {
        for kind in ALL {
            let p = provider(kind);
            let (guid, _) = p.create(GuidKind::DataBlock, 8, block).unwrap();
            assert_eq!(guid.location(), 3, "{kind:?}");
            assert_eq!(guid.kind(), Some(GuidKind::DataBlock));
            assert_eq!(p.resolve(guid).unwrap().guid(), guid);

            assert!(p.release(guid).unwrap());
            assert!(
                matches!(p.resolve(guid), Err(RuntimeError::UnknownGuid(_))),
                "{kind:?}"
            );
            assert!(matches!(p.release(guid), Err(RuntimeError::UnknownGuid(_))));
        }
    }

    #[test]
    fn test_shared_entry_freed_by_last_holder() {
        for kind in ALL {
            let p = provider(kind);
            let (guid, _) = p.create(GuidKind::DataBlock, 0, block).unwrap();
            p.share(guid).unwrap();
            assert!(!p.release(guid).unwrap());
            assert!(p.resolve(guid).is_ok());
            assert!(p.release(guid).unwrap());
            assert!(p.resolve(guid).is_err());
        }
    }

    #[test]
    fn test_released_guid_not_revived_by_reuse() {
        let p = provider(ProviderKind::Ptr);
        let (old, _) = p.create(GuidKind::DataBlock, 0, block).unwrap();
        p.release(old).unwrap();
        let (new, _) = p.create(GuidKind::DataBlock, 0, block).unwrap();
        assert_ne!(old, new);
        assert!(matches!(p.resolve(old), Err(RuntimeError::UnknownGuid(_))));
        assert!(p.resolve(new).is_ok());
    }

    #[test]
    fn test_ptr_slots_spread_over_shards() {
        let p = provider(ProviderKind::Ptr);
        let guids: Vec<_> = (0..32)
            .map(|_| p.create(GuidKind::DataBlock, 0, block).unwrap().0)
            .collect();
        let shards: HashSet<_> = guids.iter().map(|g| (g.counter() & 0xffff_ffff) % 16).collect();
        assert_eq!(shards.len(), 16);
        for guid in &guids {
            assert!(p.release(*guid).unwrap());
        }
        assert_eq!(p.stats().live, 0);
        assert_eq!(p.stats().released, 32);
    }

    #[test]
    fn test_ptr_table_limit() {
        let p = GuidProvider::new(ProviderKind::Ptr, 0, 2, DomainAllocator::default());
        let (first, _) = p.create(GuidKind::DataBlock, 0, block).unwrap();
        p.create(GuidKind::DataBlock, 0, block).unwrap();
        assert!(matches!(
            p.create(GuidKind::DataBlock, 0, block),
            Err(RuntimeError::GuidTableFull(_))
        ));
        p.release(first).unwrap();
        assert!(p.create(GuidKind::DataBlock, 0, block).is_ok());
    }

    #[test]
    fn test_table_limit() {
        let p = GuidProvider::new(ProviderKind::Counted, 0, 2, DomainAllocator::default());
        p.create(GuidKind::DataBlock, 0, block).unwrap();
        p.create(GuidKind::DataBlock, 0, block).unwrap();
        assert!(matches!(
            p.create(GuidKind::DataBlock, 0, block),
            Err(RuntimeError::GuidTableFull(_))
        ));
    }

    #[test]
    fn test_bounded_allocator_exhaustion() {
        let allocator = DomainAllocator::new(AllocatorKind::Bounded, 256);
        let p = GuidProvider::new(ProviderKind::Counted, 0, 1024, allocator);
        let err = p.create(GuidKind::DataBlock, 4096, block).unwrap_err();
        assert!(matches!(err, RuntimeError::OutOfMetadata { .. }));
        assert_eq!(p.stats().live, 0);
    }

    #[test]
    fn test_clear_drops_everything() {
        let p = provider(ProviderKind::Counted);
        for _ in 0..5 {
            p.create(GuidKind::DataBlock, 0, block).unwrap();
        }
        assert_eq!(p.stats().live, 5);
        assert_eq!(p.clear(), 5);
        assert_eq!(p.stats().live, 0);
    }

    #[test]
    fn test_concurrent_creates_are_unique() {
        for kind in ALL {
            let p = Arc::new(provider(kind));
            let barrier = Arc::new(Barrier::new(4));
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let p = Arc::clone(&p);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        (0..100)
                            .map(|_| p.create(GuidKind::DataBlock, 0, block).unwrap().0)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            let mut seen = HashSet::new();
            for handle in handles {
                for guid in handle.join().unwrap() {
                    assert!(seen.insert(guid), "{kind:?} minted {guid} twice");
                }
            }
            assert_eq!(p.stats().live, 400);
        }
    }
}

#[cfg(test)]
mod labeled_tests {
    use super::*;

    #[test]
    fn test_reserve_requires_labeled_provider() {
        let p = provider(ProviderKind::Counted);
        assert!(matches!(
            p.reserve(4, GuidKind::EventSticky),
            Err(RuntimeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_reserved_range() {
        let p = provider(ProviderKind::Labeled);
        let range = p.reserve(4, GuidKind::DataBlock).unwrap();
        assert_eq!(range.len(), 4);
        let guids: Vec<_> = range.iter().collect();
        assert!(guids.iter().all(|g| g.is_reserved() && g.location() == 3));
        assert_eq!(range.nth(3), Some(guids[3]));
        assert_eq!(range.nth(4), None);
        assert!(range.contains(guids[0]));

        let next = p.reserve(1, GuidKind::DataBlock).unwrap();
        assert!(!range.contains(next.start()));
    }

    #[test]
    fn test_check_mode_rejects_live_label() {
        let p = provider(ProviderKind::Labeled);
        let guid = p.reserve(1, GuidKind::DataBlock).unwrap().start();
        p.create_labeled(guid, LabelMode::Check, 0, block).unwrap();
        assert!(matches!(
            p.create_labeled(guid, LabelMode::Check, 0, block),
            Err(RuntimeError::GuidExists(_))
        ));
        p.release(guid).unwrap();
        p.create_labeled(guid, LabelMode::Check, 0, block).unwrap();
    }

    #[test]
    fn test_block_mode_waits_for_release() {
        let p = Arc::new(provider(ProviderKind::Labeled));
        let guid = p.reserve(1, GuidKind::DataBlock).unwrap().start();
        p.create_labeled(guid, LabelMode::Check, 0, block).unwrap();

        let waiter = {
            let p = Arc::clone(&p);
            thread::spawn(move || p.create_labeled(guid, LabelMode::Block, 0, block).is_ok())
        };
        thread::sleep(std::time::Duration::from_millis(20));
        p.release(guid).unwrap();
        assert!(waiter.join().unwrap());
        assert!(p.resolve(guid).is_ok());
    }

    #[test]
    fn test_unreserved_label_rejected() {
        let p = provider(ProviderKind::Labeled);
        let minted = Guid::compose(3, GuidKind::DataBlock, false, 99);
        assert!(matches!(
            p.create_labeled(minted, LabelMode::Check, 0, block),
            Err(RuntimeError::InvalidArgument(_))
        ));
        let foreign = Guid::compose(4, GuidKind::DataBlock, true, 1);
        assert!(p.create_labeled(foreign, LabelMode::Check, 0, block).is_err());
    }
}
