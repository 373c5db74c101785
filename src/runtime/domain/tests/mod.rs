//! PolicyDomain 单元测试
//!
//! 在单个域上测试任务创建、依赖满足、事件传播、finish 作用域与数据块

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::runtime::comm::Fabric;
use crate::runtime::datablock::AccessMode;
use crate::runtime::domain::{FunctionTable, PolicyDomain, ShutdownSignal};
use crate::runtime::error::RuntimeError;
use crate::runtime::event::{EventKind, EventParams, LATCH_DECR_SLOT};
use crate::runtime::guid::Guid;
use crate::runtime::task::{task_fn, DepCount, TaskBuilder};
use crate::util::config::RuntimeConfig;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

/// A started single-domain setup, stopped on drop.
struct Harness {
    domain: Arc<PolicyDomain>,
}

impl Harness {
    fn new() -> Self {
        let mut config = RuntimeConfig::default();
        config.scheduler.workers = 2;
        let fabric = Arc::new(Fabric::new(1, config.comm.clone()));
        let domain = Arc::new(PolicyDomain::new(
            0,
            &config,
            fabric,
            Arc::new(FunctionTable::new()),
            Arc::new(ShutdownSignal::new()),
        ));
        domain.start().unwrap();
        Harness { domain }
    }

    fn settle(&self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.domain.is_idle() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(self.domain.is_idle(), "domain did not settle");
    }
}

impl Deref for Harness {
    type Target = PolicyDomain;

    fn deref(&self) -> &PolicyDomain {
        &self.domain
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.domain.stop_workers();
        self.domain.stop_comm();
        self.domain.clear();
    }
}

/// Template whose body returns its first dependence.
fn forward(
    d: &PolicyDomain,
    depc: DepCount,
) -> Guid {
    d.template_create(
        "forward",
        task_fn(|_, _, deps| deps.first().map_or(Guid::NULL, |dep| dep.guid)),
        0,
        depc,
    )
    .unwrap()
}

#[cfg(test)]
mod task_tests {
    use super::*;

    #[test]
    fn test_ready_task_runs_and_returns_payload() {
        let d = Harness::new();
        let template = d
            .template_create(
                "byte",
                task_fn(|ctx, params, _| ctx.db_create(vec![params[0] as u8]).unwrap()),
                1,
                DepCount::Fixed(0),
            )
            .unwrap();
        let created = d
            .create_task(
                TaskBuilder::new(template)
                    .params(&[42])
                    .output(EventKind::Sticky),
            )
            .unwrap();

        let payload = d.wait(created.output, TIMEOUT).unwrap().unwrap();
        let view = d.db_acquire(payload, AccessMode::ReadOnly).unwrap();
        assert_eq!(&*view, &[42]);
        drop(view);
        d.settle();
        assert_eq!(d.live_tasks(), 0);
        assert!(matches!(d.task(created.task), Err(RuntimeError::UnknownGuid(_))));
    }

    #[test]
    fn test_parameter_arity_checked() {
        let d = Harness::new();
        let template = forward(&d, DepCount::Fixed(0));
        let err = d
            .create_task(TaskBuilder::new(template).params(&[1]))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ArityMismatch { what: "parameter", .. }));
        assert_eq!(d.live_tasks(), 0);
    }

    #[test]
    fn test_dependence_arity_checked() {
        let d = Harness::new();
        let template = forward(&d, DepCount::Fixed(2));
        let err = d
            .create_task(TaskBuilder::new(template).depv(&[Guid::NULL]))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ArityMismatch { what: "dependence", .. }));
    }

    #[test]
    fn test_runs_only_after_every_slot() {
        let d = Harness::new();
        let template = d
            .template_create(
                "second",
                task_fn(|_, _, deps| deps[1].guid),
                0,
                DepCount::Fixed(2),
            )
            .unwrap();
        let first = d.event_create(EventKind::Once, EventParams::default()).unwrap();
        let second = d.event_create(EventKind::Once, EventParams::default()).unwrap();
        let created = d
            .create_task(
                TaskBuilder::new(template)
                    .depv(&[first, second])
                    .output(EventKind::Sticky),
            )
            .unwrap();

        let block = d.db_create(vec![1, 2, 3]).unwrap();
        d.satisfy(first, Guid::NULL).unwrap();
        assert_eq!(d.wait(created.output, Some(Duration::from_millis(50))).unwrap(), None);
        d.satisfy(second, block).unwrap();
        assert_eq!(d.wait(created.output, TIMEOUT).unwrap(), Some(block));
    }

    #[test]
    fn test_slot_binds_once() {
        let d = Harness::new();
        let template = forward(&d, DepCount::Fixed(1));
        let created = d
            .create_task(TaskBuilder::new(template).output(EventKind::Sticky))
            .unwrap();
        let producer = d.event_create(EventKind::Sticky, EventParams::default()).unwrap();
        let other = d.event_create(EventKind::Sticky, EventParams::default()).unwrap();

        d.add_dependence(producer, created.task, 0, AccessMode::ReadOnly)
            .unwrap();
        let err = d
            .add_dependence(other, created.task, 0, AccessMode::ReadOnly)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::SlotAlreadyBound { slot: 0, .. }));
        let err = d
            .add_dependence(other, created.task, 3, AccessMode::ReadOnly)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::IndexOutOfRange { slot: 3, .. }));

        // The first binding is still the one that counts.
        let block = d.db_create(vec![9]).unwrap();
        d.satisfy(producer, block).unwrap();
        assert_eq!(d.wait(created.output, TIMEOUT).unwrap(), Some(block));
    }

    #[test]
    fn test_deferred_slots_sealed() {
        let d = Harness::new();
        let template = d
            .template_create(
                "count",
                task_fn(|ctx, _, deps| ctx.db_create(vec![deps.len() as u8]).unwrap()),
                0,
                DepCount::Deferred,
            )
            .unwrap();
        let created = d
            .create_task(TaskBuilder::new(template).output(EventKind::Sticky))
            .unwrap();
        let block = d.db_create(vec![0]).unwrap();
        d.add_dependence(Guid::NULL, created.task, 0, AccessMode::Null)
            .unwrap();
        d.add_dependence(block, created.task, 1, AccessMode::ReadOnly)
            .unwrap();
        assert_eq!(d.wait(created.output, Some(Duration::from_millis(50))).unwrap(), None);

        d.seal_dependences(created.task).unwrap();
        let payload = d.wait(created.output, TIMEOUT).unwrap().unwrap();
        assert_eq!(&*d.db_acquire(payload, AccessMode::ReadOnly).unwrap(), &[2]);
    }

    #[test]
    fn test_destroy_waiting_task() {
        let d = Harness::new();
        let template = forward(&d, DepCount::Fixed(1));
        let created = d.create_task(TaskBuilder::new(template)).unwrap();
        assert_eq!(d.live_tasks(), 1);
        d.task_destroy(created.task).unwrap();
        assert_eq!(d.live_tasks(), 0);
        assert!(matches!(
            d.task_destroy(created.task),
            Err(RuntimeError::UnknownGuid(_))
        ));
    }

    #[test]
    fn test_panicking_body_reports_error_payload() {
        let d = Harness::new();
        let template = d
            .template_create(
                "boom",
                task_fn(|_, _, _| panic!("task body failure")),
                0,
                DepCount::Fixed(0),
            )
            .unwrap();
        let created = d
            .create_task(TaskBuilder::new(template).output(EventKind::Sticky))
            .unwrap();
        assert_eq!(d.wait(created.output, TIMEOUT).unwrap(), Some(Guid::ERROR));
        d.settle();
    }

    #[test]
    fn test_create_with_destroyed_producer_fails() {
        let d = Harness::new();
        let template = forward(&d, DepCount::Fixed(1));
        let sticky = d.event_create(EventKind::Sticky, EventParams::default()).unwrap();
        d.event_destroy(sticky).unwrap();
        let live = d.stats().guids.live;

        let err = d
            .create_task(
                TaskBuilder::new(template)
                    .depv(&[sticky])
                    .output(EventKind::Sticky),
            )
            .unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownGuid(guid) if guid == sticky));
        assert_eq!(d.live_tasks(), 0);
        assert_eq!(d.stats().guids.live, live);

        let once = d.event_create(EventKind::Once, EventParams::default()).unwrap();
        d.satisfy(once, Guid::NULL).unwrap();
        assert!(matches!(
            d.create_task(TaskBuilder::new(template).depv(&[once])),
            Err(RuntimeError::UnknownGuid(_))
        ));
    }

    #[test]
    fn test_latch_output_rejected() {
        let d = Harness::new();
        let template = forward(&d, DepCount::Fixed(0));
        let err = d
            .create_task(TaskBuilder::new(template).output(EventKind::Latch))
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArgument(_)));
        assert_eq!(d.live_tasks(), 0);
    }
}

#[cfg(test)]
mod event_tests {
    use super::*;

    #[test]
    fn test_once_notifies_all_then_vanishes() {
        let d = Harness::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let template = d
            .template_create(
                "tick",
                task_fn(move |_, _, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Guid::NULL
                }),
                0,
                DepCount::Fixed(1),
            )
            .unwrap();
        let once = d.event_create(EventKind::Once, EventParams::default()).unwrap();
        for _ in 0..3 {
            d.create_task(TaskBuilder::new(template).depv(&[once]))
                .unwrap();
        }
        d.satisfy(once, Guid::NULL).unwrap();
        assert!(matches!(d.satisfy(once, Guid::NULL), Err(RuntimeError::UnknownGuid(_))));
        d.settle();
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_sticky_replays_to_late_dependents() {
        let d = Harness::new();
        let template = forward(&d, DepCount::Fixed(1));
        let sticky = d.event_create(EventKind::Sticky, EventParams::default()).unwrap();
        let early = d
            .create_task(
                TaskBuilder::new(template)
                    .depv(&[sticky])
                    .output(EventKind::Sticky),
            )
            .unwrap();
        let block = d.db_create(vec![5]).unwrap();
        d.satisfy(sticky, block).unwrap();
        let late = d
            .create_task(
                TaskBuilder::new(template)
                    .depv(&[sticky])
                    .output(EventKind::Sticky),
            )
            .unwrap();
        assert_eq!(d.wait(early.output, TIMEOUT).unwrap(), Some(block));
        assert_eq!(d.wait(late.output, TIMEOUT).unwrap(), Some(block));
        assert!(matches!(
            d.satisfy(sticky, block),
            Err(RuntimeError::EventAlreadySatisfied(_))
        ));
        d.event_destroy(sticky).unwrap();
    }

    #[test]
    fn test_destroy_with_registered_dependent_is_busy() {
        let d = Harness::new();
        let template = forward(&d, DepCount::Fixed(1));
        let sticky = d.event_create(EventKind::Sticky, EventParams::default()).unwrap();
        d.create_task(TaskBuilder::new(template).depv(&[sticky]))
            .unwrap();
        assert!(matches!(d.event_destroy(sticky), Err(RuntimeError::DestroyBusy(_))));
        d.satisfy(sticky, Guid::NULL).unwrap();
        d.settle();
        d.event_destroy(sticky).unwrap();
    }

    #[test]
    fn test_shared_event_freed_by_last_holder() {
        let d = Harness::new();
        let sticky = d.event_create(EventKind::Sticky, EventParams::default()).unwrap();
        d.share(sticky).unwrap();
        let live = d.stats().guids.live;

        d.event_destroy(sticky).unwrap();
        assert_eq!(d.stats().guids.live, live);
        // The remaining holder still owns a working event.
        d.satisfy(sticky, Guid::NULL).unwrap();
        assert_eq!(d.wait(sticky, TIMEOUT).unwrap(), Some(Guid::NULL));

        d.event_destroy(sticky).unwrap();
        assert_eq!(d.stats().guids.live, live - 1);
        assert!(matches!(d.event_destroy(sticky), Err(RuntimeError::UnknownGuid(_))));
    }

    #[test]
    fn test_destroyed_task_leaves_producer_idle() {
        let d = Harness::new();
        let template = forward(&d, DepCount::Fixed(2));
        let sticky = d.event_create(EventKind::Sticky, EventParams::default()).unwrap();
        let created = d
            .create_task(TaskBuilder::new(template).depv(&[sticky, Guid::UNINITIALIZED]))
            .unwrap();
        assert!(matches!(d.event_destroy(sticky), Err(RuntimeError::DestroyBusy(_))));

        d.task_destroy(created.task).unwrap();
        d.event_destroy(sticky).unwrap();
        assert_eq!(d.live_tasks(), 0);
    }

    #[test]
    fn test_idempotent_ignores_repeats() {
        let d = Harness::new();
        let event = d
            .event_create(EventKind::Idempotent, EventParams::default())
            .unwrap();
        let first = d.db_create(vec![1]).unwrap();
        let second = d.db_create(vec![2]).unwrap();
        d.satisfy(event, first).unwrap();
        d.satisfy(event, second).unwrap();
        assert_eq!(d.wait(event, TIMEOUT).unwrap(), Some(first));
    }

    #[test]
    fn test_event_chains_to_event() {
        let d = Harness::new();
        let source = d.event_create(EventKind::Once, EventParams::default()).unwrap();
        let sink = d.event_create(EventKind::Sticky, EventParams::default()).unwrap();
        d.add_dependence(source, sink, 0, AccessMode::Null).unwrap();
        let block = d.db_create(vec![3]).unwrap();
        d.satisfy(source, block).unwrap();
        assert_eq!(d.wait(sink, TIMEOUT).unwrap(), Some(block));
    }

    #[test]
    fn test_latch_fires_at_zero() {
        let d = Harness::new();
        let latch = d
            .event_create(
                EventKind::Latch,
                EventParams {
                    latch_count: 2,
                    ..EventParams::default()
                },
            )
            .unwrap();
        let sink = d.event_create(EventKind::Sticky, EventParams::default()).unwrap();
        d.add_dependence(latch, sink, 0, AccessMode::Null).unwrap();
        d.satisfy_slot(latch, Guid::NULL, LATCH_DECR_SLOT).unwrap();
        assert_eq!(d.wait(sink, Some(Duration::from_millis(20))).unwrap(), None);
        d.satisfy_slot(latch, Guid::NULL, LATCH_DECR_SLOT).unwrap();
        assert_eq!(d.wait(sink, TIMEOUT).unwrap(), Some(Guid::NULL));
    }

    #[test]
    fn test_satisfy_rejects_non_event() {
        let d = Harness::new();
        let block = d.db_create(Vec::new()).unwrap();
        assert!(matches!(
            d.satisfy(block, Guid::NULL),
            Err(RuntimeError::WrongKind { .. })
        ));
    }
}

#[cfg(test)]
mod finish_tests {
    use super::*;

    /// Binary tree of depth 2 under a finish root: 7 tasks in total.
    #[test]
    fn test_finish_waits_for_whole_subtree() {
        let d = Harness::new();
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        let template = d
            .template_create(
                "node",
                task_fn(move |ctx, params, _| {
                    let (depth, template) = (params[0], Guid::from_raw(params[1]));
                    if depth < 2 {
                        for _ in 0..2 {
                            ctx.create_task(TaskBuilder::new(template).params(&[depth + 1, params[1]]))
                                .unwrap();
                        }
                    } else {
                        thread::sleep(Duration::from_millis(10));
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    Guid::NULL
                }),
                2,
                DepCount::Fixed(0),
            )
            .unwrap();
        let root = d
            .create_task(
                TaskBuilder::new(template)
                    .params(&[0, template.raw()])
                    .output(EventKind::Sticky)
                    .finish(),
            )
            .unwrap();
        assert_eq!(d.wait(root.output, TIMEOUT).unwrap(), Some(Guid::NULL));
        assert_eq!(done.load(Ordering::SeqCst), 7);
        d.settle();
    }

    #[test]
    fn test_destroyed_finish_task_closes_scope() {
        let d = Harness::new();
        let template = forward(&d, DepCount::Fixed(1));
        let created = d
            .create_task(
                TaskBuilder::new(template)
                    .output(EventKind::Sticky)
                    .finish(),
            )
            .unwrap();
        d.task_destroy(created.task).unwrap();
        assert_eq!(d.wait(created.output, TIMEOUT).unwrap(), Some(Guid::NULL));
    }
}

#[cfg(test)]
mod datablock_tests {
    use super::*;

    #[test]
    fn test_read_only_view_refuses_writes() {
        let d = Harness::new();
        let block = d.db_create_zeroed(4).unwrap();
        let mut view = d.db_acquire(block, AccessMode::ReadOnly).unwrap();
        assert!(matches!(view.as_mut_slice(), Err(RuntimeError::ModeViolation(_))));
        drop(view);

        let mut view = d.db_acquire(block, AccessMode::ReadWrite).unwrap();
        view.as_mut_slice().unwrap()[0] = 7;
        view.release();
        assert_eq!(&*d.db_acquire(block, AccessMode::Const).unwrap(), &[7, 0, 0, 0]);
    }

    #[test]
    fn test_local_clone_is_independent() {
        let d = Harness::new();
        let block = d.db_create(vec![1, 2]).unwrap();
        let clone = d.db_clone_to(block, 0).unwrap();
        assert_ne!(clone, block);
        assert_eq!(d.datablock(clone).unwrap().origin(), block);

        d.db_acquire(clone, AccessMode::ReadWrite)
            .unwrap()
            .as_mut_slice()
            .unwrap()[0] = 9;
        assert_eq!(&*d.db_acquire(block, AccessMode::ReadOnly).unwrap(), &[1, 2]);

        d.db_destroy(clone).unwrap();
        assert!(d.db_acquire(block, AccessMode::ReadOnly).is_ok());
        assert!(matches!(
            d.db_acquire(clone, AccessMode::ReadOnly),
            Err(RuntimeError::UnknownGuid(_))
        ));
    }
}

#[cfg(test)]
mod shutdown_tests {
    use super::*;

    #[test]
    fn test_external_creation_refused_after_shutdown_begins() {
        let d = Harness::new();
        let template = forward(&d, DepCount::Fixed(0));
        d.begin_shutdown();
        assert!(!d.is_accepting());
        assert!(matches!(
            d.create_task(TaskBuilder::new(template)),
            Err(RuntimeError::ShuttingDown)
        ));
    }

    #[test]
    fn test_task_can_request_shutdown() {
        let d = Harness::new();
        let template = d
            .template_create(
                "stop",
                task_fn(|ctx, _, _| {
                    ctx.shutdown();
                    Guid::NULL
                }),
                0,
                DepCount::Fixed(0),
            )
            .unwrap();
        d.create_task(TaskBuilder::new(template)).unwrap();
        assert!(d.signal.wait(TIMEOUT));
    }
}
