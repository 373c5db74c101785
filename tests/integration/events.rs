//! Event variants seen through the runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use flowrt::{
    task_fn, AccessMode, DepCount, EventKind, EventParams, Guid, RuntimeError, TaskBuilder,
    LATCH_DECR_SLOT, LATCH_INCR_SLOT,
};
use rayon::prelude::*;

use crate::common::{payload, runtime, settle};

#[test]
fn test_sticky_replays_to_every_dependent() {
    let rt = runtime(1, 4);
    let domain = rt.root();
    let seen = Arc::new(AtomicUsize::new(0));
    let block = domain.db_create(vec![7]).unwrap();
    let counter = Arc::clone(&seen);
    let template = domain
        .template_create(
            "observe",
            task_fn(move |_, params, deps| {
                if deps[0].guid == Guid::from_raw(params[0]) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Guid::NULL
            }),
            1,
            DepCount::Fixed(1),
        )
        .unwrap();
    let sticky = domain.event_create(EventKind::Sticky, EventParams::default()).unwrap();

    let spawn = |n: usize| {
        (0..n).into_par_iter().for_each(|_| {
            domain
                .create_task(
                    TaskBuilder::new(template)
                        .params(&[block.raw()])
                        .depv(&[sticky]),
                )
                .unwrap();
        })
    };
    spawn(100);
    domain.satisfy(sticky, block).unwrap();
    spawn(100);

    settle(&rt);
    assert_eq!(seen.load(Ordering::SeqCst), 200);
    domain.event_destroy(sticky).unwrap();
    assert!(matches!(
        domain.satisfy(sticky, block),
        Err(RuntimeError::UnknownGuid(_))
    ));
}

#[test]
fn test_once_consumed_by_all_then_invalid() {
    let rt = runtime(1, 2);
    let domain = rt.root();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let template = domain
        .template_create(
            "consume",
            task_fn(move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Guid::NULL
            }),
            0,
            DepCount::Fixed(1),
        )
        .unwrap();
    let once = domain.event_create(EventKind::Once, EventParams::default()).unwrap();
    for _ in 0..8 {
        domain
            .create_task(TaskBuilder::new(template).depv(&[once]))
            .unwrap();
    }
    domain.satisfy(once, Guid::NULL).unwrap();
    assert!(matches!(domain.satisfy(once, Guid::NULL), Err(RuntimeError::UnknownGuid(_))));
    assert!(matches!(
        domain.event_destroy(once),
        Err(RuntimeError::UnknownGuid(_))
    ));
    settle(&rt);
    assert_eq!(runs.load(Ordering::SeqCst), 8);
}

#[test]
fn test_channel_pairs_producers_with_consumers() {
    let rt = runtime(1, 2);
    let domain = rt.root();
    let template = domain
        .template_create(
            "take",
            task_fn(|_, _, deps| deps[0].guid),
            0,
            DepCount::Fixed(1),
        )
        .unwrap();
    let channel = domain
        .event_create(
            EventKind::Channel,
            EventParams {
                channel_capacity: 2,
                ..EventParams::default()
            },
        )
        .unwrap();
    let first = domain.db_create(vec![1]).unwrap();
    let second = domain.db_create(vec![2]).unwrap();
    let third = domain.db_create(vec![3]).unwrap();

    domain.satisfy(channel, first).unwrap();
    domain.satisfy(channel, second).unwrap();
    assert!(matches!(
        domain.satisfy(channel, third),
        Err(RuntimeError::ChannelFull(_))
    ));
    assert!(matches!(domain.event_destroy(channel), Err(RuntimeError::DestroyBusy(_))));

    let take = || {
        domain
            .create_task(
                TaskBuilder::new(template)
                    .depv(&[channel])
                    .output(EventKind::Sticky),
            )
            .unwrap()
            .output
    };
    // Buffered payloads come out in order.
    assert_eq!(payload(&rt, take()), first);
    assert_eq!(payload(&rt, take()), second);

    // A parked getter is served by the next put.
    let parked = take();
    domain.satisfy(channel, third).unwrap();
    assert_eq!(payload(&rt, parked), third);
    settle(&rt);
    domain.event_destroy(channel).unwrap();
}

#[test]
fn test_latch_aggregates_producers() {
    let rt = runtime(1, 4);
    let domain = rt.root();
    let latch = domain
        .event_create(
            EventKind::Latch,
            EventParams {
                latch_count: 1,
                ..EventParams::default()
            },
        )
        .unwrap();
    let done = domain.event_create(EventKind::Sticky, EventParams::default()).unwrap();
    domain.add_dependence(latch, done, 0, AccessMode::Null).unwrap();

    let template = domain
        .template_create(
            "arrive",
            task_fn(|ctx, params, _| {
                ctx.satisfy_slot(Guid::from_raw(params[0]), Guid::NULL, LATCH_DECR_SLOT)
                    .unwrap();
                Guid::NULL
            }),
            1,
            DepCount::Fixed(0),
        )
        .unwrap();
    for _ in 0..50 {
        domain
            .satisfy_slot(latch, Guid::NULL, LATCH_INCR_SLOT)
            .unwrap();
        domain
            .create_task(TaskBuilder::new(template).params(&[latch.raw()]))
            .unwrap();
    }
    assert_eq!(rt.wait(done, Some(std::time::Duration::from_millis(50))).unwrap(), None);
    // Drop the initial count once every producer is registered.
    domain
        .satisfy_slot(latch, Guid::NULL, LATCH_DECR_SLOT)
        .unwrap();
    assert_eq!(payload(&rt, done), Guid::NULL);
}

#[test]
fn test_labeled_event_found_by_reserved_guid() {
    let mut cfg = crate::common::config(1, 2);
    cfg.guid.provider = flowrt::ProviderKind::Labeled;
    let rt = flowrt::Runtime::new(cfg).unwrap();
    let domain = rt.root();
    let range = domain.reserve(2, flowrt::GuidKind::EventSticky).unwrap();
    let label = range.nth(1).unwrap();
    domain
        .event_create_labeled(label, flowrt::LabelMode::Check, EventKind::Sticky, EventParams::default())
        .unwrap();
    assert!(matches!(
        domain.event_create_labeled(label, flowrt::LabelMode::Check, EventKind::Sticky, EventParams::default()),
        Err(RuntimeError::GuidExists(_))
    ));
    assert!(matches!(
        domain.event_create_labeled(label, flowrt::LabelMode::Check, EventKind::Once, EventParams::default()),
        Err(RuntimeError::WrongKind { .. })
    ));
    let block = domain.db_create(vec![4]).unwrap();
    domain.satisfy(label, block).unwrap();
    assert_eq!(payload(&rt, label), block);
}
