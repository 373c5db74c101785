//! Scheduler 单元测试
//!
//! 测试工作堆、窃取与工作线程调度行为


use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::runtime::guid::{Guid, GuidKind};
use crate::runtime::scheduler::{Scheduler, SchedulerConfig, SchedulingStrategy};
use crate::runtime::task::{SchedHint, TaskPriority};

fn task(n: u64) -> Guid {
    Guid::compose(0, GuidKind::Task, false, n)
}

fn config(workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        workers,
        strategy: SchedulingStrategy::Lifo,
        steal_batch: 2,
        idle_timeout_us: 200,
    }
}

#[cfg(test)]
mod scheduler_tests {
    use super::*;

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert!(config.workers > 0);
        assert_eq!(config.steal_batch, 4);
        assert_eq!(config.idle_timeout(), Duration::from_micros(1000));
    }

    #[test]
    fn test_zero_workers_clamped_to_one() {
        let scheduler = Scheduler::new(0, config(0));
        assert_eq!(scheduler.num_workers(), 1);
    }

    #[test]
    fn test_give_and_take_without_workers() {
        let scheduler = Scheduler::new(0, config(2));
        scheduler.give(task(1), SchedHint::default());
        scheduler.give(task(2), SchedHint::default());
        assert_eq!(scheduler.queued(), 2);

        let mut seen = HashSet::new();
        while let Some(t) = scheduler.take(0) {
            seen.insert(t);
        }
        assert_eq!(seen, HashSet::from([task(1), task(2)]));
        assert_eq!(scheduler.stats().scheduled, 2);
    }

    #[test]
    fn test_worker_affinity_respected() {
        let scheduler = Scheduler::new(0, config(4));
        let hint = SchedHint {
            affinity: crate::runtime::task::Affinity::Worker(3),
            ..SchedHint::default()
        };
        scheduler.give(task(9), hint);
        assert_eq!(scheduler.stealer.pile(3).len(), 1);
    }

    #[test]
    fn test_workers_run_every_task_once() {
        let scheduler = Arc::new(Scheduler::new(0, config(4)));
        let ran = Arc::new(Mutex::new(Vec::new()));
        {
            let ran = Arc::clone(&ran);
            scheduler
                .start(move |_, t| ran.lock().push(t))
                .unwrap();
        }
        for n in 1..=200 {
            scheduler.give(task(n), SchedHint {
                priority: TaskPriority::Normal,
                ..SchedHint::default()
            });
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        while ran.lock().len() < 200 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        let leftover = scheduler.stop();
        assert!(leftover.is_empty());

        let ran = ran.lock();
        assert_eq!(ran.len(), 200);
        let unique: HashSet<_> = ran.iter().copied().collect();
        assert_eq!(unique.len(), 200);
        assert_eq!(scheduler.stats().completed, 200);
    }

    #[test]
    fn test_stop_returns_unrun_tasks() {
        let scheduler = Scheduler::new(0, config(1));
        scheduler.give(task(5), SchedHint::default());
        assert_eq!(scheduler.stop(), vec![task(5)]);
        assert!(!scheduler.is_running());
    }
}
