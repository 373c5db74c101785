//! Task scheduler for a policy domain
//!
//! Each domain runs a fixed set of worker threads. Runnable task GUIDs are
//! placed on per-worker workpiles; an idle worker first drains its own pile,
//! then steals, then parks on a condition variable until new work arrives or
//! the idle timeout elapses.

pub mod queue;
pub mod work_stealer;

#[cfg(test)]
mod tests;

pub use queue::{SchedulingStrategy, Workpile};
pub use work_stealer::{StealStats, WorkStealer};

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use super::error::{Result, RuntimeError};
use super::guid::{DomainId, Guid};
use super::task::{Affinity, SchedHint};

thread_local! {
    static CURRENT_WORKER: Cell<Option<(DomainId, usize)>> = const { Cell::new(None) };
}

/// Domain and worker index of the calling thread, if it is a worker.
pub fn current_worker() -> Option<(DomainId, usize)> {
    CURRENT_WORKER.with(Cell::get)
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_steal_batch() -> usize {
    4
}

fn default_idle_timeout_us() -> u64 {
    1000
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of worker threads per domain.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Order in which a worker drains its own pile.
    #[serde(default)]
    pub strategy: SchedulingStrategy,
    /// Tasks taken per steal.
    #[serde(default = "default_steal_batch")]
    pub steal_batch: usize,
    /// Longest an idle worker parks before rechecking.
    #[serde(default = "default_idle_timeout_us")]
    pub idle_timeout_us: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            strategy: SchedulingStrategy::default(),
            steal_batch: default_steal_batch(),
            idle_timeout_us: default_idle_timeout_us(),
        }
    }
}

impl SchedulerConfig {
    #[inline]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_micros(self.idle_timeout_us)
    }
}

/// Scheduler statistics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Total tasks handed to the scheduler.
    pub tasks_scheduled: AtomicUsize,
    /// Total tasks executed.
    pub tasks_completed: AtomicUsize,
    /// Total execution time in microseconds.
    pub total_exec_time_us: AtomicUsize,
    /// Tasks executing right now.
    pub running: AtomicUsize,
    /// Peak number of concurrently running tasks.
    pub peak_parallelism: AtomicUsize,
}

impl SchedulerStats {
    /// Record a scheduled task.
    #[inline]
    pub fn record_scheduled(&self) {
        self.tasks_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_started(&self) {
        let now = self.running.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_parallelism.fetch_max(now, Ordering::Relaxed);
    }

    /// Record a completed task.
    #[inline]
    fn record_completed(
        &self,
        duration_us: usize,
    ) {
        self.running.fetch_sub(1, Ordering::Relaxed);
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        self.total_exec_time_us
            .fetch_add(duration_us, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the counters, for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub scheduled: usize,
    pub completed: usize,
    pub exec_time_us: usize,
    pub peak_parallelism: usize,
    pub steals: usize,
    pub steal_failures: usize,
    pub steal_success_rate: f64,
}

/// Per-domain scheduler.
#[derive(Debug)]
pub struct Scheduler {
    domain: DomainId,
    config: SchedulerConfig,
    stealer: WorkStealer,
    running: AtomicBool,
    /// Guards the park/notify handshake.
    idle: Mutex<()>,
    wake: Condvar,
    next_worker: AtomicUsize,
    stats: SchedulerStats,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        domain: DomainId,
        config: SchedulerConfig,
    ) -> Self {
        let workers = config.workers.max(1);
        let piles = (0..workers).map(|_| Workpile::new(config.strategy)).collect();
        Self {
            domain,
            stealer: WorkStealer::new(piles, config.steal_batch),
            config,
            running: AtomicBool::new(false),
            idle: Mutex::new(()),
            wake: Condvar::new(),
            next_worker: AtomicUsize::new(0),
            stats: SchedulerStats::default(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Get the number of workers.
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.stealer.num_workers()
    }

    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Check if the workers are running.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Hand a runnable task to the scheduler.
    pub fn give(
        &self,
        task: Guid,
        hint: SchedHint,
    ) {
        let worker = match hint.affinity {
            Affinity::Worker(w) => w % self.num_workers(),
            _ => match current_worker() {
                Some((domain, w)) if domain == self.domain => w,
                _ => self.next_worker.fetch_add(1, Ordering::Relaxed) % self.num_workers(),
            },
        };
        self.stealer.pile(worker).push(task, hint.priority);
        self.stats.record_scheduled();
        tracing::trace!(domain = self.domain, worker, %task, "task queued");

        let _guard = self.idle.lock();
        self.wake.notify_one();
    }

    /// Next task for `worker`: own pile first, then a steal.
    pub fn take(
        &self,
        worker: usize,
    ) -> Option<Guid> {
        self.stealer
            .try_local(worker)
            .or_else(|| self.stealer.steal_for(worker))
    }

    /// Tasks queued but not yet taken.
    pub fn queued(&self) -> usize {
        self.stealer.queued()
    }

    /// Spawn the worker threads. `exec` runs one task on the given worker.
    pub fn start<F>(
        self: &Arc<Self>,
        exec: F,
    ) -> Result<()>
    where
        F: Fn(usize, Guid) + Send + Sync + 'static,
    {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let exec = Arc::new(exec);
        let mut handles = self.workers.lock();
        for worker in 0..self.num_workers() {
            let scheduler = Arc::clone(self);
            let exec = Arc::clone(&exec);
            let handle = thread::Builder::new()
                .name(format!("flowrt-d{}-w{}", self.domain, worker))
                .spawn(move || scheduler.worker_loop(worker, exec.as_ref()))
                .map_err(|e| {
                    RuntimeError::InvalidArgument(format!("failed to spawn worker thread: {e}"))
                })?;
            handles.push(handle);
        }
        tracing::debug!(domain = self.domain, workers = handles.len(), "scheduler started");
        Ok(())
    }

    fn worker_loop<F>(
        &self,
        worker: usize,
        exec: &F,
    ) where
        F: Fn(usize, Guid),
    {
        CURRENT_WORKER.with(|c| c.set(Some((self.domain, worker))));
        let idle_timeout = self.config.idle_timeout();

        while self.is_running() {
            if let Some(task) = self.take(worker) {
                self.stats.record_started();
                let start = Instant::now();
                exec(worker, task);
                self.stats
                    .record_completed(start.elapsed().as_micros() as usize);
                continue;
            }

            let mut guard = self.idle.lock();
            if self.is_running() && self.stealer.queued() == 0 {
                self.wake.wait_for(&mut guard, idle_timeout);
            }
        }
        CURRENT_WORKER.with(|c| c.set(None));
    }

    /// Stop the workers and join them. Returns tasks that never ran.
    pub fn stop(&self) -> Vec<Guid> {
        self.running.store(false, Ordering::Release);
        {
            let _guard = self.idle.lock();
            self.wake.notify_all();
        }
        let me = current_worker();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for (worker, handle) in handles.into_iter().enumerate() {
            // A worker asked to stop its own domain cannot join itself.
            if me == Some((self.domain, worker)) {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!(domain = self.domain, worker, "worker thread panicked");
            }
        }
        self.stealer.drain()
    }

    pub fn stats(&self) -> StatsSnapshot {
        let steals = self.stealer.stats();
        StatsSnapshot {
            scheduled: self.stats.tasks_scheduled.load(Ordering::Relaxed),
            completed: self.stats.tasks_completed.load(Ordering::Relaxed),
            exec_time_us: self.stats.total_exec_time_us.load(Ordering::Relaxed),
            peak_parallelism: self.stats.peak_parallelism.load(Ordering::Relaxed),
            steals: steals.tasks_stolen.load(Ordering::Relaxed),
            steal_failures: steals.steal_failures.load(Ordering::Relaxed),
            steal_success_rate: steals.success_rate(),
        }
    }
}
