//! Work stealing for load balancing across the workers of a domain.
//!
//! An idle worker picks a random victim and takes a batch from the head of
//! its pile. The first stolen task is returned; the rest land in the thief's
//! own pile.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use super::queue::Workpile;
use crate::runtime::guid::Guid;
use crate::runtime::task::TaskPriority;

/// Statistics about work stealing operations.
#[derive(Debug, Default)]
pub struct StealStats {
    /// Number of successful steals.
    pub steal_successes: AtomicUsize,
    /// Number of failed steal attempts.
    pub steal_failures: AtomicUsize,
    /// Total tasks stolen.
    pub tasks_stolen: AtomicUsize,
}

impl StealStats {
    /// Record a successful steal.
    #[inline]
    pub fn record_success(
        &self,
        count: usize,
    ) {
        self.steal_successes.fetch_add(1, Ordering::Relaxed);
        self.tasks_stolen.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a failed steal attempt.
    #[inline]
    pub fn record_failure(&self) {
        self.steal_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get success rate as a fraction.
    pub fn success_rate(&self) -> f64 {
        let successes = self.steal_successes.load(Ordering::Relaxed);
        let total = successes + self.steal_failures.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        successes as f64 / total as f64
    }
}

/// Owner of a domain's workpiles.
#[derive(Debug)]
pub struct WorkStealer {
    piles: Box<[Workpile]>,
    batch: usize,
    stats: StealStats,
}

impl WorkStealer {
    /// Create a work stealer with one pile per worker.
    pub fn new(
        piles: Vec<Workpile>,
        batch: usize,
    ) -> Self {
        Self {
            piles: piles.into_boxed_slice(),
            batch: batch.max(1),
            stats: StealStats::default(),
        }
    }

    /// Get the number of workers.
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.piles.len()
    }

    #[inline]
    pub fn pile(
        &self,
        worker: usize,
    ) -> &Workpile {
        &self.piles[worker % self.piles.len()]
    }

    /// Try the worker's own pile.
    #[inline]
    pub fn try_local(
        &self,
        worker: usize,
    ) -> Option<Guid> {
        self.pile(worker).pop()
    }

    /// Steal for `thief` from a random victim, scanning every other pile
    /// once before giving up.
    pub fn steal_for(
        &self,
        thief: usize,
    ) -> Option<Guid> {
        let n = self.piles.len();
        if n < 2 {
            return None;
        }
        let start = rand::rng().random_range(0..n);
        for offset in 0..n {
            let victim = (start + offset) % n;
            if victim == thief {
                continue;
            }
            let mut stolen = self.piles[victim].steal(self.batch).into_iter();
            if let Some(first) = stolen.next() {
                let rest: Vec<Guid> = stolen.collect();
                self.stats.record_success(rest.len() + 1);
                let own = self.pile(thief);
                for task in rest {
                    own.push(task, TaskPriority::Normal);
                }
                return Some(first);
            }
        }
        self.stats.record_failure();
        None
    }

    /// Total queued tasks across all piles.
    pub fn queued(&self) -> usize {
        self.piles.iter().map(Workpile::len).sum()
    }

    /// Remove everything still queued.
    pub fn drain(&self) -> Vec<Guid> {
        self.piles.iter().flat_map(Workpile::drain).collect()
    }

    /// Get steal statistics.
    #[inline]
    pub fn stats(&self) -> &StealStats {
        &self.stats
    }
}
