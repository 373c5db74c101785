//! Workpiles
//!
//! One workpile per worker. The owner pushes at the tail and pops from the
//! tail (LIFO) or head (FIFO); thieves always take from the head, so they
//! get the oldest work and contend with the owner only on a nearly empty
//! pile.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::runtime::guid::Guid;
use crate::runtime::task::TaskPriority;

/// Order in which a worker drains its own pile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingStrategy {
    /// Newest first; keeps producer/consumer chains cache-hot.
    #[default]
    Lifo,
    /// Oldest first.
    Fifo,
    /// Highest priority band first, FIFO within a band.
    Priority,
}

const BANDS: usize = 3;

#[inline]
fn band(priority: TaskPriority) -> usize {
    match priority {
        TaskPriority::Critical | TaskPriority::High => 0,
        TaskPriority::Normal => 1,
        TaskPriority::Low => 2,
    }
}

/// A worker's queue of runnable task GUIDs.
#[derive(Debug)]
pub struct Workpile {
    strategy: SchedulingStrategy,
    /// Bands by priority, highest first. Only band 1 is used unless the
    /// strategy is `Priority`.
    bands: [Mutex<VecDeque<Guid>>; BANDS],
}

impl Workpile {
    /// Create a new empty workpile.
    pub fn new(strategy: SchedulingStrategy) -> Self {
        Self {
            strategy,
            bands: std::array::from_fn(|_| Mutex::new(VecDeque::new())),
        }
    }

    #[inline]
    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// Push a runnable task at the tail.
    pub fn push(
        &self,
        task: Guid,
        priority: TaskPriority,
    ) {
        let index = match self.strategy {
            SchedulingStrategy::Priority => band(priority),
            _ => 1,
        };
        self.bands[index].lock().push_back(task);
    }

    /// Owner-side pop.
    pub fn pop(&self) -> Option<Guid> {
        match self.strategy {
            SchedulingStrategy::Lifo => self.bands[1].lock().pop_back(),
            SchedulingStrategy::Fifo => self.bands[1].lock().pop_front(),
            SchedulingStrategy::Priority => self.bands.iter().find_map(|b| b.lock().pop_front()),
        }
    }

    /// Thief-side pop of up to `max` tasks from the head. Low priority work
    /// is given away first.
    pub fn steal(
        &self,
        max: usize,
    ) -> Vec<Guid> {
        let mut stolen = Vec::new();
        for band in self.bands.iter().rev() {
            let mut queue = band.lock();
            while stolen.len() < max {
                match queue.pop_front() {
                    Some(task) => stolen.push(task),
                    None => break,
                }
            }
            if stolen.len() >= max {
                break;
            }
        }
        stolen
    }

    /// Get the number of queued tasks.
    pub fn len(&self) -> usize {
        self.bands.iter().map(|b| b.lock().len()).sum()
    }

    /// Check if the pile is empty.
    pub fn is_empty(&self) -> bool {
        self.bands.iter().all(|b| b.lock().is_empty())
    }

    /// Remove and return everything still queued.
    pub fn drain(&self) -> Vec<Guid> {
        self.bands
            .iter()
            .flat_map(|b| b.lock().drain(..).collect::<Vec<_>>())
            .collect()
    }
}

impl Default for Workpile {
    fn default() -> Self {
        Self::new(SchedulingStrategy::default())
    }
}
