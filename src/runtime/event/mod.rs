//! Events
//!
//! Events carry a payload GUID from producers to the slots registered on
//! them. The event itself only decides *who* must be told and *whether* it
//! retires; delivery happens outside the event lock in the domain engine,
//! which keeps propagation chains from holding nested locks.
//!
//! | kind       | second satisfy          | after firing                 |
//! |------------|-------------------------|------------------------------|
//! | Once       | `UnknownGuid`           | retired, GUID released       |
//! | Idempotent | ignored                 | persists, replays payload    |
//! | Sticky     | `EventAlreadySatisfied` | persists, replays payload    |
//! | Latch      | n/a (counted)           | retired at zero              |
//! | Channel    | buffered                | persists until destroyed     |


use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

use super::error::{Result, RuntimeError};
use super::guid::{Guid, GuidKind};

/// Latch slot that decrements the counter.
pub const LATCH_DECR_SLOT: u32 = 0;
/// Latch slot that increments the counter.
pub const LATCH_INCR_SLOT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Once,
    Idempotent,
    Sticky,
    Latch,
    Channel,
}

impl EventKind {
    pub fn guid_kind(self) -> GuidKind {
        match self {
            EventKind::Once => GuidKind::EventOnce,
            EventKind::Idempotent => GuidKind::EventIdempotent,
            EventKind::Sticky => GuidKind::EventSticky,
            EventKind::Latch => GuidKind::EventLatch,
            EventKind::Channel => GuidKind::EventChannel,
        }
    }

    pub fn from_guid_kind(kind: GuidKind) -> Option<Self> {
        match kind {
            GuidKind::EventOnce => Some(EventKind::Once),
            GuidKind::EventIdempotent => Some(EventKind::Idempotent),
            GuidKind::EventSticky => Some(EventKind::Sticky),
            GuidKind::EventLatch => Some(EventKind::Latch),
            GuidKind::EventChannel => Some(EventKind::Channel),
            _ => None,
        }
    }

    /// Persistent events keep their payload and replay it to late waiters.
    #[inline]
    pub fn is_persistent(self) -> bool {
        matches!(self, EventKind::Idempotent | EventKind::Sticky)
    }
}

/// Kind-specific creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventParams {
    /// Initial latch count.
    pub latch_count: u32,
    /// Buffered payloads (and parked getters) a channel can hold.
    pub channel_capacity: usize,
}

impl Default for EventParams {
    fn default() -> Self {
        EventParams {
            latch_count: 0,
            channel_capacity: 1,
        }
    }
}

/// A registered dependent: a task slot or an event slot, possibly remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Waiter {
    pub target: Guid,
    pub slot: u32,
}

impl Waiter {
    #[inline]
    pub fn new(
        target: Guid,
        slot: u32,
    ) -> Self {
        Waiter { target, slot }
    }
}

pub type Waiters = SmallVec<[Waiter; 4]>;

/// What the caller must do after a satisfy.
#[derive(Debug, PartialEq, Eq)]
pub enum Firing {
    /// Nothing to deliver yet.
    Pending,
    /// Repeated satisfy of an idempotent event.
    Ignored,
    Deliver {
        payload: Guid,
        waiters: Waiters,
        /// The event is spent; its GUID must be released after delivery.
        retire: bool,
        /// Delivery is counted as in flight; call `end_delivery` afterwards.
        tracked: bool,
    },
}

/// Result of registering a dependent.
#[derive(Debug, PartialEq, Eq)]
pub enum Registration {
    /// Parked until the event fires.
    Queued,
    /// Already available; the caller delivers it right away.
    Immediate { payload: Guid, tracked: bool },
}

#[derive(Debug)]
struct EventInner {
    waiters: Waiters,
    payload: Option<Guid>,
    retired: bool,
    in_flight: u32,
    counter: i64,
    buffer: VecDeque<Guid>,
    capacity: usize,
}

pub struct Event {
    guid: Guid,
    kind: EventKind,
    inner: Mutex<EventInner>,
    fired: Condvar,
}

impl fmt::Debug for Event {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Event")
            .field("guid", &self.guid)
            .field("kind", &self.kind)
            .field("payload", &inner.payload)
            .field("waiters", &inner.waiters.len())
            .field("retired", &inner.retired)
            .finish()
    }
}

impl Event {
    pub fn new(
        guid: Guid,
        kind: EventKind,
        params: EventParams,
    ) -> Self {
        Event {
            guid,
            kind,
            inner: Mutex::new(EventInner {
                waiters: SmallVec::new(),
                payload: None,
                retired: false,
                in_flight: 0,
                counter: params.latch_count as i64,
                buffer: VecDeque::new(),
                capacity: params.channel_capacity.max(1),
            }),
            fired: Condvar::new(),
        }
    }

    #[inline]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[inline]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn payload(&self) -> Option<Guid> {
        self.inner.lock().payload
    }

    pub fn is_satisfied(&self) -> bool {
        self.inner.lock().payload.is_some()
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Current latch count.
    pub fn latch_count(&self) -> i64 {
        self.inner.lock().counter
    }

    /// Satisfy slot 0 (latch: decrement).
    pub fn satisfy(
        &self,
        payload: Guid,
    ) -> Result<Firing> {
        self.satisfy_slot(payload, 0)
    }

    pub fn satisfy_slot(
        &self,
        payload: Guid,
        slot: u32,
    ) -> Result<Firing> {
        let mut inner = self.inner.lock();
        if inner.retired {
            return Err(RuntimeError::UnknownGuid(self.guid));
        }
        match self.kind {
            EventKind::Latch => {
                let delta = match slot {
                    LATCH_DECR_SLOT => -1,
                    LATCH_INCR_SLOT => 1,
                    _ => {
                        return Err(RuntimeError::IndexOutOfRange {
                            target: self.guid,
                            slot,
                            depc: 2,
                        })
                    },
                };
                self.adjust_latch(&mut inner, delta, payload)
            },
            _ if slot != 0 => Err(RuntimeError::IndexOutOfRange {
                target: self.guid,
                slot,
                depc: 1,
            }),
            EventKind::Once => {
                inner.retired = true;
                inner.payload = Some(payload);
                self.fired.notify_all();
                Ok(Firing::Deliver {
                    payload,
                    waiters: std::mem::take(&mut inner.waiters),
                    retire: true,
                    tracked: false,
                })
            },
            EventKind::Idempotent | EventKind::Sticky => {
                if inner.payload.is_some() {
                    return match self.kind {
                        EventKind::Idempotent => Ok(Firing::Ignored),
                        _ => Err(RuntimeError::EventAlreadySatisfied(self.guid)),
                    };
                }
                inner.payload = Some(payload);
                inner.in_flight += 1;
                self.fired.notify_all();
                Ok(Firing::Deliver {
                    payload,
                    waiters: std::mem::take(&mut inner.waiters),
                    retire: false,
                    tracked: true,
                })
            },
            EventKind::Channel => {
                if !inner.waiters.is_empty() {
                    let getter = inner.waiters.remove(0);
                    return Ok(Firing::Deliver {
                        payload,
                        waiters: smallvec![getter],
                        retire: false,
                        tracked: false,
                    });
                }
                if inner.buffer.len() >= inner.capacity {
                    return Err(RuntimeError::ChannelFull(self.guid));
                }
                inner.buffer.push_back(payload);
                Ok(Firing::Pending)
            },
        }
    }

    fn adjust_latch(
        &self,
        inner: &mut EventInner,
        delta: i64,
        payload: Guid,
    ) -> Result<Firing> {
        let next = inner.counter + delta;
        if next < 0 {
            return Err(RuntimeError::InvalidArgument(format!(
                "latch {} decremented below zero",
                self.guid
            )));
        }
        inner.counter = next;
        if next > 0 {
            return Ok(Firing::Pending);
        }
        inner.retired = true;
        inner.payload = Some(payload);
        self.fired.notify_all();
        Ok(Firing::Deliver {
            payload,
            waiters: std::mem::take(&mut inner.waiters),
            retire: true,
            tracked: false,
        })
    }

    /// Register a dependent.
    pub fn register(
        &self,
        waiter: Waiter,
    ) -> Result<Registration> {
        let mut inner = self.inner.lock();
        if inner.retired {
            return Err(RuntimeError::UnknownGuid(self.guid));
        }
        match self.kind {
            EventKind::Idempotent | EventKind::Sticky => {
                if let Some(payload) = inner.payload {
                    inner.in_flight += 1;
                    return Ok(Registration::Immediate {
                        payload,
                        tracked: true,
                    });
                }
            },
            EventKind::Channel => {
                if let Some(payload) = inner.buffer.pop_front() {
                    return Ok(Registration::Immediate {
                        payload,
                        tracked: false,
                    });
                }
                if inner.waiters.len() >= inner.capacity {
                    return Err(RuntimeError::ChannelFull(self.guid));
                }
            },
            EventKind::Once | EventKind::Latch => {},
        }
        inner.waiters.push(waiter);
        Ok(Registration::Queued)
    }

    /// Close a tracked delivery or immediate registration.
    pub fn end_delivery(&self) {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }

    /// Drop a parked waiter, e.g. the slot of a cancelled task. Returns
    /// `false` if it was not registered.
    pub fn unregister(
        &self,
        waiter: Waiter,
    ) -> bool {
        let mut inner = self.inner.lock();
        match inner.waiters.iter().position(|w| *w == waiter) {
            Some(at) => {
                inner.waiters.remove(at);
                true
            },
            None => false,
        }
    }

    /// Fails unless an explicit destroy may go ahead: nothing parked,
    /// buffered or being delivered.
    pub fn check_idle(&self) -> Result<()> {
        let inner = self.inner.lock();
        if inner.retired {
            return Err(RuntimeError::UnknownGuid(self.guid));
        }
        let busy = inner.in_flight > 0
            || !inner.waiters.is_empty()
            || (self.kind == EventKind::Channel && !inner.buffer.is_empty());
        if busy {
            return Err(RuntimeError::DestroyBusy(self.guid));
        }
        Ok(())
    }

    /// Mark the event retired and wake blocked waiters. Used once the last
    /// holder of its GUID let go.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock();
        inner.retired = true;
        self.fired.notify_all();
    }

    #[inline]
    pub fn is_retired(&self) -> bool {
        self.inner.lock().retired
    }

    /// Block until the event is satisfied.
    ///
    /// Returns `None` on timeout or if the event was destroyed unsatisfied.
    pub fn wait(
        &self,
        timeout: Option<Duration>,
    ) -> Option<Guid> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(payload) = inner.payload {
                return Some(payload);
            }
            if inner.retired {
                return None;
            }
            match timeout {
                Some(limit) => {
                    if self.fired.wait_for(&mut inner, limit).timed_out() {
                        return inner.payload;
                    }
                },
                None => self.fired.wait(&mut inner),
            }
        }
    }
}
