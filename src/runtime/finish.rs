//! Finish scopes
//!
//! A finish scope is a latch event counting the live tasks created, directly
//! or transitively, inside a task carrying the finish property. The latch
//! starts at one for the owning task; each creation inside the scope
//! increments it and each completion decrements it. When it reaches zero it
//! satisfies the owner's output event and decrements the enclosing scope,
//! both of which are ordinary waiters registered on the latch.
//!
//! Increments are always local. A task placed in another domain joins a
//! proxy scope there, whose latch forwards a single decrement back to the
//! real scope when the remote subtree is done. Only decrements ever cross
//! domains, so reordering of messages can never make a counter reach zero
//! early.

use std::fmt;
use std::sync::Arc;

use super::event::{Event, Firing, LATCH_DECR_SLOT, LATCH_INCR_SLOT};
use super::guid::Guid;
use crate::fatal_invariant;

pub struct FinishScope {
    latch: Arc<Event>,
    /// Latch of the real scope when this is a proxy for a remote one.
    proxy_for: Option<Guid>,
}

/// Shared handle to a finish scope.
#[derive(Clone)]
pub struct ScopeHandle(Arc<FinishScope>);

impl fmt::Debug for ScopeHandle {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ScopeHandle")
            .field("latch", &self.0.latch.guid())
            .field("proxy_for", &self.0.proxy_for)
            .finish()
    }
}

impl ScopeHandle {
    pub fn new(
        latch: Arc<Event>,
        proxy_for: Option<Guid>,
    ) -> Self {
        ScopeHandle(Arc::new(FinishScope { latch, proxy_for }))
    }

    #[inline]
    pub fn latch_guid(&self) -> Guid {
        self.0.latch.guid()
    }

    #[inline]
    pub fn latch(&self) -> &Arc<Event> {
        &self.0.latch
    }

    #[inline]
    pub fn proxy_for(&self) -> Option<Guid> {
        self.0.proxy_for
    }

    /// Live tasks still counted by the scope.
    pub fn pending(&self) -> i64 {
        self.0.latch.latch_count()
    }

    /// Count a task created inside the scope.
    pub fn track_creation(&self) {
        match self.0.latch.satisfy_slot(Guid::NULL, LATCH_INCR_SLOT) {
            Ok(Firing::Pending) => {},
            Ok(other) => {
                fatal_invariant!("increment of finish scope {} fired it: {other:?}", self.latch_guid())
            },
            Err(err) => {
                fatal_invariant!("task created in closed finish scope {}: {err}", self.latch_guid())
            },
        }
    }

    /// Count a completion. The returned firing must be delivered by the
    /// caller when the scope closes.
    #[must_use]
    pub fn track_completion(&self) -> Firing {
        match self.0.latch.satisfy_slot(Guid::NULL, LATCH_DECR_SLOT) {
            Ok(firing) => firing,
            Err(err) => {
                fatal_invariant!("finish scope {} counter went negative: {err}", self.latch_guid())
            },
        }
    }
}
