//! Cross-domain traffic
//!
//! Each domain runs one comm thread that drains its inbox and applies
//! messages to local objects. Requests that need an answer park the caller
//! on a one-shot channel keyed by ticket; the comm thread never issues such
//! requests itself, so it can always make progress on replies.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use super::{CreatedTask, PolicyDomain};
use crate::runtime::comm::{Envelope, Message, Refusal, ReorderBuffer, Ticket};
use crate::runtime::datablock::AccessMode;
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::event::{Waiter, LATCH_DECR_SLOT};
use crate::runtime::finish::ScopeHandle;
use crate::runtime::guid::{DomainId, Guid, GuidKind};
use crate::runtime::task::{Affinity, TaskBuilder};

#[derive(Debug)]
pub(crate) struct Reply {
    pub status: u8,
    pub refusal: Option<Refusal>,
    pub guids: Vec<Guid>,
}

#[derive(Debug)]
pub(crate) struct PendingReply {
    peer: DomainId,
    tx: Sender<Reply>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingFetch {
    task: Guid,
    slot: u32,
    source: Guid,
}

/// Why a request produced no reply.
#[derive(Debug)]
enum RequestError {
    /// The request never left; nothing happened remotely.
    NotSent(RuntimeError),
    /// The peer was lost while we waited.
    PeerLost,
    /// No answer in time; the peer may still act on the request.
    Timeout,
}

impl RequestError {
    fn into_error(
        self,
        domain: DomainId,
        guid: Guid,
    ) -> RuntimeError {
        match self {
            RequestError::NotSent(RuntimeError::RemoteUnreachable { domain, .. }) => {
                RuntimeError::RemoteUnreachable { domain, guid }
            },
            RequestError::NotSent(err) => err,
            RequestError::PeerLost | RequestError::Timeout => {
                RuntimeError::RemoteUnreachable { domain, guid }
            },
        }
    }
}

fn status_of<T>(result: &Result<T>) -> u8 {
    match result {
        Ok(_) => 0,
        Err(err) => err.status_code(),
    }
}

fn refusal_of<T>(result: &Result<T>) -> Option<Refusal> {
    result.as_ref().err().and_then(Refusal::of)
}

impl PolicyDomain {
    pub(crate) fn send(
        &self,
        to: DomainId,
        message: Message,
    ) -> Result<()> {
        self.fabric.send(self.id, to, message)
    }

    fn next_ticket(&self) -> Ticket {
        self.tickets.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a ticketed request and wait for the matching reply.
    fn request<F>(
        &self,
        to: DomainId,
        make: F,
    ) -> std::result::Result<Reply, RequestError>
    where
        F: FnOnce(Ticket) -> Message,
    {
        let ticket = self.next_ticket();
        let (tx, rx) = channel::bounded(1);
        self.replies
            .lock()
            .insert(ticket, PendingReply { peer: to, tx });
        if let Err(err) = self.send(to, make(ticket)) {
            self.replies.lock().remove(&ticket);
            return Err(RequestError::NotSent(err));
        }
        match rx.recv_timeout(self.reply_timeout) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Disconnected) => Err(RequestError::PeerLost),
            Err(RecvTimeoutError::Timeout) => {
                self.replies.lock().remove(&ticket);
                tracing::warn!(domain = self.id, peer = to, ticket, "request timed out");
                Err(RequestError::Timeout)
            },
        }
    }

    // ---- outgoing ----

    /// Create a task on `target`. Templates travel by name; the creating
    /// scope counts the task locally and the peer answers with one
    /// decrement when the remote subtree is done.
    pub(crate) fn create_remote_task(
        &self,
        scope: Option<&ScopeHandle>,
        target: DomainId,
        mut builder: TaskBuilder,
    ) -> Result<CreatedTask> {
        let template = self.template(builder.template)?;
        let name = template.name().to_string();
        if self.functions.get(&name).is_none() {
            return Err(RuntimeError::InvalidArgument(format!(
                "template {name} has no shared task function"
            )));
        }
        builder.hint.affinity = Affinity::Any;
        let parent_scope = scope.map_or(Guid::NULL, ScopeHandle::latch_guid);
        if let Some(scope) = scope {
            scope.track_creation();
            self.add_scope_credit(target, parent_scope, 1);
        }

        let (paramc, depc) = (template.paramc(), template.depc());
        let outcome = self.request(target, |ticket| Message::CreateTask {
            ticket,
            template: name,
            paramc,
            depc,
            builder,
            parent_scope,
        });
        match outcome {
            Ok(Reply { status: 0, guids, .. }) => match guids.as_slice() {
                [task, output] => Ok(CreatedTask {
                    task: *task,
                    output: *output,
                }),
                _ => Err(RuntimeError::from_remote(target, 22)),
            },
            // The peer already released the scope count.
            Ok(reply) => Err(RuntimeError::from_remote(target, reply.status)),
            Err(failure) => {
                if let Some(scope) = scope {
                    match failure {
                        RequestError::NotSent(_) | RequestError::PeerLost => {
                            self.add_scope_credit(target, parent_scope, -1);
                            self.close_scope_member(scope);
                        },
                        RequestError::Timeout => {},
                    }
                }
                Err(failure.into_error(target, Guid::NULL))
            },
        }
    }

    pub(crate) fn remote_add_dependence(
        &self,
        source: Guid,
        task: Guid,
        slot: u32,
        mode: AccessMode,
    ) -> Result<()> {
        let peer = task.location();
        let reply = self
            .request(peer, |ticket| Message::AddDependence {
                ticket,
                source,
                task,
                slot,
                mode,
            })
            .map_err(|failure| failure.into_error(peer, task))?;
        match (reply.status, reply.refusal) {
            (0, _) => Ok(()),
            (1, Some(Refusal::SlotSatisfied)) => Err(RuntimeError::SlotAlreadySatisfied { task, slot }),
            (1, Some(Refusal::EventSatisfied)) => Err(RuntimeError::EventAlreadySatisfied(task)),
            (1, _) => Err(RuntimeError::SlotAlreadyBound { task, slot }),
            (2, _) => Err(RuntimeError::UnknownGuid(task)),
            (code, _) => Err(RuntimeError::from_remote(peer, code)),
        }
    }

    /// Register `waiter` on an event owned by another domain.
    pub(crate) fn remote_register(
        &self,
        event: Guid,
        waiter: Waiter,
    ) -> Result<()> {
        let peer = event.location();
        let watched = waiter.target.location() == self.id
            && waiter.target.kind() == Some(GuidKind::Task);
        if watched {
            self.remote_waits
                .lock()
                .insert((waiter.target, waiter.slot), peer);
        }
        if let Err(err) = self.send(peer, Message::RegisterWaiter { event, waiter }) {
            if watched {
                self.remote_waits
                    .lock()
                    .remove(&(waiter.target, waiter.slot));
            }
            return Err(match err {
                RuntimeError::RemoteUnreachable { domain, .. } => {
                    RuntimeError::RemoteUnreachable { domain, guid: event }
                },
                other => other,
            });
        }
        Ok(())
    }

    pub(crate) fn forget_remote_wait(
        &self,
        task: Guid,
        slot: u32,
    ) {
        let mut waits = self.remote_waits.lock();
        if !waits.is_empty() {
            waits.remove(&(task, slot));
        }
    }

    fn add_scope_credit(
        &self,
        peer: DomainId,
        latch: Guid,
        delta: i64,
    ) {
        let mut credits = self.scope_credits.lock();
        let entry = credits.entry((peer, latch)).or_insert(0);
        *entry += delta;
        if *entry == 0 {
            credits.remove(&(peer, latch));
        }
    }

    /// Ask the owner of `source` for a copy to feed `slot` of `task`.
    pub(crate) fn fetch_clone(
        &self,
        task: Guid,
        slot: u32,
        source: Guid,
    ) {
        let ticket = self.next_ticket();
        self.fetches
            .lock()
            .insert(ticket, PendingFetch { task, slot, source });
        let sent = self.send(
            source.location(),
            Message::CloneRequest {
                ticket,
                datablock: source,
            },
        );
        if let Err(err) = sent {
            tracing::warn!(domain = self.id, %task, slot, %source, %err, "clone request failed");
            self.clone_arrived(ticket, None);
        }
    }

    fn clone_arrived(
        &self,
        ticket: Ticket,
        bytes: Option<Vec<u8>>,
    ) {
        let Some(fetch) = self.fetches.lock().remove(&ticket) else {
            return;
        };
        let task = match self.task(fetch.task) {
            Ok(task) => task,
            Err(err) => {
                tracing::warn!(domain = self.id, task = %fetch.task, %err, "clone arrived for unknown task");
                return;
            },
        };
        let clone = bytes.and_then(|bytes| match self.new_datablock(bytes, fetch.source) {
            Ok(guid) => Some(guid),
            Err(err) => {
                tracing::warn!(domain = self.id, source = %fetch.source, %err, "clone could not be stored");
                None
            },
        });
        tracing::debug!(domain = self.id, task = %fetch.task, slot = fetch.slot, source = %fetch.source, clone = ?clone, "data-block cloned in");
        task.patch_slot(fetch.slot, clone);
        if task.fetch_done() {
            self.dispatch(&task);
        }
    }

    pub(crate) fn push_clone(
        &self,
        origin: Guid,
        bytes: Vec<u8>,
        target: DomainId,
    ) -> Result<Guid> {
        let reply = self
            .request(target, |ticket| Message::ClonePush {
                ticket,
                origin,
                bytes,
            })
            .map_err(|failure| failure.into_error(target, origin))?;
        match (reply.status, reply.guids.first()) {
            (0, Some(&clone)) => Ok(clone),
            (0, None) => Err(RuntimeError::from_remote(target, 22)),
            (code, _) => Err(RuntimeError::from_remote(target, code)),
        }
    }

    /// Tell every live peer to stop accepting work and wait for their
    /// acknowledgements. Returns how many arrived.
    pub(crate) fn broadcast_shutdown(
        &self,
        timeout: Duration,
    ) -> usize {
        self.shutdown_acks.store(0, Ordering::Release);
        let mut expected = 0;
        for peer in 0..self.fabric.num_domains() {
            if peer != self.id && self.send(peer, Message::Shutdown).is_ok() {
                expected += 1;
            }
        }
        let deadline = Instant::now() + timeout;
        while self.shutdown_acks.load(Ordering::Acquire) < expected && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        let acks = self.shutdown_acks.load(Ordering::Acquire);
        tracing::debug!(domain = self.id, acks, expected, "shutdown acknowledged");
        acks
    }

    // ---- comm thread ----

    pub(crate) fn start_comm(self: &Arc<Self>) -> Result<()> {
        let rx = self.fabric.take_receiver(self.id).ok_or_else(|| {
            RuntimeError::InvalidArgument(format!("inbox of domain {} already taken", self.id))
        })?;
        self.comm_running.store(true, Ordering::Release);
        let domain = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("flowrt-d{}-comm", self.id))
            .spawn(move || domain.comm_loop(rx))
            .map_err(|e| RuntimeError::InvalidArgument(format!("failed to spawn comm thread: {e}")))?;
        *self.comm_thread.lock() = Some(handle);
        Ok(())
    }

    /// Stop the comm thread once its inbox is idle.
    pub(crate) fn stop_comm(&self) {
        self.comm_running.store(false, Ordering::Release);
        if let Some(handle) = self.comm_thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!(domain = self.id, "comm thread panicked");
            }
        }
    }

    fn comm_loop(
        &self,
        rx: Receiver<Envelope>,
    ) {
        let mut reorder = ReorderBuffer::new();
        let idle = self.fabric.config().idle_flush();
        loop {
            match rx.recv_timeout(idle) {
                Ok(envelope) => {
                    if let Message::PeerLost { domain } = envelope.message {
                        for _ in reorder.forget(domain) {
                            self.fabric.complete();
                        }
                    }
                    for ready in reorder.accept(envelope) {
                        self.handle(ready);
                        self.fabric.complete();
                    }
                },
                Err(RecvTimeoutError::Timeout) => {
                    self.fabric.flush(self.id);
                    if !self.comm_running.load(Ordering::Acquire) && rx.is_empty() {
                        break;
                    }
                },
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        if reorder.held() > 0 {
            tracing::debug!(domain = self.id, held = reorder.held(), "comm thread exits with held messages");
        }
    }

    fn handle(
        &self,
        envelope: Envelope,
    ) {
        let Envelope { from, message, .. } = envelope;
        if !self.fabric.is_alive(self.id) {
            tracing::trace!(domain = self.id, from, message = message.name(), "dropped by disconnected domain");
            return;
        }
        tracing::trace!(domain = self.id, from, message = message.name(), "received");
        match message {
            Message::CreateTask {
                ticket,
                template,
                paramc,
                depc,
                builder,
                parent_scope,
            } => {
                let created = self.create_for_peer(&template, paramc, depc, builder, parent_scope);
                let guids = match &created {
                    Ok(created) => vec![created.task, created.output],
                    Err(_) => Vec::new(),
                };
                self.reply(from, ticket, status_of(&created), None, guids);
            },
            Message::AddDependence {
                ticket,
                source,
                task,
                slot,
                mode,
            } => {
                let bound = self.add_dependence(source, task, slot, mode);
                self.reply(from, ticket, status_of(&bound), refusal_of(&bound), Vec::new());
            },
            Message::RegisterWaiter { event, waiter } => {
                if let Err(err) = self.register_on(event, waiter) {
                    tracing::warn!(domain = self.id, %event, target = %waiter.target, %err, "remote registration refused");
                    let fail = Message::FailSlot {
                        target: waiter.target,
                        slot: waiter.slot,
                    };
                    if let Err(err) = self.send(waiter.target.location(), fail) {
                        tracing::debug!(domain = self.id, %err, "failure notice dropped");
                    }
                }
            },
            Message::Satisfy {
                event,
                payload,
                slot,
            } => {
                if let Err(err) = self.satisfy_local_event(event, payload, slot) {
                    tracing::warn!(domain = self.id, %event, from, %err, "remote satisfy failed");
                }
            },
            Message::SatisfySlot {
                target,
                payload,
                slot,
            } => {
                if slot == LATCH_DECR_SLOT && target.kind() == Some(GuidKind::EventLatch) {
                    self.add_scope_credit(from, target, -1);
                }
                if let Err(err) = self.deliver_to(Waiter::new(target, slot), payload) {
                    tracing::warn!(domain = self.id, %target, slot, from, %err, "remote delivery failed");
                }
            },
            Message::FailSlot { target, slot } => self.fail_task_slot(target, slot),
            Message::CloneRequest { ticket, datablock } => {
                let bytes = self.datablock(datablock).ok().map(|block| block.snapshot());
                let response = Message::CloneResponse {
                    ticket,
                    datablock,
                    bytes,
                };
                if let Err(err) = self.send(from, response) {
                    tracing::debug!(domain = self.id, %datablock, %err, "clone response dropped");
                }
            },
            Message::CloneResponse { ticket, bytes, .. } => self.clone_arrived(ticket, bytes),
            Message::ClonePush {
                ticket,
                origin,
                bytes,
            } => {
                let clone = self.new_datablock(bytes, origin);
                let guids = clone.as_ref().map(|g| vec![*g]).unwrap_or_default();
                self.reply(from, ticket, status_of(&clone), None, guids);
            },
            Message::Reply {
                ticket,
                status,
                refusal,
                guids,
            } => {
                if let Some(pending) = self.replies.lock().remove(&ticket) {
                    // The requester may have timed out and gone.
                    let _ = pending.tx.send(Reply {
                        status,
                        refusal,
                        guids,
                    });
                }
            },
            Message::Shutdown => {
                self.begin_shutdown();
                if let Err(err) = self.send(from, Message::ShutdownAck) {
                    tracing::debug!(domain = self.id, %err, "shutdown ack dropped");
                }
            },
            Message::ShutdownAck => {
                self.shutdown_acks.fetch_add(1, Ordering::AcqRel);
            },
            Message::PeerLost { domain } => self.peer_lost(domain),
        }
    }

    fn reply(
        &self,
        to: DomainId,
        ticket: Ticket,
        status: u8,
        refusal: Option<Refusal>,
        guids: Vec<Guid>,
    ) {
        if let Err(err) = self.send(
            to,
            Message::Reply {
                ticket,
                status,
                refusal,
                guids,
            },
        ) {
            tracing::debug!(domain = self.id, to, ticket, %err, "reply dropped");
        }
    }

    /// Serve a `CreateTask` request. Whatever happens, the requester's scope
    /// count is released exactly once: by the proxy scope if one was made,
    /// else by an explicit decrement.
    fn create_for_peer(
        &self,
        name: &str,
        paramc: u32,
        depc: crate::runtime::task::DepCount,
        mut builder: TaskBuilder,
        parent_scope: Guid,
    ) -> Result<CreatedTask> {
        let proxy = match self.template_for(name, paramc, depc) {
            Ok(template) => {
                builder.template = template;
                if parent_scope.is_null() {
                    None
                } else {
                    match self.proxy_scope(parent_scope) {
                        Ok(proxy) => Some(proxy),
                        Err(err) => {
                            self.release_remote_scope(parent_scope);
                            return Err(err);
                        },
                    }
                }
            },
            Err(err) => {
                if !parent_scope.is_null() {
                    self.release_remote_scope(parent_scope);
                }
                return Err(err);
            },
        };
        self.create_local_task(proxy.as_ref(), builder)
    }

    fn release_remote_scope(
        &self,
        latch: Guid,
    ) {
        if let Err(err) = self.deliver_to(Waiter::new(latch, LATCH_DECR_SLOT), Guid::NULL) {
            tracing::warn!(domain = self.id, %latch, %err, "remote scope release failed");
        }
    }

    /// Local template for a task function shared by name.
    fn template_for(
        &self,
        name: &str,
        paramc: u32,
        depc: crate::runtime::task::DepCount,
    ) -> Result<Guid> {
        let cached = self.templates.lock().get(name).copied();
        if let Some(guid) = cached {
            match self.template(guid) {
                Ok(t) if t.paramc() == paramc && t.depc() == depc => return Ok(guid),
                _ => {},
            }
        }
        let func = self.functions.get(name).ok_or_else(|| {
            RuntimeError::InvalidArgument(format!("no task function named {name}"))
        })?;
        self.template_create(name, func, paramc, depc)
    }

    /// Fail everything that waits on `lost`.
    fn peer_lost(
        &self,
        lost: DomainId,
    ) {
        tracing::warn!(domain = self.id, lost, "peer lost");

        // Dropping the senders wakes the requesters.
        self.replies.lock().retain(|_, pending| pending.peer != lost);

        let mut failed = Vec::new();
        self.remote_waits.lock().retain(|key, peer| {
            if *peer == lost {
                failed.push(*key);
                false
            } else {
                true
            }
        });
        for (task, slot) in failed {
            self.fail_task_slot(task, slot);
        }

        let tickets: Vec<Ticket> = self
            .fetches
            .lock()
            .iter()
            .filter(|(_, fetch)| fetch.source.location() == lost)
            .map(|(ticket, _)| *ticket)
            .collect();
        for ticket in tickets {
            self.clone_arrived(ticket, None);
        }

        let mut owed = Vec::new();
        self.scope_credits.lock().retain(|&(peer, latch), count| {
            if peer == lost {
                owed.push((latch, *count));
                false
            } else {
                true
            }
        });
        for (latch, count) in owed {
            for _ in 0..count.max(0) {
                self.release_remote_scope(latch);
            }
        }
    }
}
