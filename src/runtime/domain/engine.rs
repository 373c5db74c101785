//! Dependency engine
//!
//! Task creation, slot binding, event propagation and task execution for
//! objects owned by this domain. Propagation never holds an object lock
//! while delivering: events hand back a [`Firing`] and the engine walks its
//! waiters afterwards.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{CreatedTask, PolicyDomain, TaskContext};
use crate::fatal_invariant;
use crate::runtime::datablock::AccessMode;
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::event::{Event, EventKind, EventParams, Firing, Registration, Waiter, LATCH_DECR_SLOT};
use crate::runtime::finish::ScopeHandle;
use crate::runtime::guid::{Guid, GuidKind};
use crate::runtime::metadata::Metadata;
use crate::runtime::task::{Affinity, DepCount, Task, TaskBuilder, TaskInit, TaskProps};

/// NULL, a data-block, or an event.
pub(super) fn is_source(guid: Guid) -> bool {
    guid.is_null() || guid.is_event() || guid.kind() == Some(GuidKind::DataBlock)
}

/// Sources that satisfy a slot as soon as they are bound.
fn is_immediate(guid: Guid) -> bool {
    guid.is_null() || guid.kind() == Some(GuidKind::DataBlock)
}

impl PolicyDomain {
    /// Create a task inside `scope`. `external` calls are refused once
    /// shutdown has begun.
    pub(crate) fn create_task_in(
        &self,
        scope: Option<&ScopeHandle>,
        external: bool,
        builder: TaskBuilder,
    ) -> Result<CreatedTask> {
        if external && !self.is_accepting() {
            return Err(RuntimeError::ShuttingDown);
        }
        match builder.hint.affinity {
            Affinity::Domain(target) if target != self.id => {
                self.create_remote_task(scope, target, builder)
            },
            _ => self.create_local_task(scope, builder),
        }
    }

    /// The scope counts the task before anything else happens, so every
    /// failure below is undone by one matching completion.
    pub(crate) fn create_local_task(
        &self,
        scope: Option<&ScopeHandle>,
        builder: TaskBuilder,
    ) -> Result<CreatedTask> {
        if let Some(scope) = scope {
            scope.track_creation();
        }
        match self.publish_task(scope, builder) {
            Ok(created) => Ok(created),
            Err(err) => {
                if let Some(scope) = scope {
                    self.close_scope_member(scope);
                }
                tracing::warn!(domain = self.id, %err, "task creation failed");
                Err(err)
            },
        }
    }

    fn publish_task(
        &self,
        scope: Option<&ScopeHandle>,
        builder: TaskBuilder,
    ) -> Result<CreatedTask> {
        let TaskBuilder {
            template,
            params,
            depv,
            props,
            hint,
            output,
        } = builder;
        let template = self.template(template)?;

        let paramc = template.paramc();
        if params.len() as u32 != paramc {
            return Err(RuntimeError::ArityMismatch {
                template: template.guid(),
                what: "parameter",
                expected: paramc,
                got: params.len() as u32,
            });
        }
        let explicit_depv = depv.is_some();
        let depv = depv.unwrap_or_default();
        let depc = match template.depc() {
            DepCount::Fixed(n) => {
                if explicit_depv && depv.len() as u32 != n {
                    return Err(RuntimeError::ArityMismatch {
                        template: template.guid(),
                        what: "dependence",
                        expected: n,
                        got: depv.len() as u32,
                    });
                }
                n
            },
            DepCount::Deferred => depv.len() as u32,
        };
        for &source in &depv {
            if source != Guid::UNINITIALIZED && !is_source(source) {
                return Err(RuntimeError::wrong_kind(source, "event or data-block"));
            }
        }
        // Local producers must still exist; nothing is published otherwise.
        for &source in &depv {
            if source.is_null() || source == Guid::UNINITIALIZED || source.location() != self.id {
                continue;
            }
            if let Metadata::Event(event) = self.provider.resolve(source)? {
                if event.is_retired() {
                    return Err(RuntimeError::UnknownGuid(source));
                }
            }
        }

        let output_event = match output {
            Some(EventKind::Latch | EventKind::Channel) => {
                return Err(RuntimeError::InvalidArgument(
                    "an output event must be once, idempotent or sticky".into(),
                ))
            },
            Some(kind) => self.new_event(kind, EventParams::default())?.guid(),
            None => Guid::NULL,
        };

        let own_scope = if props.contains(TaskProps::FINISH) {
            match self.enter_scope(scope, output_event) {
                Ok(own) => Some(own),
                Err(err) => {
                    self.discard(output_event);
                    return Err(err);
                },
            }
        } else {
            None
        };

        let init = TaskInit {
            template,
            params,
            depc,
            props,
            hint,
            scope: scope.cloned(),
            own_scope: own_scope.clone(),
            output_event,
        };
        let extra = init.params.len() * std::mem::size_of::<u64>();
        let task = match self
            .provider
            .create(GuidKind::Task, extra, |guid| Metadata::Task(Arc::new(Task::new(guid, init))))
            .and_then(|(_, meta)| meta.into_task())
        {
            Ok(task) => task,
            Err(err) => {
                if let Some(own) = own_scope {
                    self.discard(own.latch_guid());
                }
                self.discard(output_event);
                return Err(err);
            },
        };
        self.live_tasks.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(
            domain = self.id,
            task = %task.guid(),
            template = task.template().name(),
            depc,
            "task created"
        );

        for (slot, &source) in depv.iter().enumerate() {
            if source == Guid::UNINITIALIZED {
                continue;
            }
            // The task is already published; a producer that vanished in
            // the meantime resolves its slot as failed instead.
            if let Err(err) = self.bind_dependence(&task, slot as u32, source, AccessMode::default()) {
                tracing::warn!(domain = self.id, task = %task.guid(), slot, %err, "pre-bound dependence failed");
            }
        }
        if !task.is_deferred() && task.release_guard() {
            self.make_runnable(&task);
        }
        Ok(CreatedTask {
            task: task.guid(),
            output: output_event,
        })
    }

    /// Release a GUID created during a failed operation.
    fn discard(
        &self,
        guid: Guid,
    ) {
        if guid.is_null() {
            return;
        }
        if let Err(err) = self.provider.release(guid) {
            tracing::debug!(domain = self.id, %guid, %err, "discard of partial object failed");
        }
    }

    pub(crate) fn new_event(
        &self,
        kind: EventKind,
        params: EventParams,
    ) -> Result<Arc<Event>> {
        let (_, meta) = self.provider.create(kind.guid_kind(), 0, |guid| {
            Metadata::Event(Arc::new(Event::new(guid, kind, params)))
        })?;
        meta.into_event()
    }

    /// Open the scope of a finish task. Its latch starts at one for the task
    /// itself and, on closing, satisfies `output` and decrements `parent`.
    fn enter_scope(
        &self,
        parent: Option<&ScopeHandle>,
        output: Guid,
    ) -> Result<ScopeHandle> {
        let latch = self.new_event(
            EventKind::Latch,
            EventParams {
                latch_count: 1,
                ..EventParams::default()
            },
        )?;
        if !output.is_null() {
            latch.register(Waiter::new(output, 0))?;
        }
        if let Some(parent) = parent {
            latch.register(Waiter::new(parent.latch_guid(), LATCH_DECR_SLOT))?;
        }
        Ok(ScopeHandle::new(latch, None))
    }

    /// Local stand-in for a finish scope owned by another domain. It starts
    /// at zero; the task created into it brings it to one.
    pub(crate) fn proxy_scope(
        &self,
        remote_latch: Guid,
    ) -> Result<ScopeHandle> {
        let latch = self.new_event(EventKind::Latch, EventParams::default())?;
        latch.register(Waiter::new(remote_latch, LATCH_DECR_SLOT))?;
        Ok(ScopeHandle::new(latch, Some(remote_latch)))
    }

    /// Count one completion in `scope` and propagate if it closed.
    pub(crate) fn close_scope_member(
        &self,
        scope: &ScopeHandle,
    ) {
        let firing = scope.track_completion();
        self.deliver_firing(scope.latch(), firing);
    }

    /// Bind a slot of a local task and hook it to its producer.
    pub(crate) fn bind_dependence(
        &self,
        task: &Task,
        slot: u32,
        source: Guid,
        mode: AccessMode,
    ) -> Result<()> {
        task.bind_slot(slot, source, mode)?;
        if is_immediate(source) {
            return self.satisfy_task_slot(task.guid(), slot, source, None);
        }
        let waiter = Waiter::new(task.guid(), slot);
        if let Err(err) = self.register_on(source, waiter) {
            // The slot is bound; leaving it unresolved would wedge the task.
            self.fail_task_slot(task.guid(), slot);
            return Err(err);
        }
        Ok(())
    }

    /// Deliver `source` to `waiter` now if it is immediate, else register.
    pub(crate) fn feed(
        &self,
        waiter: Waiter,
        source: Guid,
    ) -> Result<()> {
        if is_immediate(source) {
            return self.deliver_to(waiter, source);
        }
        self.register_on(source, waiter)
    }

    /// Register `waiter` on the event `source`, local or remote.
    pub(crate) fn register_on(
        &self,
        source: Guid,
        waiter: Waiter,
    ) -> Result<()> {
        if source.location() != self.id {
            return self.remote_register(source, waiter);
        }
        let event = self.event(source)?;
        match event.register(waiter)? {
            Registration::Queued => Ok(()),
            Registration::Immediate { payload, tracked } => {
                let delivered = self.deliver_to(waiter, payload);
                if tracked {
                    event.end_delivery();
                }
                delivered
            },
        }
    }

    /// Hand `payload` to one waiter, forwarding if it lives elsewhere.
    pub(crate) fn deliver_to(
        &self,
        waiter: Waiter,
        payload: Guid,
    ) -> Result<()> {
        let Waiter { target, slot } = waiter;
        if target.location() != self.id {
            return self.send(
                target.location(),
                crate::runtime::comm::Message::SatisfySlot {
                    target,
                    payload,
                    slot,
                },
            );
        }
        match target.kind() {
            Some(GuidKind::Task) => self.satisfy_task_slot(target, slot, payload, None),
            Some(kind) if kind.is_event() => self.satisfy_local_event(target, payload, slot),
            _ => Err(RuntimeError::wrong_kind(target, "task or event")),
        }
    }

    pub(crate) fn satisfy_local_event(
        &self,
        guid: Guid,
        payload: Guid,
        slot: u32,
    ) -> Result<()> {
        let event = self.event(guid)?;
        let firing = event.satisfy_slot(payload, slot)?;
        self.deliver_firing(&event, firing);
        Ok(())
    }

    /// Walk the waiters of a fired event.
    pub(crate) fn deliver_firing(
        &self,
        event: &Event,
        firing: Firing,
    ) {
        let Firing::Deliver {
            payload,
            waiters,
            retire,
            tracked,
        } = firing
        else {
            return;
        };
        tracing::trace!(domain = self.id, event = %event.guid(), %payload, waiters = waiters.len(), "event fired");
        for waiter in waiters {
            if let Err(err) = self.deliver_to(waiter, payload) {
                tracing::warn!(
                    domain = self.id,
                    event = %event.guid(),
                    target = %waiter.target,
                    slot = waiter.slot,
                    %err,
                    "delivery failed"
                );
            }
        }
        if tracked {
            event.end_delivery();
        }
        if retire {
            self.discard(event.guid());
        }
    }

    pub(crate) fn satisfy_task_slot(
        &self,
        guid: Guid,
        slot: u32,
        payload: Guid,
        mode: Option<AccessMode>,
    ) -> Result<()> {
        let task = self.task(guid)?;
        self.forget_remote_wait(guid, slot);
        if task.satisfy_slot(slot, payload, mode)? {
            self.make_runnable(&task);
        }
        Ok(())
    }

    /// Resolve a slot as failed. A slot that already resolved is left alone.
    pub(crate) fn fail_task_slot(
        &self,
        guid: Guid,
        slot: u32,
    ) {
        let Ok(task) = self.task(guid) else {
            return;
        };
        self.forget_remote_wait(guid, slot);
        match task.fail_slot(slot) {
            Ok(ready) => {
                tracing::warn!(domain = self.id, task = %guid, slot, "dependence failed");
                if ready {
                    self.make_runnable(&task);
                }
            },
            Err(err) => tracing::trace!(domain = self.id, task = %guid, slot, %err, "slot already resolved"),
        }
    }

    /// Claim the Runnable transition, fetch remote data-blocks, dispatch.
    pub(crate) fn make_runnable(
        &self,
        task: &Arc<Task>,
    ) {
        if !task.mark_runnable() {
            tracing::debug!(domain = self.id, task = %task.guid(), state = ?task.state(), "ready task not dispatched");
            return;
        }
        let remote = task.remote_payloads(self.id);
        if remote.is_empty() {
            self.dispatch(task);
            return;
        }
        task.set_pending_fetches(remote.len() as u32);
        for (slot, datablock) in remote {
            self.fetch_clone(task.guid(), slot, datablock);
        }
    }

    pub(crate) fn dispatch(
        &self,
        task: &Task,
    ) {
        self.scheduler.give(task.guid(), task.hint());
    }

    /// Run one task on `worker`.
    pub(crate) fn execute(
        &self,
        worker: usize,
        guid: Guid,
    ) {
        let task = match self.task(guid) {
            Ok(task) => task,
            Err(err) => fatal_invariant!("scheduled task {guid} cannot be resolved: {err}"),
        };
        if !task.mark_running() {
            fatal_invariant!("task {guid} dispatched in state {:?}", task.state());
        }
        let deps = task.dep_values();
        let func = Arc::clone(task.template().func());
        let ctx = TaskContext::new(self, &task, worker);
        let payload = match panic::catch_unwind(AssertUnwindSafe(|| func(&ctx, task.params(), &deps))) {
            Ok(payload) => payload,
            Err(_) => {
                tracing::error!(domain = self.id, task = %guid, template = task.template().name(), "task body panicked");
                Guid::ERROR
            },
        };
        task.mark_completed();
        self.finish_task(&task, payload);
    }

    /// Report a completed task to its output event and scopes.
    fn finish_task(
        &self,
        task: &Task,
        payload: Guid,
    ) {
        match task.own_scope() {
            // The scope's latch satisfies the output event when it closes.
            Some(own) => self.close_scope_member(own),
            None => {
                let output = task.output_event();
                if !output.is_null() {
                    if let Err(err) = self.satisfy_local_event(output, payload, 0) {
                        tracing::warn!(domain = self.id, task = %task.guid(), %output, %err, "output event not satisfied");
                    }
                }
                if let Some(scope) = task.scope() {
                    self.close_scope_member(scope);
                }
            },
        }
        self.retire_task(task);
    }

    pub(crate) fn retire_task(
        &self,
        task: &Task,
    ) {
        self.discard(task.guid());
        if self.live_tasks.fetch_sub(1, Ordering::AcqRel) == 0 {
            fatal_invariant!("live task count of domain {} went negative", self.id);
        }
    }
}
