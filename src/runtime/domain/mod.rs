//! Policy domains
//!
//! A policy domain owns one GUID provider, one allocator, one scheduler and
//! its worker threads. Objects owned by another domain are only ever reached
//! through messages; the methods here route on the GUID's location bits and
//! either act locally or forward.
//!
//! The dependency engine lives in `engine`, message handling in `remote`.

mod context;
mod engine;
mod remote;

#[cfg(test)]
mod tests;

pub use context::TaskContext;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;

use remote::{PendingFetch, PendingReply};

use super::comm::{Fabric, Ticket};
use super::datablock::{AccessMode, DataBlock, DbView};
use super::error::{Result, RuntimeError};
use super::event::{Event, EventKind, EventParams, Waiter};
use super::guid::{DomainId, Guid, GuidKind, GuidProvider, GuidRange, LabelMode, ProviderStats};
use super::memory::DomainAllocator;
use super::metadata::Metadata;
use super::scheduler::{Scheduler, StatsSnapshot};
use super::task::{DepCount, Task, TaskBuilder, TaskFn, TaskTemplate};
use crate::util::config::RuntimeConfig;

/// Task functions by template name. Shared by every domain of a runtime so
/// a template can be instantiated remotely by name.
#[derive(Default)]
pub struct FunctionTable {
    funcs: RwLock<HashMap<String, TaskFn>>,
}

impl fmt::Debug for FunctionTable {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("FunctionTable")
            .field("len", &self.len())
            .finish()
    }
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `func` under `name`, replacing any previous entry.
    pub fn register(
        &self,
        name: &str,
        func: TaskFn,
    ) {
        if self.funcs.write().insert(name.to_string(), func).is_some() {
            tracing::debug!(name, "task function replaced");
        }
    }

    pub fn get(
        &self,
        name: &str,
    ) -> Option<TaskFn> {
        self.funcs.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.funcs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shutdown request raised from inside a task and joined from outside.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        let mut raised = self.raised.lock();
        if !*raised {
            *raised = true;
            tracing::info!("shutdown requested");
        }
        self.cond.notify_all();
    }

    pub fn is_raised(&self) -> bool {
        *self.raised.lock()
    }

    /// Block until raised. Returns `false` on timeout.
    pub fn wait(
        &self,
        timeout: Option<Duration>,
    ) -> bool {
        let mut raised = self.raised.lock();
        while !*raised {
            match timeout {
                Some(limit) => {
                    if self.cond.wait_for(&mut raised, limit).timed_out() {
                        return *raised;
                    }
                },
                None => self.cond.wait(&mut raised),
            }
        }
        true
    }
}

/// A freshly created task and its output event (NULL if none).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedTask {
    pub task: Guid,
    pub output: Guid,
}

/// Per-domain counters, for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DomainStats {
    pub domain: DomainId,
    pub live_tasks: usize,
    pub guids: ProviderStats,
    pub metadata_bytes: usize,
    pub scheduler: StatsSnapshot,
}

pub struct PolicyDomain {
    id: DomainId,
    provider: GuidProvider,
    allocator: DomainAllocator,
    scheduler: Arc<Scheduler>,
    fabric: Arc<Fabric>,
    functions: Arc<FunctionTable>,
    signal: Arc<ShutdownSignal>,
    /// Local template for each task function name, for remote creation.
    templates: Mutex<HashMap<String, Guid>>,
    accepting: AtomicBool,
    /// Tasks created and not yet completed or destroyed.
    live_tasks: AtomicUsize,
    tickets: AtomicU64,
    replies: Mutex<HashMap<Ticket, PendingReply>>,
    /// Local task slots waiting on an event owned by another domain.
    remote_waits: Mutex<HashMap<(Guid, u32), DomainId>>,
    fetches: Mutex<HashMap<Ticket, PendingFetch>>,
    /// Decrements each peer still owes a local finish scope latch.
    scope_credits: Mutex<HashMap<(DomainId, Guid), i64>>,
    shutdown_acks: AtomicUsize,
    comm_running: AtomicBool,
    comm_thread: Mutex<Option<thread::JoinHandle<()>>>,
    reply_timeout: Duration,
}

impl fmt::Debug for PolicyDomain {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("PolicyDomain")
            .field("id", &self.id)
            .field("provider", &self.provider.kind())
            .field("allocator", &self.allocator.kind())
            .field("live_tasks", &self.live_tasks())
            .finish()
    }
}

impl PolicyDomain {
    pub fn new(
        id: DomainId,
        config: &RuntimeConfig,
        fabric: Arc<Fabric>,
        functions: Arc<FunctionTable>,
        signal: Arc<ShutdownSignal>,
    ) -> Self {
        let allocator = DomainAllocator::new(config.allocator.kind, config.allocator.capacity_bytes);
        let provider = GuidProvider::new(
            config.guid.provider,
            id,
            config.guid.max_entries,
            allocator.clone(),
        );
        PolicyDomain {
            id,
            provider,
            allocator,
            scheduler: Arc::new(Scheduler::new(id, config.scheduler.clone())),
            fabric,
            functions,
            signal,
            templates: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            live_tasks: AtomicUsize::new(0),
            tickets: AtomicU64::new(1),
            replies: Mutex::new(HashMap::new()),
            remote_waits: Mutex::new(HashMap::new()),
            fetches: Mutex::new(HashMap::new()),
            scope_credits: Mutex::new(HashMap::new()),
            shutdown_acks: AtomicUsize::new(0),
            comm_running: AtomicBool::new(false),
            comm_thread: Mutex::new(None),
            reply_timeout: config.comm.reply_timeout(),
        }
    }

    /// Start the workers and the comm thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let domain = Arc::clone(self);
        self.scheduler
            .start(move |worker, task| domain.execute(worker, task))?;
        self.start_comm()?;
        tracing::debug!(domain = self.id, provider = ?self.provider.kind(), "domain started");
        Ok(())
    }

    #[inline]
    pub fn id(&self) -> DomainId {
        self.id
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    #[inline]
    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    #[inline]
    pub(crate) fn provider(&self) -> &GuidProvider {
        &self.provider
    }

    #[inline]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    #[inline]
    pub fn live_tasks(&self) -> usize {
        self.live_tasks.load(Ordering::Acquire)
    }

    /// No live task and nothing queued.
    pub fn is_idle(&self) -> bool {
        self.live_tasks() == 0 && self.scheduler.queued() == 0
    }

    pub fn stats(&self) -> DomainStats {
        DomainStats {
            domain: self.id,
            live_tasks: self.live_tasks(),
            guids: self.provider.stats(),
            metadata_bytes: self.allocator.in_use(),
            scheduler: self.scheduler.stats(),
        }
    }

    // ---- resolution ----

    fn local(
        &self,
        guid: Guid,
    ) -> Result<()> {
        if guid.location() == self.id {
            Ok(())
        } else {
            Err(RuntimeError::InvalidArgument(format!(
                "{guid} is owned by domain {}, not {}",
                guid.location(),
                self.id
            )))
        }
    }

    pub(crate) fn template(
        &self,
        guid: Guid,
    ) -> Result<Arc<TaskTemplate>> {
        self.provider.resolve(guid)?.into_template()
    }

    pub(crate) fn task(
        &self,
        guid: Guid,
    ) -> Result<Arc<Task>> {
        self.provider.resolve(guid)?.into_task()
    }

    pub(crate) fn event(
        &self,
        guid: Guid,
    ) -> Result<Arc<Event>> {
        self.provider.resolve(guid)?.into_event()
    }

    pub(crate) fn datablock(
        &self,
        guid: Guid,
    ) -> Result<Arc<DataBlock>> {
        self.provider.resolve(guid)?.into_datablock()
    }

    // ---- templates ----

    /// Create a template and make its function reachable by name from every
    /// domain.
    pub fn template_create(
        &self,
        name: &str,
        func: TaskFn,
        paramc: u32,
        depc: DepCount,
    ) -> Result<Guid> {
        self.functions.register(name, Arc::clone(&func));
        let (guid, _) = self.provider.create(GuidKind::Template, name.len(), |guid| {
            Metadata::Template(Arc::new(TaskTemplate::new(guid, name, func, paramc, depc)))
        })?;
        self.templates
            .lock()
            .entry(name.to_string())
            .or_insert(guid);
        tracing::debug!(domain = self.id, template = %guid, name, paramc, ?depc, "template created");
        Ok(guid)
    }

    pub fn template_destroy(
        &self,
        guid: Guid,
    ) -> Result<()> {
        self.local(guid)?;
        let template = self.template(guid)?;
        self.templates
            .lock()
            .retain(|_, cached| *cached != guid);
        self.provider.release(template.guid())?;
        Ok(())
    }

    // ---- tasks ----

    /// Create a task from outside any task body. Refused once shutdown has
    /// begun.
    pub fn create_task(
        &self,
        builder: TaskBuilder,
    ) -> Result<CreatedTask> {
        self.create_task_in(None, true, builder)
    }

    /// Destroy a task that has not become runnable.
    pub fn task_destroy(
        &self,
        guid: Guid,
    ) -> Result<()> {
        self.local(guid)?;
        let task = self.task(guid)?;
        if !task.cancel() {
            return Err(RuntimeError::DestroyBusy(guid));
        }
        self.remote_waits
            .lock()
            .retain(|(target, _), _| *target != guid);
        for (slot, source) in task.pending_sources() {
            if source.location() != self.id || !source.is_event() {
                continue;
            }
            if let Ok(event) = self.event(source) {
                event.unregister(Waiter::new(guid, slot));
            }
        }
        // A cancelled task leaves its scopes as if it had run.
        match (task.own_scope(), task.scope()) {
            (Some(own), _) => self.close_scope_member(own),
            (None, Some(scope)) => self.close_scope_member(scope),
            (None, None) => {},
        }
        tracing::debug!(domain = self.id, task = %guid, "task destroyed");
        self.retire_task(&task);
        Ok(())
    }

    /// Close the slot list of a task created with a deferred count.
    pub fn seal_dependences(
        &self,
        guid: Guid,
    ) -> Result<()> {
        self.local(guid)?;
        let task = self.task(guid)?;
        if task.seal()? {
            self.make_runnable(&task);
        }
        Ok(())
    }

    // ---- events ----

    pub fn event_create(
        &self,
        kind: EventKind,
        params: EventParams,
    ) -> Result<Guid> {
        Ok(self.new_event(kind, params)?.guid())
    }

    /// Create an event under a GUID taken from a reserved range.
    pub fn event_create_labeled(
        &self,
        guid: Guid,
        mode: LabelMode,
        kind: EventKind,
        params: EventParams,
    ) -> Result<()> {
        if guid.kind() != Some(kind.guid_kind()) {
            return Err(RuntimeError::wrong_kind(guid, kind.guid_kind().name()));
        }
        self.provider.create_labeled(guid, mode, 0, |guid| {
            Metadata::Event(Arc::new(Event::new(guid, kind, params)))
        })?;
        Ok(())
    }

    pub fn event_destroy(
        &self,
        guid: Guid,
    ) -> Result<()> {
        self.local(guid)?;
        let event = self.event(guid)?;
        // A fired once or latch event is already retired; holders left over
        // from a share only drop their hold.
        if !event.is_retired() {
            event.check_idle()?;
        }
        // Other holders keep the event usable until the last one destroys it.
        if self.provider.release(guid)? {
            event.close();
            tracing::trace!(domain = self.id, event = %guid, "event destroyed");
        }
        Ok(())
    }

    pub fn satisfy(
        &self,
        event: Guid,
        payload: Guid,
    ) -> Result<()> {
        self.satisfy_slot(event, payload, 0)
    }

    /// Satisfy one slot of an event, wherever it lives.
    pub fn satisfy_slot(
        &self,
        event: Guid,
        payload: Guid,
        slot: u32,
    ) -> Result<()> {
        if !event.is_event() {
            return Err(RuntimeError::wrong_kind(event, "event"));
        }
        if event.location() != self.id {
            return self.send(
                event.location(),
                super::comm::Message::Satisfy {
                    event,
                    payload,
                    slot,
                },
            );
        }
        self.satisfy_local_event(event, payload, slot)
    }

    /// Block the calling thread until a local event is satisfied.
    pub fn wait(
        &self,
        event: Guid,
        timeout: Option<Duration>,
    ) -> Result<Option<Guid>> {
        self.local(event)?;
        Ok(self.event(event)?.wait(timeout))
    }

    // ---- dependences ----

    /// Feed `dest` (a task slot or an event slot) from `source` (NULL, a
    /// data-block or an event).
    pub fn add_dependence(
        &self,
        source: Guid,
        dest: Guid,
        slot: u32,
        mode: AccessMode,
    ) -> Result<()> {
        if !engine::is_source(source) {
            return Err(RuntimeError::wrong_kind(source, "event or data-block"));
        }
        match dest.kind() {
            Some(GuidKind::Task) if dest.location() == self.id => {
                let task = self.task(dest)?;
                self.bind_dependence(&task, slot, source, mode)
            },
            Some(GuidKind::Task) => self.remote_add_dependence(source, dest, slot, mode),
            Some(kind) if kind.is_event() => self.feed(Waiter::new(dest, slot), source),
            _ => Err(RuntimeError::wrong_kind(dest, "task or event")),
        }
    }

    // ---- data-blocks ----

    pub fn db_create(
        &self,
        bytes: Vec<u8>,
    ) -> Result<Guid> {
        self.new_datablock(bytes, Guid::NULL)
    }

    pub fn db_create_zeroed(
        &self,
        size: usize,
    ) -> Result<Guid> {
        self.db_create(vec![0; size])
    }

    pub fn db_create_labeled(
        &self,
        guid: Guid,
        mode: LabelMode,
        bytes: Vec<u8>,
    ) -> Result<()> {
        if guid.kind() != Some(GuidKind::DataBlock) {
            return Err(RuntimeError::wrong_kind(guid, "data-block"));
        }
        let extra = bytes.len();
        self.provider.create_labeled(guid, mode, extra, |guid| {
            Metadata::DataBlock(Arc::new(DataBlock::new(guid, bytes, Guid::NULL)))
        })?;
        Ok(())
    }

    pub(crate) fn new_datablock(
        &self,
        bytes: Vec<u8>,
        origin: Guid,
    ) -> Result<Guid> {
        let extra = bytes.len();
        let (guid, _) = self.provider.create(GuidKind::DataBlock, extra, |guid| {
            Metadata::DataBlock(Arc::new(DataBlock::new(guid, bytes, origin)))
        })?;
        tracing::trace!(domain = self.id, datablock = %guid, len = extra, %origin, "data-block created");
        Ok(guid)
    }

    /// Acquire a local data-block. Remote blocks must be cloned first.
    pub fn db_acquire(
        &self,
        guid: Guid,
        mode: AccessMode,
    ) -> Result<DbView> {
        self.local(guid)?;
        Ok(self.datablock(guid)?.acquire(mode))
    }

    pub fn db_destroy(
        &self,
        guid: Guid,
    ) -> Result<()> {
        self.local(guid)?;
        self.datablock(guid)?;
        self.provider.release(guid)?;
        Ok(())
    }

    /// Copy a local data-block into `target`, returning the clone's GUID.
    pub fn db_clone_to(
        &self,
        guid: Guid,
        target: DomainId,
    ) -> Result<Guid> {
        self.local(guid)?;
        let bytes = self.datablock(guid)?.snapshot();
        if target == self.id {
            return self.new_datablock(bytes, guid);
        }
        self.push_clone(guid, bytes, target)
    }

    // ---- GUIDs ----

    /// Reserve `count` GUIDs of `kind` for labeled creation.
    pub fn reserve(
        &self,
        count: u64,
        kind: GuidKind,
    ) -> Result<GuidRange> {
        self.provider.reserve(count, kind)
    }

    /// Add a holder to a local GUID; each holder releases it once.
    pub fn share(
        &self,
        guid: Guid,
    ) -> Result<()> {
        self.provider.share(guid)
    }

    // ---- shutdown ----

    /// Raise the runtime-wide shutdown request.
    pub fn request_shutdown(&self) {
        self.signal.raise();
    }

    /// Stop accepting external work.
    pub(crate) fn begin_shutdown(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            tracing::debug!(domain = self.id, "domain no longer accepting work");
        }
    }

    /// Join the workers. Returns tasks that were queued but never ran.
    pub(crate) fn stop_workers(&self) -> Vec<Guid> {
        let dropped = self.scheduler.stop();
        if !dropped.is_empty() {
            tracing::warn!(domain = self.id, dropped = dropped.len(), "tasks dropped at shutdown");
        }
        dropped
    }

    /// Drop every remaining table entry. Returns how many were live.
    pub(crate) fn clear(&self) -> usize {
        let released = self.provider.clear();
        tracing::debug!(domain = self.id, released, "provider cleared");
        released
    }
}
