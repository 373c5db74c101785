//! What a running task body can do.

use std::fmt;

use super::{CreatedTask, PolicyDomain};
use crate::runtime::datablock::{AccessMode, DbView};
use crate::runtime::error::Result;
use crate::runtime::event::{EventKind, EventParams};
use crate::runtime::guid::{DomainId, Guid, GuidKind, GuidRange};
use crate::runtime::task::{DepCount, Task, TaskBuilder, TaskFn};

/// Handle passed to a task body. Tasks created through it join the
/// running task's finish scope.
pub struct TaskContext<'a> {
    domain: &'a PolicyDomain,
    task: &'a Task,
    worker: usize,
}

impl fmt::Debug for TaskContext<'_> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("domain", &self.domain.id())
            .field("task", &self.task.guid())
            .field("worker", &self.worker)
            .finish()
    }
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        domain: &'a PolicyDomain,
        task: &'a Task,
        worker: usize,
    ) -> Self {
        TaskContext {
            domain,
            task,
            worker,
        }
    }

    /// GUID of the running task.
    #[inline]
    pub fn guid(&self) -> Guid {
        self.task.guid()
    }

    #[inline]
    pub fn worker(&self) -> usize {
        self.worker
    }

    #[inline]
    pub fn domain_id(&self) -> DomainId {
        self.domain.id()
    }

    pub fn num_domains(&self) -> usize {
        self.domain.fabric().num_domains()
    }

    /// Output event of the running task, NULL if it has none.
    pub fn output_event(&self) -> Guid {
        self.task.output_event()
    }

    /// Create a child task. Allowed during shutdown so running work can
    /// finish its subtree.
    pub fn create_task(
        &self,
        builder: TaskBuilder,
    ) -> Result<CreatedTask> {
        self.domain
            .create_task_in(self.task.child_scope(), false, builder)
    }

    pub fn template_create(
        &self,
        name: &str,
        func: TaskFn,
        paramc: u32,
        depc: DepCount,
    ) -> Result<Guid> {
        self.domain.template_create(name, func, paramc, depc)
    }

    pub fn event_create(
        &self,
        kind: EventKind,
        params: EventParams,
    ) -> Result<Guid> {
        self.domain.event_create(kind, params)
    }

    pub fn event_destroy(
        &self,
        event: Guid,
    ) -> Result<()> {
        self.domain.event_destroy(event)
    }

    pub fn satisfy(
        &self,
        event: Guid,
        payload: Guid,
    ) -> Result<()> {
        self.domain.satisfy(event, payload)
    }

    pub fn satisfy_slot(
        &self,
        event: Guid,
        payload: Guid,
        slot: u32,
    ) -> Result<()> {
        self.domain.satisfy_slot(event, payload, slot)
    }

    pub fn add_dependence(
        &self,
        source: Guid,
        dest: Guid,
        slot: u32,
        mode: AccessMode,
    ) -> Result<()> {
        self.domain.add_dependence(source, dest, slot, mode)
    }

    pub fn seal_dependences(
        &self,
        task: Guid,
    ) -> Result<()> {
        self.domain.seal_dependences(task)
    }

    pub fn db_create(
        &self,
        bytes: Vec<u8>,
    ) -> Result<Guid> {
        self.domain.db_create(bytes)
    }

    pub fn db_acquire(
        &self,
        datablock: Guid,
        mode: AccessMode,
    ) -> Result<DbView> {
        self.domain.db_acquire(datablock, mode)
    }

    pub fn db_destroy(
        &self,
        datablock: Guid,
    ) -> Result<()> {
        self.domain.db_destroy(datablock)
    }

    pub fn db_clone_to(
        &self,
        datablock: Guid,
        target: DomainId,
    ) -> Result<Guid> {
        self.domain.db_clone_to(datablock, target)
    }

    pub fn reserve(
        &self,
        count: u64,
        kind: GuidKind,
    ) -> Result<GuidRange> {
        self.domain.reserve(count, kind)
    }

    /// Ask the runtime to shut down once the caller returns.
    pub fn shutdown(&self) {
        self.domain.request_shutdown();
    }
}
