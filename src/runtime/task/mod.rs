//! Tasks and task templates
//!
//! A task is a non-blocking function invocation that becomes runnable once
//! every dependency slot is resolved. Readiness is tracked by a single
//! atomic counter initialised to the slot count plus one creation guard:
//! whoever moves it to zero owns the transition to `Runnable`, so a task is
//! handed to the scheduler exactly once.

mod builder;
mod slot;


use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use builder::TaskBuilder;
pub use slot::{DepSlot, SlotRefusal, SlotState};

use super::datablock::AccessMode;
use super::domain::TaskContext;
use super::error::{Result, RuntimeError};
use super::finish::ScopeHandle;
use super::guid::{DomainId, Guid, GuidKind};
use crate::fatal_invariant;

/// Task body. Receives the parameters and the resolved dependencies and
/// returns the payload for the task's output event.
pub type TaskFn = Arc<dyn Fn(&TaskContext<'_>, &[u64], &[DepValue]) -> Guid + Send + Sync>;

/// Wrap a closure as a [`TaskFn`].
pub fn task_fn<F>(func: F) -> TaskFn
where
    F: Fn(&TaskContext<'_>, &[u64], &[DepValue]) -> Guid + Send + Sync + 'static,
{
    Arc::new(func)
}

/// Number of dependency slots declared by a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepCount {
    Fixed(u32),
    /// Slots are added one at a time and closed with `seal_dependences`.
    Deferred,
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for dependencies.
    Created,
    /// All dependencies resolved; queued or about to be.
    Runnable,
    /// Currently executing on a worker.
    Running,
    /// Finished executing.
    Completed,
    /// Destroyed before it became runnable.
    Cancelled,
}

impl TaskState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => TaskState::Created,
            1 => TaskState::Runnable,
            2 => TaskState::Running,
            3 => TaskState::Completed,
            _ => TaskState::Cancelled,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            TaskState::Created => 0,
            TaskState::Runnable => 1,
            TaskState::Running => 2,
            TaskState::Completed => 3,
            TaskState::Cancelled => 4,
        }
    }
}

/// Task priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Default, Serialize, Deserialize)]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// Where a task would like to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Affinity {
    #[default]
    Any,
    /// A specific worker of the creating domain.
    Worker(usize),
    /// Another (or the same) policy domain.
    Domain(DomainId),
}

/// Scheduling hint attached at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchedHint {
    pub priority: TaskPriority,
    pub affinity: Affinity,
}

/// Creation properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskProps(u16);

impl TaskProps {
    pub const NONE: TaskProps = TaskProps(0);
    /// The task opens a finish scope covering everything it transitively creates.
    pub const FINISH: TaskProps = TaskProps(1);

    #[inline]
    pub fn contains(
        self,
        other: TaskProps,
    ) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TaskProps {
    type Output = TaskProps;

    fn bitor(
        self,
        rhs: TaskProps,
    ) -> TaskProps {
        TaskProps(self.0 | rhs.0)
    }
}

/// How a resolved slot ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Satisfied,
    /// The producer lives in a domain that became unreachable.
    Unreachable,
}

/// A resolved dependency as seen by the task body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepValue {
    pub guid: Guid,
    pub mode: AccessMode,
    pub status: SlotStatus,
}

impl DepValue {
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.status == SlotStatus::Satisfied
    }
}

/// Reusable task description: function, parameter count, slot count.
pub struct TaskTemplate {
    guid: Guid,
    name: String,
    func: TaskFn,
    paramc: u32,
    depc: DepCount,
}

impl fmt::Debug for TaskTemplate {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskTemplate")
            .field("guid", &self.guid)
            .field("name", &self.name)
            .field("paramc", &self.paramc)
            .field("depc", &self.depc)
            .finish()
    }
}

impl TaskTemplate {
    pub fn new(
        guid: Guid,
        name: impl Into<String>,
        func: TaskFn,
        paramc: u32,
        depc: DepCount,
    ) -> Self {
        TaskTemplate {
            guid,
            name: name.into(),
            func,
            paramc,
            depc,
        }
    }

    #[inline]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn func(&self) -> &TaskFn {
        &self.func
    }

    #[inline]
    pub fn paramc(&self) -> u32 {
        self.paramc
    }

    #[inline]
    pub fn depc(&self) -> DepCount {
        self.depc
    }
}

/// Everything a task carries besides its slots.
pub struct TaskInit {
    pub template: Arc<TaskTemplate>,
    pub params: Vec<u64>,
    pub depc: u32,
    pub props: TaskProps,
    pub hint: SchedHint,
    pub scope: Option<ScopeHandle>,
    pub own_scope: Option<ScopeHandle>,
    pub output_event: Guid,
}

pub struct Task {
    guid: Guid,
    template: Arc<TaskTemplate>,
    params: Box<[u64]>,
    slots: RwLock<Vec<DepSlot>>,
    deferred: bool,
    sealed: AtomicBool,
    /// Unresolved slots plus the creation guard.
    outstanding: AtomicU32,
    state: AtomicU8,
    props: TaskProps,
    hint: SchedHint,
    scope: Option<ScopeHandle>,
    own_scope: Option<ScopeHandle>,
    output_event: Guid,
    pending_fetches: AtomicU32,
}

impl fmt::Debug for Task {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Task")
            .field("guid", &self.guid)
            .field("template", &self.template.name())
            .field("state", &self.state())
            .field("outstanding", &self.outstanding.load(Ordering::Relaxed))
            .field("props", &self.props)
            .finish()
    }
}

impl Task {
    pub fn new(
        guid: Guid,
        init: TaskInit,
    ) -> Self {
        let deferred = init.template.depc() == DepCount::Deferred;
        Task {
            guid,
            params: init.params.into_boxed_slice(),
            slots: RwLock::new((0..init.depc).map(|_| DepSlot::new()).collect()),
            deferred,
            sealed: AtomicBool::new(!deferred),
            outstanding: AtomicU32::new(init.depc + 1),
            state: AtomicU8::new(TaskState::Created.as_u8()),
            props: init.props,
            hint: init.hint,
            scope: init.scope,
            own_scope: init.own_scope,
            output_event: init.output_event,
            pending_fetches: AtomicU32::new(0),
            template: init.template,
        }
    }

    #[inline]
    pub fn guid(&self) -> Guid {
        self.guid
    }

    #[inline]
    pub fn template(&self) -> &Arc<TaskTemplate> {
        &self.template
    }

    #[inline]
    pub fn params(&self) -> &[u64] {
        &self.params
    }

    #[inline]
    pub fn props(&self) -> TaskProps {
        self.props
    }

    #[inline]
    pub fn hint(&self) -> SchedHint {
        self.hint
    }

    #[inline]
    pub fn output_event(&self) -> Guid {
        self.output_event
    }

    /// Finish scope the task was created in.
    #[inline]
    pub fn scope(&self) -> Option<&ScopeHandle> {
        self.scope.as_ref()
    }

    /// Scope opened by the task itself when it has the finish property.
    #[inline]
    pub fn own_scope(&self) -> Option<&ScopeHandle> {
        self.own_scope.as_ref()
    }

    /// Scope that tasks created from inside this task's body join.
    pub fn child_scope(&self) -> Option<&ScopeHandle> {
        self.own_scope.as_ref().or(self.scope.as_ref())
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn depc(&self) -> u32 {
        self.slots.read().len() as u32
    }

    #[inline]
    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    /// Resolved-slot snapshot plus the payload of one slot.
    pub fn slot_state(
        &self,
        slot: u32,
    ) -> Option<(SlotState, Guid)> {
        self.slots
            .read()
            .get(slot as usize)
            .map(|s| (s.state(), s.payload()))
    }

    /// Bound slots still waiting on their producer.
    pub fn pending_sources(&self) -> Vec<(u32, Guid)> {
        self.slots
            .read()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state() == SlotState::Bound)
            .map(|(slot, s)| (slot as u32, s.source()))
            .collect()
    }

    /// Make sure `slot` exists, growing a deferred task that is not sealed.
    fn ensure_slot(
        &self,
        slot: u32,
    ) -> Result<()> {
        let len = self.slots.read().len() as u32;
        if slot < len {
            return Ok(());
        }
        if !self.deferred || self.sealed.load(Ordering::Acquire) {
            return Err(RuntimeError::IndexOutOfRange {
                target: self.guid,
                slot,
                depc: len,
            });
        }
        let mut slots = self.slots.write();
        let len = slots.len() as u32;
        if self.sealed.load(Ordering::Acquire) && slot >= len {
            return Err(RuntimeError::IndexOutOfRange {
                target: self.guid,
                slot,
                depc: len,
            });
        }
        if slot >= len {
            let added = slot + 1 - len;
            // Counted before any of the new slots can resolve.
            self.outstanding.fetch_add(added, Ordering::AcqRel);
            slots.extend((0..added).map(|_| DepSlot::new()));
        }
        Ok(())
    }

    /// Bind `slot` to a producer.
    pub fn bind_slot(
        &self,
        slot: u32,
        source: Guid,
        mode: AccessMode,
    ) -> Result<()> {
        self.ensure_slot(slot)?;
        let slots = self.slots.read();
        slots[slot as usize]
            .bind(source, mode)
            .map_err(|refusal| self.refusal(slot, refusal))
    }

    /// Resolve `slot` with `payload`. Returns `true` when this made the task
    /// ready.
    pub fn satisfy_slot(
        &self,
        slot: u32,
        payload: Guid,
        mode: Option<AccessMode>,
    ) -> Result<bool> {
        self.ensure_slot(slot)?;
        {
            let slots = self.slots.read();
            slots[slot as usize]
                .satisfy(payload, mode)
                .map_err(|refusal| self.refusal(slot, refusal))?;
        }
        Ok(self.decrement())
    }

    /// Resolve `slot` as failed.
    pub fn fail_slot(
        &self,
        slot: u32,
    ) -> Result<bool> {
        self.ensure_slot(slot)?;
        {
            let slots = self.slots.read();
            slots[slot as usize]
                .fail()
                .map_err(|refusal| self.refusal(slot, refusal))?;
        }
        Ok(self.decrement())
    }

    fn refusal(
        &self,
        slot: u32,
        refusal: SlotRefusal,
    ) -> RuntimeError {
        match refusal {
            SlotRefusal::AlreadyBound => RuntimeError::SlotAlreadyBound {
                task: self.guid,
                slot,
            },
            SlotRefusal::AlreadyResolved => RuntimeError::SlotAlreadySatisfied {
                task: self.guid,
                slot,
            },
        }
    }

    /// Drop the creation guard. Returns `true` when this made the task ready.
    pub fn release_guard(&self) -> bool {
        self.decrement()
    }

    /// Close a deferred task's slot list and drop its creation guard.
    pub fn seal(&self) -> Result<bool> {
        if !self.deferred {
            return Err(RuntimeError::InvalidArgument(format!(
                "task {} does not have a deferred dependence count",
                self.guid
            )));
        }
        if self.sealed.swap(true, Ordering::AcqRel) {
            return Err(RuntimeError::InvalidArgument(format!(
                "task {} is already sealed",
                self.guid
            )));
        }
        // Taking the write lock waits out any slot growth in flight.
        drop(self.slots.write());
        Ok(self.decrement())
    }

    fn decrement(&self) -> bool {
        let previous = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if previous == 0 {
            fatal_invariant!("dependence counter of task {} went negative", self.guid);
        }
        previous == 1
    }

    /// Remaining unresolved slots plus the creation guard, if still held.
    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Claim the Created -> Runnable transition. Fails if the task was
    /// cancelled in the meantime.
    pub fn mark_runnable(&self) -> bool {
        self.transition(TaskState::Created, TaskState::Runnable)
    }

    pub fn mark_running(&self) -> bool {
        self.transition(TaskState::Runnable, TaskState::Running)
    }

    pub fn mark_completed(&self) -> bool {
        self.transition(TaskState::Running, TaskState::Completed)
    }

    /// Cancel a task that has not become runnable.
    pub fn cancel(&self) -> bool {
        self.transition(TaskState::Created, TaskState::Cancelled)
    }

    fn transition(
        &self,
        from: TaskState,
        to: TaskState,
    ) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Satisfied slots whose payload is a data-block owned by another domain.
    pub fn remote_payloads(
        &self,
        local: DomainId,
    ) -> Vec<(u32, Guid)> {
        self.slots
            .read()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state() == SlotState::Satisfied && s.mode() != AccessMode::Null)
            .map(|(i, s)| (i as u32, s.payload()))
            .filter(|(_, g)| g.kind() == Some(GuidKind::DataBlock) && g.location() != local)
            .collect()
    }

    pub(crate) fn set_pending_fetches(
        &self,
        count: u32,
    ) {
        self.pending_fetches.store(count, Ordering::Release);
    }

    /// Record one finished fetch. Returns `true` for the last one.
    pub(crate) fn fetch_done(&self) -> bool {
        self.pending_fetches.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub(crate) fn patch_slot(
        &self,
        slot: u32,
        payload: Option<Guid>,
    ) {
        if let Some(s) = self.slots.read().get(slot as usize) {
            match payload {
                Some(guid) => s.patch_payload(guid),
                None => s.mark_failed(),
            }
        }
    }

    /// Values handed to the task body.
    pub fn dep_values(&self) -> Vec<DepValue> {
        self.slots
            .read()
            .iter()
            .map(|s| DepValue {
                guid: s.payload(),
                mode: s.mode(),
                status: match s.state() {
                    SlotState::Failed => SlotStatus::Unreachable,
                    _ => SlotStatus::Satisfied,
                },
            })
            .collect()
    }
}
