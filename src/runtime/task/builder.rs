//! Task creation arguments.

use serde::{Deserialize, Serialize};

use super::{Affinity, SchedHint, TaskPriority, TaskProps};
use crate::runtime::event::EventKind;
use crate::runtime::guid::{DomainId, Guid};

/// Builder for a task creation request.
///
/// ```ignore
/// let task = domain.create_task(
///     TaskBuilder::new(template)
///         .params(&[n])
///         .output(EventKind::Sticky)
///         .finish(),
/// )?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBuilder {
    pub(crate) template: Guid,
    pub(crate) params: Vec<u64>,
    pub(crate) depv: Option<Vec<Guid>>,
    pub(crate) props: TaskProps,
    pub(crate) hint: SchedHint,
    pub(crate) output: Option<EventKind>,
}

impl TaskBuilder {
    /// Create a new task builder.
    #[inline]
    pub fn new(template: Guid) -> Self {
        TaskBuilder {
            template,
            params: Vec::new(),
            depv: None,
            props: TaskProps::NONE,
            hint: SchedHint::default(),
            output: None,
        }
    }

    #[inline]
    pub fn template(&self) -> Guid {
        self.template
    }

    /// Set the parameter vector.
    #[inline]
    pub fn params(
        mut self,
        params: &[u64],
    ) -> Self {
        self.params = params.to_vec();
        self
    }

    /// Initial producers, one per slot. `Guid::UNINITIALIZED` leaves a
    /// slot unbound; `Guid::NULL` satisfies it immediately.
    #[inline]
    pub fn depv(
        mut self,
        depv: &[Guid],
    ) -> Self {
        self.depv = Some(depv.to_vec());
        self
    }

    /// Open a finish scope around the task.
    #[inline]
    pub fn finish(mut self) -> Self {
        self.props = self.props | TaskProps::FINISH;
        self
    }

    /// Request an output event of the given kind.
    #[inline]
    pub fn output(
        mut self,
        kind: EventKind,
    ) -> Self {
        self.output = Some(kind);
        self
    }

    /// Set the task priority.
    #[inline]
    pub fn priority(
        mut self,
        priority: TaskPriority,
    ) -> Self {
        self.hint.priority = priority;
        self
    }

    /// Pin to a worker of the creating domain.
    #[inline]
    pub fn on_worker(
        mut self,
        worker: usize,
    ) -> Self {
        self.hint.affinity = Affinity::Worker(worker);
        self
    }

    /// Place the task in another policy domain.
    #[inline]
    pub fn on_domain(
        mut self,
        domain: DomainId,
    ) -> Self {
        self.hint.affinity = Affinity::Domain(domain);
        self
    }
}
