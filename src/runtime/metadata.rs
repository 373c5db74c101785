//! Runtime object metadata
//!
//! What a GUID resolves to. Records are reference counted so a resolved
//! object stays valid for the caller even if its GUID is released
//! concurrently.

use std::sync::Arc;

use super::datablock::DataBlock;
use super::error::{Result, RuntimeError};
use super::event::Event;
use super::guid::{Guid, GuidKind};
use super::task::{Task, TaskTemplate};

#[derive(Debug, Clone)]
pub enum Metadata {
    Template(Arc<TaskTemplate>),
    Task(Arc<Task>),
    Event(Arc<Event>),
    DataBlock(Arc<DataBlock>),
}

impl Metadata {
    pub fn kind(&self) -> GuidKind {
        match self {
            Metadata::Template(_) => GuidKind::Template,
            Metadata::Task(_) => GuidKind::Task,
            Metadata::Event(e) => e.kind().guid_kind(),
            Metadata::DataBlock(_) => GuidKind::DataBlock,
        }
    }

    pub fn guid(&self) -> Guid {
        match self {
            Metadata::Template(t) => t.guid(),
            Metadata::Task(t) => t.guid(),
            Metadata::Event(e) => e.guid(),
            Metadata::DataBlock(d) => d.guid(),
        }
    }

    pub fn into_template(self) -> Result<Arc<TaskTemplate>> {
        match self {
            Metadata::Template(t) => Ok(t),
            other => Err(RuntimeError::wrong_kind(other.guid(), "template")),
        }
    }

    pub fn into_task(self) -> Result<Arc<Task>> {
        match self {
            Metadata::Task(t) => Ok(t),
            other => Err(RuntimeError::wrong_kind(other.guid(), "task")),
        }
    }

    pub fn into_event(self) -> Result<Arc<Event>> {
        match self {
            Metadata::Event(e) => Ok(e),
            other => Err(RuntimeError::wrong_kind(other.guid(), "event")),
        }
    }

    pub fn into_datablock(self) -> Result<Arc<DataBlock>> {
        match self {
            Metadata::DataBlock(d) => Ok(d),
            other => Err(RuntimeError::wrong_kind(other.guid(), "data-block")),
        }
    }
}
