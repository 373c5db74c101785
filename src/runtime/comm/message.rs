//! Messages exchanged between policy domains.

use serde::{Deserialize, Serialize};

use crate::runtime::datablock::AccessMode;
use crate::runtime::error::RuntimeError;
use crate::runtime::event::Waiter;
use crate::runtime::guid::{DomainId, Guid};
use crate::runtime::task::{DepCount, TaskBuilder};

/// Correlates a request with its reply.
pub type Ticket = u64;

/// Which "already resolved" refusal a status of 1 stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Refusal {
    SlotBound,
    SlotSatisfied,
    EventSatisfied,
}

impl Refusal {
    pub fn of(err: &RuntimeError) -> Option<Self> {
        match err {
            RuntimeError::SlotAlreadyBound { .. } => Some(Refusal::SlotBound),
            RuntimeError::SlotAlreadySatisfied { .. } => Some(Refusal::SlotSatisfied),
            RuntimeError::EventAlreadySatisfied(_) => Some(Refusal::EventSatisfied),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Create a task on the receiving domain. Templates travel by name.
    CreateTask {
        ticket: Ticket,
        template: String,
        paramc: u32,
        depc: DepCount,
        builder: TaskBuilder,
        /// Latch of the creator's finish scope, NULL outside any scope.
        parent_scope: Guid,
    },
    /// Bind a slot of a task owned by the receiver.
    AddDependence {
        ticket: Ticket,
        source: Guid,
        task: Guid,
        slot: u32,
        mode: AccessMode,
    },
    /// Register a dependent on an event owned by the receiver.
    RegisterWaiter { event: Guid, waiter: Waiter },
    /// User-level satisfy of an event owned by the receiver.
    Satisfy { event: Guid, payload: Guid, slot: u32 },
    /// Delivery of a fired event to a dependent owned by the receiver.
    SatisfySlot { target: Guid, payload: Guid, slot: u32 },
    /// A dependent registered on a remote event could not be served.
    FailSlot { target: Guid, slot: u32 },
    /// Ask the owner for a copy of a data-block.
    CloneRequest { ticket: Ticket, datablock: Guid },
    /// Contents of a data-block, `None` when it no longer exists.
    CloneResponse {
        ticket: Ticket,
        datablock: Guid,
        bytes: Option<Vec<u8>>,
    },
    /// Push a copy of a data-block to the receiver.
    ClonePush {
        ticket: Ticket,
        origin: Guid,
        bytes: Vec<u8>,
    },
    /// Answer to `CreateTask`, `AddDependence` or `ClonePush`. A zero
    /// status means success.
    Reply {
        ticket: Ticket,
        status: u8,
        refusal: Option<Refusal>,
        guids: Vec<Guid>,
    },
    Shutdown,
    ShutdownAck,
    /// Raised locally by the fabric when a peer is lost.
    PeerLost { domain: DomainId },
}

impl Message {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Message::CreateTask { .. } => "CreateTask",
            Message::AddDependence { .. } => "AddDependence",
            Message::RegisterWaiter { .. } => "RegisterWaiter",
            Message::Satisfy { .. } => "Satisfy",
            Message::SatisfySlot { .. } => "SatisfySlot",
            Message::FailSlot { .. } => "FailSlot",
            Message::CloneRequest { .. } => "CloneRequest",
            Message::CloneResponse { .. } => "CloneResponse",
            Message::ClonePush { .. } => "ClonePush",
            Message::Reply { .. } => "Reply",
            Message::Shutdown => "Shutdown",
            Message::ShutdownAck => "ShutdownAck",
            Message::PeerLost { .. } => "PeerLost",
        }
    }
}

/// A message in transit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: DomainId,
    pub to: DomainId,
    /// Per (sender, receiver) sequence number when sequencing is enabled.
    pub seq: Option<u64>,
    pub message: Message,
}
