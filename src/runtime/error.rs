//! Runtime status codes
//!
//! Every recoverable failure of the engine is a [`RuntimeError`]. Internal
//! invariant violations are not errors: they go through [`fatal_invariant!`]
//! and terminate the process.

use thiserror::Error;

use super::guid::{DomainId, Guid, GuidKind};
use crate::util::config::ConfigError;

/// Result alias used by all engine operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Broad class of a [`RuntimeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed call from the user layer; the caller can fix and retry.
    User,
    /// GUID table or metadata space exhausted; retry after freeing resources.
    Resource,
    /// A remote domain could not be reached.
    Transport,
}

/// Recoverable runtime failures, reported to the call site.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("unknown or released GUID {0}")]
    UnknownGuid(Guid),

    #[error("GUID {guid} has kind {found:?}, expected {expected}")]
    WrongKind {
        guid: Guid,
        expected: &'static str,
        found: Option<GuidKind>,
    },

    #[error("{what} count mismatch for template {template}: expected {expected}, got {got}")]
    ArityMismatch {
        template: Guid,
        what: &'static str,
        expected: u32,
        got: u32,
    },

    #[error("slot {slot} of task {task} is already bound")]
    SlotAlreadyBound { task: Guid, slot: u32 },

    #[error("slot {slot} of task {task} is already satisfied")]
    SlotAlreadySatisfied { task: Guid, slot: u32 },

    #[error("slot {slot} out of range for {target} (depc {depc})")]
    IndexOutOfRange { target: Guid, slot: u32, depc: u32 },

    #[error("object {0} is busy and cannot be destroyed")]
    DestroyBusy(Guid),

    #[error("event {0} is already satisfied")]
    EventAlreadySatisfied(Guid),

    #[error("channel event {0} is full")]
    ChannelFull(Guid),

    #[error("GUID {0} already exists")]
    GuidExists(Guid),

    #[error("GUID table is full ({0} live entries)")]
    GuidTableFull(usize),

    #[error("out of metadata space: requested {requested} bytes, {available} available")]
    OutOfMetadata { requested: usize, available: usize },

    #[error("domain {domain} unreachable while resolving {guid}")]
    RemoteUnreachable { domain: DomainId, guid: Guid },

    #[error("domain {domain} rejected the request with status {code}")]
    RemoteFailure { domain: DomainId, code: u8 },

    #[error("access mode does not permit {0}")]
    ModeViolation(&'static str),

    #[error("runtime is shutting down")]
    ShuttingDown,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RuntimeError {
    /// Classify the error per the runtime's error taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            RuntimeError::GuidTableFull(_) | RuntimeError::OutOfMetadata { .. } => {
                ErrorCategory::Resource
            },
            RuntimeError::RemoteUnreachable { .. } | RuntimeError::RemoteFailure { .. } => {
                ErrorCategory::Transport
            },
            _ => ErrorCategory::User,
        }
    }

    /// Errno-style status code for callers that speak the C-like API.
    pub fn status_code(&self) -> u8 {
        match self {
            RuntimeError::UnknownGuid(_) => 2,
            RuntimeError::WrongKind { .. }
            | RuntimeError::ArityMismatch { .. }
            | RuntimeError::IndexOutOfRange { .. }
            | RuntimeError::InvalidArgument(_)
            | RuntimeError::Config(_) => 22,
            RuntimeError::SlotAlreadyBound { .. }
            | RuntimeError::SlotAlreadySatisfied { .. }
            | RuntimeError::EventAlreadySatisfied(_) => 1,
            RuntimeError::DestroyBusy(_) | RuntimeError::ChannelFull(_) => 16,
            RuntimeError::GuidExists(_) => 17,
            RuntimeError::GuidTableFull(_) | RuntimeError::OutOfMetadata { .. } => 12,
            RuntimeError::ModeViolation(_) => 13,
            RuntimeError::RemoteUnreachable { .. } => 111,
            RuntimeError::RemoteFailure { code, .. } => *code,
            RuntimeError::ShuttingDown => 125,
        }
    }

    /// Rebuild an error from a status code carried by a remote reply.
    pub(crate) fn from_remote(
        domain: DomainId,
        code: u8,
    ) -> Self {
        RuntimeError::RemoteFailure { domain, code }
    }

    pub(crate) fn wrong_kind(
        guid: Guid,
        expected: &'static str,
    ) -> Self {
        RuntimeError::WrongKind {
            guid,
            expected,
            found: guid.kind(),
        }
    }
}

/// Report a broken internal invariant and abort.
///
/// Shared state may already be inconsistent, so no unwinding is attempted.
#[macro_export]
macro_rules! fatal_invariant {
    ($($arg:tt)+) => {{
        ::tracing::error!(target: "flowrt::fatal", $($arg)+);
        eprintln!("flowrt: fatal invariant violation: {}", format_args!($($arg)+));
        ::std::process::abort()
    }};
}
