//! Communication between policy domains
//!
//! Domains never touch each other's tables. Everything that crosses a
//! domain boundary is a [`Message`] carried by the [`Fabric`] and handled
//! by the receiving domain's comm thread.

mod fabric;
mod message;
mod sequence;

#[cfg(test)]
mod tests;

pub use fabric::{Fabric, FabricStats};
pub use message::{Envelope, Message, Refusal, Ticket};
pub use sequence::ReorderBuffer;

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_reorder_window() -> usize {
    1
}

fn default_reply_timeout_ms() -> u64 {
    5000
}

fn default_idle_flush_us() -> u64 {
    500
}

/// Comm fabric configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommConfig {
    /// Stamp messages with per-pair sequence numbers and deliver in order.
    #[serde(default)]
    pub sequenced: bool,
    /// Messages held back per receiver before a shuffled release. One
    /// disables reordering.
    #[serde(default = "default_reorder_window")]
    pub reorder_window: usize,
    /// How long a blocking cross-domain request waits for its reply.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    /// Idle time after which a comm thread flushes held-back messages.
    #[serde(default = "default_idle_flush_us")]
    pub idle_flush_us: u64,
}

impl Default for CommConfig {
    fn default() -> Self {
        CommConfig {
            sequenced: false,
            reorder_window: default_reorder_window(),
            reply_timeout_ms: default_reply_timeout_ms(),
            idle_flush_us: default_idle_flush_us(),
        }
    }
}

impl CommConfig {
    #[inline]
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    #[inline]
    pub fn idle_flush(&self) -> Duration {
        Duration::from_micros(self.idle_flush_us)
    }
}
