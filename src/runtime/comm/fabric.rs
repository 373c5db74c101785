//! In-process comm fabric
//!
//! Every domain owns one unbounded inbox. `send` never blocks; ordering is
//! only guaranteed per (sender, receiver) pair when sequencing is on, and a
//! reorder window above one deliberately shuffles delivery.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Serialize;

use super::message::{Envelope, Message};
use super::CommConfig;
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::guid::{DomainId, Guid};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FabricStats {
    pub sent: u64,
    pub delivered: u64,
    pub in_flight: usize,
}

#[derive(Debug)]
pub struct Fabric {
    config: CommConfig,
    inboxes: Box<[Sender<Envelope>]>,
    receivers: Mutex<Vec<Option<Receiver<Envelope>>>>,
    alive: Box<[AtomicBool]>,
    /// Next sequence number, indexed `from * n + to`.
    seqs: Box<[AtomicU64]>,
    holdback: Box<[Mutex<Vec<Envelope>>]>,
    /// Sent but not yet handled by the receiver.
    in_flight: AtomicUsize,
    sent: AtomicU64,
    delivered: AtomicU64,
}

impl Fabric {
    pub fn new(
        domains: usize,
        config: CommConfig,
    ) -> Self {
        let (inboxes, receivers): (Vec<_>, Vec<_>) = (0..domains)
            .map(|_| {
                let (tx, rx) = channel::unbounded();
                (tx, Some(rx))
            })
            .unzip();
        Fabric {
            config,
            inboxes: inboxes.into_boxed_slice(),
            receivers: Mutex::new(receivers),
            alive: (0..domains).map(|_| AtomicBool::new(true)).collect(),
            seqs: (0..domains * domains).map(|_| AtomicU64::new(0)).collect(),
            holdback: (0..domains).map(|_| Mutex::new(Vec::new())).collect(),
            in_flight: AtomicUsize::new(0),
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn num_domains(&self) -> usize {
        self.inboxes.len()
    }

    #[inline]
    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    /// Hand out a domain's inbox. Each inbox can be taken once.
    pub fn take_receiver(
        &self,
        domain: DomainId,
    ) -> Option<Receiver<Envelope>> {
        self.receivers.lock().get_mut(domain)?.take()
    }

    pub fn is_alive(
        &self,
        domain: DomainId,
    ) -> bool {
        self.alive
            .get(domain)
            .is_some_and(|a| a.load(Ordering::Acquire))
    }

    fn unreachable(domain: DomainId) -> RuntimeError {
        RuntimeError::RemoteUnreachable {
            domain,
            guid: Guid::NULL,
        }
    }

    /// Queue `message` for `to`.
    pub fn send(
        &self,
        from: DomainId,
        to: DomainId,
        message: Message,
    ) -> Result<()> {
        if to >= self.num_domains() {
            return Err(RuntimeError::InvalidArgument(format!("no domain {to}")));
        }
        if !self.is_alive(to) || !self.is_alive(from) {
            return Err(Self::unreachable(to));
        }
        let seq = self
            .config
            .sequenced
            .then(|| self.seqs[from * self.num_domains() + to].fetch_add(1, Ordering::Relaxed));
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.sent.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(from, to, seq, message = message.name(), "send");

        let envelope = Envelope {
            from,
            to,
            seq,
            message,
        };
        if self.config.reorder_window > 1 {
            let batch = {
                let mut held = self.holdback[to].lock();
                held.push(envelope);
                if held.len() < self.config.reorder_window {
                    return Ok(());
                }
                std::mem::take(&mut *held)
            };
            self.deliver_shuffled(batch);
            return Ok(());
        }
        self.deliver(envelope)
    }

    fn deliver(
        &self,
        envelope: Envelope,
    ) -> Result<()> {
        let to = envelope.to;
        if self.inboxes[to].send(envelope).is_err() {
            self.complete();
            return Err(Self::unreachable(to));
        }
        Ok(())
    }

    fn deliver_shuffled(
        &self,
        mut batch: Vec<Envelope>,
    ) {
        batch.shuffle(&mut rand::rng());
        for envelope in batch {
            let to = envelope.to;
            if let Err(err) = self.deliver(envelope) {
                tracing::debug!(to, %err, "held message dropped");
            }
        }
    }

    /// Release everything held back for `to`.
    pub fn flush(
        &self,
        to: DomainId,
    ) {
        let Some(holdback) = self.holdback.get(to) else {
            return;
        };
        let batch = std::mem::take(&mut *holdback.lock());
        if !batch.is_empty() {
            self.deliver_shuffled(batch);
        }
    }

    /// Mark one received message as handled.
    #[inline]
    pub fn complete(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Messages sent and not yet handled.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Simulate the loss of `domain`: sends to or from it fail from now on
    /// and every surviving domain is told.
    pub fn disconnect(
        &self,
        domain: DomainId,
    ) {
        let Some(alive) = self.alive.get(domain) else {
            return;
        };
        if !alive.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::warn!(domain, "domain disconnected");
        let held = std::mem::take(&mut *self.holdback[domain].lock());
        for _ in held {
            self.complete();
        }
        for peer in 0..self.num_domains() {
            if peer == domain || !self.is_alive(peer) {
                continue;
            }
            self.in_flight.fetch_add(1, Ordering::AcqRel);
            let envelope = Envelope {
                from: domain,
                to: peer,
                seq: None,
                message: Message::PeerLost { domain },
            };
            if let Err(err) = self.deliver(envelope) {
                tracing::debug!(peer, %err, "peer-lost notice dropped");
            }
        }
    }

    pub fn stats(&self) -> FabricStats {
        FabricStats {
            sent: self.sent.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }
}
