//! Multi-domain runtime
//!
//! [`Runtime`] builds one [`PolicyDomain`] per configured locality over a
//! shared [`Fabric`] and drives the shutdown protocol across all of them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::comm::{Fabric, FabricStats};
use super::domain::{DomainStats, FunctionTable, PolicyDomain, ShutdownSignal};
use super::error::{Result, RuntimeError};
use super::guid::{DomainId, Guid};
use crate::util::config::RuntimeConfig;

const QUIESCENCE_POLL: Duration = Duration::from_micros(200);
const SHUTDOWN_ACK_TIMEOUT: Duration = Duration::from_secs(1);
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What `shutdown` found on the way out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Peers that acknowledged the shutdown broadcast.
    pub acks: usize,
    /// Whether all work drained before the workers were joined.
    pub quiescent: bool,
    /// Runnable tasks that were queued but never ran.
    pub dropped_tasks: usize,
    /// GUID table entries still live when the providers were cleared.
    pub leaked_guids: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub domains: Vec<DomainStats>,
    pub fabric: FabricStats,
}

pub struct Runtime {
    config: RuntimeConfig,
    fabric: Arc<Fabric>,
    domains: Vec<Arc<PolicyDomain>>,
    signal: Arc<ShutdownSignal>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Runtime {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("domains", &self.domains.len())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl Runtime {
    /// Validate `config`, then build and start every domain.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let count = config.runtime.domains;
        let fabric = Arc::new(Fabric::new(count, config.comm.clone()));
        let functions = Arc::new(FunctionTable::new());
        let signal = Arc::new(ShutdownSignal::new());
        let domains: Vec<_> = (0..count)
            .map(|id| {
                Arc::new(PolicyDomain::new(
                    id,
                    &config,
                    Arc::clone(&fabric),
                    Arc::clone(&functions),
                    Arc::clone(&signal),
                ))
            })
            .collect();
        let runtime = Runtime {
            config,
            fabric,
            domains,
            signal,
            stopped: AtomicBool::new(false),
        };
        for domain in &runtime.domains {
            // A partial start is torn down by Drop.
            domain.start()?;
        }
        tracing::info!(
            domains = count,
            workers = runtime.config.scheduler.workers,
            provider = ?runtime.config.guid.provider,
            "runtime started"
        );
        Ok(runtime)
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(RuntimeConfig::default())
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[inline]
    pub fn num_domains(&self) -> usize {
        self.domains.len()
    }

    pub fn domain(
        &self,
        id: DomainId,
    ) -> Option<&Arc<PolicyDomain>> {
        self.domains.get(id)
    }

    /// Domain 0, where external work usually starts.
    pub fn root(&self) -> &Arc<PolicyDomain> {
        &self.domains[0]
    }

    #[inline]
    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    /// Block on an event owned by any domain.
    pub fn wait(
        &self,
        event: Guid,
        timeout: Option<Duration>,
    ) -> Result<Option<Guid>> {
        let owner = self
            .domain(event.location())
            .ok_or(RuntimeError::UnknownGuid(event))?;
        owner.wait(event, timeout)
    }

    fn is_quiescent(&self) -> bool {
        self.domains
            .iter()
            .filter(|d| self.fabric.is_alive(d.id()))
            .all(|d| d.is_idle())
            && self.fabric.in_flight() == 0
    }

    /// Wait until no live domain has work and no message is in flight.
    /// Returns `false` on timeout.
    pub fn wait_quiescent(
        &self,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            // Checked twice so a message landing between the two checks is
            // not missed.
            if self.is_quiescent() && self.is_quiescent() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(QUIESCENCE_POLL);
        }
    }

    /// Block until a task requests shutdown. Returns `false` on timeout.
    pub fn wait_for_shutdown(
        &self,
        timeout: Option<Duration>,
    ) -> bool {
        self.signal.wait(timeout)
    }

    /// Simulate the loss of a domain.
    pub fn disconnect(
        &self,
        domain: DomainId,
    ) {
        self.fabric.disconnect(domain);
    }

    /// Stop accepting work, drain, join the workers and release the
    /// providers. Later calls return an empty report.
    pub fn shutdown(&self) -> ShutdownReport {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return ShutdownReport::default();
        }
        let mut report = ShutdownReport::default();
        for domain in &self.domains {
            domain.begin_shutdown();
        }
        if let Some(root) = self.domains.first() {
            report.acks = root.broadcast_shutdown(SHUTDOWN_ACK_TIMEOUT);
        }
        report.quiescent = self.wait_quiescent(SHUTDOWN_DRAIN_TIMEOUT);
        if !report.quiescent {
            tracing::warn!("runtime did not drain before shutdown");
        }
        for domain in &self.domains {
            report.dropped_tasks += domain.stop_workers().len();
        }
        for domain in &self.domains {
            domain.stop_comm();
        }
        for domain in &self.domains {
            report.leaked_guids += domain.clear();
        }
        self.signal.raise();
        tracing::info!(
            acks = report.acks,
            quiescent = report.quiescent,
            dropped = report.dropped_tasks,
            leaked = report.leaked_guids,
            "runtime stopped"
        );
        report
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            domains: self.domains.iter().map(|d| d.stats()).collect(),
            fabric: self.fabric.stats(),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
