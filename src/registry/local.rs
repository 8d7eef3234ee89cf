/// In-process registry for a single worker.
///
/// The host loop counts in-flight work through a shared `WorkTracker`.
/// Lifecycle changes are pushed to the host as self-signals: the quiet signal
/// on `mark_quiescing`, SIGTERM on `mark_stopped`. Each is sent at most once.
use super::{Lifecycle, ProcessRecord, ProcessRegistry, RegistryError};
use crate::signals::SignalSender;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared counter of units of work currently executing.
#[derive(Debug, Clone, Default)]
pub struct WorkTracker {
    count: Arc<AtomicUsize>,
}

impl WorkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one unit of work until the returned guard drops.
    pub fn enter(&self) -> InFlight {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlight {
            count: Arc::clone(&self.count),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

/// Decrements the tracker on drop, including on panic or cancellation.
#[derive(Debug)]
pub struct InFlight {
    count: Arc<AtomicUsize>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

const RUNNING: u8 = 0;
const QUIET: u8 = 1;
const STOPPED: u8 = 2;

fn decode(raw: u8) -> Lifecycle {
    match raw {
        RUNNING => Lifecycle::Running,
        QUIET => Lifecycle::Quiet,
        _ => Lifecycle::Stopped,
    }
}

struct LocalRecord {
    pid: Pid,
    tracker: WorkTracker,
    lifecycle: AtomicU8,
    quiet_signal: Signal,
    signaler: Arc<dyn SignalSender>,
}

impl ProcessRecord for LocalRecord {
    fn mark_quiescing(&self) -> Result<(), RegistryError> {
        if self
            .lifecycle
            .compare_exchange(RUNNING, QUIET, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        tracing::info!(signal = %self.quiet_signal, pid = self.pid.as_raw(), "sending quiet signal");
        self.signaler
            .send(self.quiet_signal, self.pid)
            .map_err(|e| RegistryError::Signal { source: e })
    }

    fn mark_stopped(&self) -> Result<(), RegistryError> {
        if self.lifecycle.swap(STOPPED, Ordering::AcqRel) == STOPPED {
            return Ok(());
        }
        tracing::info!(pid = self.pid.as_raw(), "sending SIGTERM");
        self.signaler
            .send(Signal::SIGTERM, self.pid)
            .map_err(|e| RegistryError::Signal { source: e })
    }

    fn in_flight(&self) -> Result<usize, RegistryError> {
        Ok(self.tracker.count())
    }

    fn lifecycle(&self) -> Result<Lifecycle, RegistryError> {
        Ok(decode(self.lifecycle.load(Ordering::Acquire)))
    }
}

/// A registry holding exactly one record: this process.
#[derive(Clone)]
pub struct LocalRegistry {
    identity: String,
    record: Arc<LocalRecord>,
}

impl LocalRegistry {
    pub fn new(
        identity: impl Into<String>,
        tracker: WorkTracker,
        quiet_signal: Signal,
        signaler: Arc<dyn SignalSender>,
    ) -> Self {
        Self {
            identity: identity.into(),
            record: Arc::new(LocalRecord {
                pid: Pid::this(),
                tracker,
                lifecycle: AtomicU8::new(RUNNING),
                quiet_signal,
                signaler,
            }),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        decode(self.record.lifecycle.load(Ordering::Acquire))
    }
}

impl ProcessRegistry for LocalRegistry {
    fn find_self(&self, identity: &str) -> Result<Arc<dyn ProcessRecord>, RegistryError> {
        if identity != self.identity {
            return Err(RegistryError::NotFound {
                identity: identity.to_string(),
            });
        }
        let record: Arc<dyn ProcessRecord> = self.record.clone();
        Ok(record)
    }
}
