/// The shutdown sequence: quiesce, drain, stop, escalate.
///
/// Runs at most once per sequencer, always on a background task. Once started
/// it only ends by delivering the kill signal (or by failing to find this
/// process in the registry, which is a configuration error).
use crate::config::GraceTime;
use crate::registry::{ProcessRecord, ProcessRegistry, RegistryError};
use crate::signals::{SignalError, SignalSender};
use crate::status::{ShutdownStatus, StatusFile};
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Time allowed for the registry's view of a quiet process to propagate.
pub const SETTLE_DELAY: Duration = Duration::from_secs(5);

/// How often the drain loop re-checks the registry.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Sequencer progress. Only ever moves forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownState {
    Idle,
    Quiescing,
    Draining,
    Stopping,
    Escalating,
    Terminated,
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownState::Idle => "idle",
            ShutdownState::Quiescing => "quiescing",
            ShutdownState::Draining => "draining",
            ShutdownState::Stopping => "stopping",
            ShutdownState::Escalating => "escalating",
            ShutdownState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// What tripped the shutdown, carried into logs and the status file.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    pub rss_mb: f64,
    pub work_id: String,
    pub class: String,
}

/// Timing and signal settings for one sequencer.
#[derive(Debug, Clone)]
pub struct SequencerSettings {
    pub max_rss_mb: u64,
    pub grace_time: GraceTime,
    pub shutdown_wait: Duration,
    pub kill_signal: Signal,
}

#[derive(Debug)]
pub enum ShutdownError {
    /// `run` was called on a sequencer that already left `Idle`.
    AlreadyStarted { state: ShutdownState },
    /// The registry has no record of this process.
    IdentityNotFound { identity: String },
    /// The final self-signal could not be delivered.
    Signal { source: SignalError },
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownError::AlreadyStarted { state } => {
                write!(f, "shutdown already started (state {state})")
            }
            ShutdownError::IdentityNotFound { identity } => {
                write!(f, "process {identity} not found in registry, shutdown aborted")
            }
            ShutdownError::Signal { source } => write!(f, "failed to deliver kill signal: {source}"),
        }
    }
}

impl std::error::Error for ShutdownError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShutdownError::Signal { source } => Some(source),
            ShutdownError::AlreadyStarted { .. } | ShutdownError::IdentityNotFound { .. } => None,
        }
    }
}

pub struct ShutdownSequencer {
    identity: String,
    pid: Pid,
    settings: SequencerSettings,
    registry: Arc<dyn ProcessRegistry>,
    signaler: Arc<dyn SignalSender>,
    status: Option<StatusFile>,
    state: watch::Sender<ShutdownState>,
}

/// Per-run context for status snapshots.
struct Run<'a> {
    trigger: &'a ShutdownTrigger,
    started_at: DateTime<Utc>,
}

impl ShutdownSequencer {
    pub fn new(
        identity: String,
        settings: SequencerSettings,
        registry: Arc<dyn ProcessRegistry>,
        signaler: Arc<dyn SignalSender>,
    ) -> Self {
        let (state, _) = watch::channel(ShutdownState::Idle);
        Self {
            identity,
            pid: Pid::this(),
            settings,
            registry,
            signaler,
            status: None,
            state,
        }
    }

    pub fn with_status_file(mut self, status: StatusFile) -> Self {
        self.status = Some(status);
        self
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Drive the whole sequence. Resolves after the kill signal is sent, which
    /// in production means it never resolves.
    pub async fn run(&self, trigger: &ShutdownTrigger) -> Result<ShutdownState, ShutdownError> {
        let current = self.state();
        if current != ShutdownState::Idle {
            return Err(ShutdownError::AlreadyStarted { state: current });
        }
        let run = Run {
            trigger,
            started_at: Utc::now(),
        };
        let worker_ref = format!("PID {} ({})", self.pid, self.identity);

        warn!(
            rss_mb = trigger.rss_mb,
            max_rss_mb = self.settings.max_rss_mb,
            work_id = %trigger.work_id,
            class = %trigger.class,
            "current RSS exceeds maximum RSS, shutting down {worker_ref}"
        );

        // 1. Quiesce
        self.advance(&run, ShutdownState::Quiescing);
        let mut record = None;
        self.resolve(&mut record, &worker_ref)?;
        sleep(SETTLE_DELAY).await;

        // 2. Drain
        self.advance(&run, ShutdownState::Draining);
        info!(
            grace_time = %self.settings.grace_time,
            "waiting for in-flight work on {worker_ref} to finish"
        );
        let drain_start = Instant::now();
        loop {
            sleep(DRAIN_POLL_INTERVAL).await;
            let elapsed = drain_start.elapsed();
            if self.settings.grace_time.exceeded(elapsed) {
                warn!(
                    elapsed_secs = elapsed.as_secs_f64(),
                    "grace time exceeded with work still in flight"
                );
                break;
            }
            self.resolve(&mut record, &worker_ref)?;
            if self.drained(record.as_deref()) {
                info!(elapsed_secs = elapsed.as_secs_f64(), "in-flight work drained");
                break;
            }
        }

        // 3. Stop
        self.advance(&run, ShutdownState::Stopping);
        self.resolve(&mut record, &worker_ref)?;
        if let Some(record) = &record {
            match record.mark_stopped() {
                Ok(()) => info!("stopping {worker_ref}"),
                Err(e) => warn!(error = %e, "failed to mark process stopped, continuing"),
            }
        }

        // 4. Escalation wait
        info!(
            wait_secs = self.settings.shutdown_wait.as_secs_f64(),
            signal = %self.settings.kill_signal,
            "waiting before sending kill signal to {worker_ref}"
        );
        sleep(self.settings.shutdown_wait).await;

        // 5. Kill
        self.advance(&run, ShutdownState::Escalating);
        error!(
            signal = %self.settings.kill_signal,
            "sending {} to {worker_ref}", self.settings.kill_signal
        );
        self.signaler
            .send(self.settings.kill_signal, self.pid)
            .map_err(|e| ShutdownError::Signal { source: e })?;
        self.advance(&run, ShutdownState::Terminated);
        Ok(ShutdownState::Terminated)
    }

    /// Look the record up if an earlier lookup failed, and quiesce it the
    /// first time it is found. `NotFound` aborts at any step.
    fn resolve(
        &self,
        record: &mut Option<Arc<dyn ProcessRecord>>,
        worker_ref: &str,
    ) -> Result<(), ShutdownError> {
        if record.is_some() {
            return Ok(());
        }
        *record = self.find_record()?;
        if let Some(found) = record.as_deref() {
            match found.mark_quiescing() {
                Ok(()) => info!("marked {worker_ref} quiet"),
                Err(e) => warn!(error = %e, "failed to mark process quiet, continuing"),
            }
        }
        Ok(())
    }

    /// `Ok(None)` means the registry is unreachable: carry on, bounded by grace time.
    fn find_record(&self) -> Result<Option<Arc<dyn ProcessRecord>>, ShutdownError> {
        match self.registry.find_self(&self.identity) {
            Ok(record) => Ok(Some(record)),
            Err(RegistryError::NotFound { identity }) => {
                error!(
                    identity = %identity,
                    "process not found in registry, aborting shutdown sequence"
                );
                Err(ShutdownError::IdentityNotFound { identity })
            }
            Err(e) => {
                warn!(error = %e, "registry lookup failed, assuming busy until grace time");
                Ok(None)
            }
        }
    }

    fn drained(&self, record: Option<&dyn ProcessRecord>) -> bool {
        let Some(record) = record else {
            return false;
        };
        match record.is_drained() {
            Ok(drained) => {
                debug!(drained, "drain check");
                drained
            }
            Err(e) => {
                warn!(error = %e, "drain check failed, assuming busy");
                false
            }
        }
    }

    fn advance(&self, run: &Run<'_>, next: ShutdownState) {
        let moved = self.state.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        });
        if !moved {
            return;
        }
        debug!(state = %next, "shutdown state changed");

        if let Some(status) = &self.status {
            let snapshot = ShutdownStatus {
                pid: std::process::id(),
                identity: self.identity.clone(),
                state: next,
                max_rss_mb: self.settings.max_rss_mb,
                rss_mb: run.trigger.rss_mb,
                work_id: run.trigger.work_id.clone(),
                started_at: run.started_at,
                last_update: Utc::now(),
            };
            if let Err(e) = status.write(&snapshot) {
                warn!(error = %e, "failed to write shutdown status file");
            }
        }
    }
}
