/// Signal plumbing on both sides of the shutdown sequence.
///
/// Outbound: `SignalSender` delivers signals to this process (the last step of
/// every shutdown is a self-signal). Inbound: `SignalHandler` lets the host
/// worker loop react to the quiet signal (stop taking work) and to
/// SIGTERM/SIGINT (finish in-flight work, then exit).
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;

/// Delivers a signal to a process. Production code signals itself.
pub trait SignalSender: Send + Sync {
    fn send(&self, signal: Signal, pid: Pid) -> Result<(), SignalError>;
}

/// Real delivery through `kill(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessSignaler;

impl SignalSender for ProcessSignaler {
    fn send(&self, signal: Signal, pid: Pid) -> Result<(), SignalError> {
        tracing::debug!(signal = %signal, pid = pid.as_raw(), "delivering signal");
        kill(pid, signal).map_err(|e| SignalError::Delivery {
            signal,
            pid,
            source: e,
        })
    }
}

/// Parse `SIGKILL`, `KILL`, `kill` or a raw number like `9`.
pub fn parse_signal(name: &str) -> Result<Signal, SignalError> {
    let trimmed = name.trim();
    if let Ok(num) = trimmed.parse::<i32>() {
        return Signal::try_from(num).map_err(|_| SignalError::Unknown {
            name: name.to_string(),
        });
    }
    let upper = trimmed.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    full.parse::<Signal>().map_err(|_| SignalError::Unknown {
        name: name.to_string(),
    })
}

/// Signals a process cannot install a handler for.
const UNCATCHABLE: [Signal; 5] = [
    Signal::SIGKILL,
    Signal::SIGSTOP,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGSEGV,
];

/// Like `parse_signal`, but only for signals a handler can be installed for.
pub fn parse_catchable_signal(name: &str) -> Result<Signal, SignalError> {
    let signal = parse_signal(name)?;
    if UNCATCHABLE.contains(&signal) {
        return Err(SignalError::Uncatchable { signal });
    }
    Ok(signal)
}

#[derive(Debug)]
pub enum SignalError {
    Unknown {
        name: String,
    },
    Uncatchable {
        signal: Signal,
    },
    Delivery {
        signal: Signal,
        pid: Pid,
        source: nix::Error,
    },
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalError::Unknown { name } => write!(f, "unknown signal {name:?}"),
            SignalError::Uncatchable { signal } => write!(f, "{signal} cannot be caught"),
            SignalError::Delivery { signal, pid, source } => {
                write!(f, "failed to send {signal} to pid {pid}: {source}")
            }
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignalError::Unknown { .. } | SignalError::Uncatchable { .. } => None,
            SignalError::Delivery { source, .. } => Some(source),
        }
    }
}

#[derive(Default)]
struct HandlerState {
    quiet: AtomicBool,
    stop: AtomicBool,
    changed: Notify,
}

impl HandlerState {
    fn request_quiet(&self) {
        self.quiet.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    fn request_stop(&self) {
        self.quiet.store(true, Ordering::SeqCst);
        self.stop.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }
}

/// Host-side view of lifecycle signals.
///
/// The quiet signal: stop pulling new work.
/// SIGTERM / SIGINT: stop pulling new work and exit once in-flight work is done.
#[derive(Clone)]
pub struct SignalHandler {
    state: Arc<HandlerState>,
}

impl SignalHandler {
    /// Register handlers. Must run inside a tokio runtime, and before the
    /// controller can self-deliver the quiet signal (its default action would
    /// suspend the process).
    pub fn install(quiet_signal: Signal) -> std::io::Result<Self> {
        let handler = Self {
            state: Arc::new(HandlerState::default()),
        };

        let mut quiet = signal(SignalKind::from_raw(quiet_signal as i32))?;
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;

        let state = Arc::clone(&handler.state);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(()) = quiet.recv() => {
                        tracing::info!(signal = %quiet_signal, "quiet signal received, no longer taking work");
                        state.request_quiet();
                    }
                    Some(()) = term.recv() => {
                        tracing::info!("SIGTERM received, finishing in-flight work");
                        state.request_stop();
                    }
                    Some(()) = int.recv() => {
                        tracing::info!("SIGINT received, finishing in-flight work");
                        state.request_stop();
                    }
                    else => break,
                }
            }
        });

        Ok(handler)
    }

    /// A handler with no OS signals attached; only `request_*` calls move it.
    pub fn detached() -> Self {
        Self {
            state: Arc::new(HandlerState::default()),
        }
    }

    /// Same effect as receiving the quiet signal.
    pub fn request_quiet(&self) {
        self.state.request_quiet();
    }

    /// Same effect as receiving SIGTERM.
    pub fn request_stop(&self) {
        self.state.request_stop();
    }

    pub fn quiesced(&self) -> bool {
        self.state.quiet.load(Ordering::SeqCst)
    }

    pub fn stopping(&self) -> bool {
        self.state.stop.load(Ordering::SeqCst)
    }

    /// Resolves once `quiesced()` is true.
    pub async fn wait_quiet(&self) {
        self.wait_until(Self::quiesced).await
    }

    /// Resolves once `stopping()` is true.
    pub async fn wait_stopping(&self) {
        self.wait_until(Self::stopping).await
    }

    async fn wait_until(&self, done: fn(&Self) -> bool) {
        loop {
            let notified = self.state.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a request in between is not missed.
            notified.as_mut().enable();
            if done(self) {
                return;
            }
            notified.await;
        }
    }
}
