pub mod local;

pub use local::{InFlight, LocalRegistry, WorkTracker};

use crate::signals::SignalError;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Where a process stands with respect to taking new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Running,
    /// Finishing in-flight work, not taking new work.
    Quiet,
    Stopped,
}

/// This process's entry in a registry of worker processes.
///
/// Implementations may be eventually consistent; callers treat any error as
/// "still busy".
pub trait ProcessRecord: Send + Sync {
    /// Stop handing new work to this process.
    fn mark_quiescing(&self) -> Result<(), RegistryError>;

    /// Take the process out of service regardless of in-flight work.
    fn mark_stopped(&self) -> Result<(), RegistryError>;

    /// Units of work currently executing in this process.
    fn in_flight(&self) -> Result<usize, RegistryError>;

    fn lifecycle(&self) -> Result<Lifecycle, RegistryError>;

    fn is_busy(&self) -> Result<bool, RegistryError> {
        Ok(self.in_flight()? > 0)
    }

    /// Quiet (or stopped) with nothing left in flight.
    fn is_drained(&self) -> Result<bool, RegistryError> {
        Ok(!self.is_busy()? && self.lifecycle()? != Lifecycle::Running)
    }
}

/// Lookup of process records by identity.
pub trait ProcessRegistry: Send + Sync {
    fn find_self(&self, identity: &str) -> Result<Arc<dyn ProcessRecord>, RegistryError>;
}

/// `host:pid` for this process. Computed by callers once and kept.
pub fn identity() -> String {
    let host = match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read hostname, using localhost");
            "localhost".to_string()
        }
    };
    format!("{host}:{}", std::process::id())
}

#[derive(Debug)]
pub enum RegistryError {
    /// No record for this identity; the registry and this process disagree about who we are.
    NotFound { identity: String },
    /// The registry could not be reached or answered garbage.
    Unavailable { reason: String },
    /// The record tried to signal the process and failed.
    Signal { source: SignalError },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::NotFound { identity } => {
                write!(f, "no registry record for process {identity}")
            }
            RegistryError::Unavailable { reason } => write!(f, "registry unavailable: {reason}"),
            RegistryError::Signal { source } => write!(f, "registry signal failed: {source}"),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistryError::Signal { source } => Some(source),
            RegistryError::NotFound { .. } | RegistryError::Unavailable { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        in_flight: AtomicUsize,
        lifecycle: Lifecycle,
    }

    impl ProcessRecord for Fixed {
        fn mark_quiescing(&self) -> Result<(), RegistryError> {
            Ok(())
        }
        fn mark_stopped(&self) -> Result<(), RegistryError> {
            Ok(())
        }
        fn in_flight(&self) -> Result<usize, RegistryError> {
            Ok(self.in_flight.load(Ordering::SeqCst))
        }
        fn lifecycle(&self) -> Result<Lifecycle, RegistryError> {
            Ok(self.lifecycle)
        }
    }

    fn fixed(in_flight: usize, lifecycle: Lifecycle) -> Fixed {
        Fixed {
            in_flight: AtomicUsize::new(in_flight),
            lifecycle,
        }
    }

    #[test]
    fn test_identity_is_host_and_pid() {
        let id = identity();
        let (host, pid) = id.rsplit_once(':').unwrap();
        assert!(!host.is_empty());
        assert_eq!(pid, std::process::id().to_string());
        assert_eq!(identity(), id);
    }

    #[test]
    fn test_busy_follows_in_flight() {
        assert!(fixed(2, Lifecycle::Quiet).is_busy().unwrap());
        assert!(!fixed(0, Lifecycle::Quiet).is_busy().unwrap());
    }

    #[test]
    fn test_drained_requires_quiet_and_idle() {
        assert!(fixed(0, Lifecycle::Quiet).is_drained().unwrap());
        assert!(fixed(0, Lifecycle::Stopped).is_drained().unwrap());
        assert!(!fixed(0, Lifecycle::Running).is_drained().unwrap());
        assert!(!fixed(1, Lifecycle::Quiet).is_drained().unwrap());
    }

    #[test]
    fn test_not_found_message_names_identity() {
        let err = RegistryError::NotFound {
            identity: "web-1:42".to_string(),
        };
        assert!(err.to_string().contains("web-1:42"));
    }
}
