use crate::signals::{parse_catchable_signal, parse_signal, SignalError};
use nix::sys::signal::Signal;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from memguard.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MemguardConfig {
    pub guard: GuardConfig,
    pub worker: WorkerConfig,
}

/// Settings for the memory guard itself. Fixed for the life of a controller.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Resident memory ceiling in MB. `0` disables the guard.
    pub max_rss_mb: u64,
    /// How long in-flight work may drain once the process is quiet.
    pub grace_time: GraceTime,
    /// Delay between the stop signal and the kill signal.
    pub shutdown_wait_secs: u64,
    /// Final signal delivered to this process.
    pub kill_signal: String,
    /// Signal the bundled registry uses to quiesce this process.
    pub quiet_signal: String,
    /// Run the reclaim hook and re-sample before acting on a breach.
    pub gc: bool,
    /// Where to write the shutdown status snapshot, if anywhere.
    pub status_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub shell: String,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_rss_mb: 0,
            grace_time: GraceTime::Finite(Duration::from_secs(15 * 60)),
            shutdown_wait_secs: 30,
            kill_signal: "SIGKILL".to_string(),
            quiet_signal: "SIGTSTP".to_string(),
            gc: true,
            status_file: None,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            shell: "sh".to_string(),
        }
    }
}

impl GuardConfig {
    /// A zero ceiling turns the whole controller into a pass-through.
    pub fn enabled(&self) -> bool {
        self.max_rss_mb > 0
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_secs(self.shutdown_wait_secs)
    }

    pub fn kill_signal(&self) -> Result<Signal, SignalError> {
        parse_signal(&self.kill_signal)
    }

    /// The quiet signal has a handler installed for it, so it must be catchable.
    pub fn quiet_signal(&self) -> Result<Signal, SignalError> {
        parse_catchable_signal(&self.quiet_signal)
    }
}

/// Upper bound on the drain phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawGraceTime")]
pub enum GraceTime {
    Finite(Duration),
    /// Never time out; only a drained registry ends the wait.
    Infinite,
}

impl GraceTime {
    pub fn from_secs(secs: u64) -> Self {
        GraceTime::Finite(Duration::from_secs(secs))
    }

    /// True once `elapsed` is strictly past the grace period.
    pub fn exceeded(&self, elapsed: Duration) -> bool {
        match self {
            GraceTime::Finite(limit) => elapsed > *limit,
            GraceTime::Infinite => false,
        }
    }
}

impl fmt::Display for GraceTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraceTime::Finite(d) => write!(f, "{}s", d.as_secs_f64()),
            GraceTime::Infinite => write!(f, "infinite"),
        }
    }
}

impl std::str::FromStr for GraceTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("infinite") || s.eq_ignore_ascii_case("inf") {
            return Ok(GraceTime::Infinite);
        }
        let secs: f64 = s
            .parse()
            .map_err(|_| format!("invalid grace time {s:?}: expected seconds or \"infinite\""))?;
        RawGraceTime::Seconds(secs).try_into()
    }
}

/// Wire form of `grace_time`: a number of seconds or the word "infinite".
#[derive(Deserialize)]
#[serde(untagged)]
enum RawGraceTime {
    Seconds(f64),
    Word(String),
}

impl TryFrom<RawGraceTime> for GraceTime {
    type Error = String;

    fn try_from(raw: RawGraceTime) -> Result<Self, Self::Error> {
        match raw {
            RawGraceTime::Seconds(secs) if secs.is_infinite() && secs > 0.0 => {
                Ok(GraceTime::Infinite)
            }
            RawGraceTime::Seconds(secs) if secs.is_finite() && secs >= 0.0 => {
                Duration::try_from_secs_f64(secs)
                    .map(GraceTime::Finite)
                    .map_err(|e| format!("invalid grace time {secs}: {e}"))
            }
            RawGraceTime::Seconds(secs) => Err(format!("grace time must be >= 0, got {secs}")),
            RawGraceTime::Word(word) => word.parse(),
        }
    }
}

/// Errors from loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Signal {
        field: &'static str,
        source: SignalError,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Signal { field, source } => write!(f, "invalid {field}: {source}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Signal { source, .. } => Some(source),
        }
    }
}

impl MemguardConfig {
    /// Load from `path`. A missing file is not an error and yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject signal names nix does not know about, and a quiet signal
    /// that cannot be handled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.guard
            .kill_signal()
            .map_err(|e| ConfigError::Signal {
                field: "kill_signal",
                source: e,
            })?;
        self.guard
            .quiet_signal()
            .map_err(|e| ConfigError::Signal {
                field: "quiet_signal",
                source: e,
            })?;
        Ok(())
    }
}
