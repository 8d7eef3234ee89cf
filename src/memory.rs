/// Resident memory sampling for the current process.
///
/// The fast path reads `VmRSS` from `/proc/self/status`. When that fails
/// (sandboxed `/proc`, non-Linux host) callers fall back to the slow path,
/// which shells out to `ps`.
use std::fmt;
use std::path::PathBuf;
use std::process::Command;

const PROC_STATUS: &str = "/proc/self/status";

/// Source of resident memory readings, in MB.
pub trait MemorySampler: Send + Sync {
    fn resident_mb(&self) -> Result<f64, SampleError>;

    /// More expensive path tried once when `resident_mb` fails.
    fn resident_mb_slow(&self) -> Result<f64, SampleError> {
        self.resident_mb()
    }
}

impl<F> MemorySampler for F
where
    F: Fn() -> Result<f64, SampleError> + Send + Sync,
{
    fn resident_mb(&self) -> Result<f64, SampleError> {
        self()
    }
}

/// Samples this process through procfs, falling back to `ps`.
#[derive(Debug, Clone)]
pub struct ProcSampler {
    pid: u32,
    status_path: PathBuf,
}

impl Default for ProcSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcSampler {
    pub fn new() -> Self {
        Self {
            pid: std::process::id(),
            status_path: PathBuf::from(PROC_STATUS),
        }
    }

    #[cfg(test)]
    fn with_status_path(status_path: PathBuf) -> Self {
        Self {
            pid: std::process::id(),
            status_path,
        }
    }
}

impl MemorySampler for ProcSampler {
    fn resident_mb(&self) -> Result<f64, SampleError> {
        let status =
            std::fs::read_to_string(&self.status_path).map_err(|e| SampleError::Io {
                path: self.status_path.clone(),
                source: e,
            })?;
        let kb = parse_vm_rss_kb(&status).ok_or_else(|| SampleError::Parse {
            what: "VmRSS line in process status",
            raw: status.lines().find(|l| l.starts_with("VmRSS")).unwrap_or("").to_string(),
        })?;
        Ok(kb_to_mb(kb))
    }

    fn resident_mb_slow(&self) -> Result<f64, SampleError> {
        let output = Command::new("ps")
            .args(["-o", "rss=", "-p", &self.pid.to_string()])
            .output()
            .map_err(|e| SampleError::Spawn { source: e })?;
        if !output.status.success() {
            return Err(SampleError::CommandFailed {
                code: output.status.code(),
            });
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let kb = text
            .trim()
            .parse::<u64>()
            .map_err(|_| SampleError::Parse {
                what: "ps rss output",
                raw: text.trim().to_string(),
            })?;
        Ok(kb_to_mb(kb))
    }
}

/// Extract the `VmRSS` value (in kB) from `/proc/<pid>/status` contents.
fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.trim_start().strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

fn kb_to_mb(kb: u64) -> f64 {
    kb as f64 / 1024.0
}

/// Errors from sampling resident memory.
#[derive(Debug)]
pub enum SampleError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        what: &'static str,
        raw: String,
    },
    Spawn {
        source: std::io::Error,
    },
    CommandFailed {
        code: Option<i32>,
    },
}

impl fmt::Display for SampleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleError::Io { path, source } => {
                write!(f, "failed to read {}: {source}", path.display())
            }
            SampleError::Parse { what, raw } => write!(f, "failed to parse {what}: {raw:?}"),
            SampleError::Spawn { source } => write!(f, "failed to run ps: {source}"),
            SampleError::CommandFailed { code } => write!(f, "ps exited with {code:?}"),
        }
    }
}

impl std::error::Error for SampleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SampleError::Io { source, .. } => Some(source),
            SampleError::Spawn { source } => Some(source),
            SampleError::Parse { .. } | SampleError::CommandFailed { .. } => None,
        }
    }
}
