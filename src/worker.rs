/// Guarded worker loop: runs shell jobs, each wrapped by the controller.
///
/// Jobs come from a text file, one shell command per line. Blank lines and
/// `#` comments are ignored. At most `concurrency` jobs run at once.
use crate::breach::WorkDescriptor;
use crate::config::WorkerConfig;
use crate::controller::Controller;
use crate::registry::WorkTracker;
use crate::signals::SignalHandler;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// One line of the jobs file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// 1-based line number, used as the work id.
    pub line: usize,
    pub command: String,
}

impl Job {
    pub fn descriptor(&self) -> WorkDescriptor {
        WorkDescriptor::new(
            self.line.to_string(),
            "shell",
            serde_json::Value::String(self.command.clone()),
        )
    }
}

/// Result of a completed job.
#[derive(Debug)]
pub struct JobOutcome {
    /// Process exit code (None if killed by signal).
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl JobOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Totals reported when the loop ends.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Jobs never started because the process went quiet.
    pub not_started: usize,
}

/// Errors that can occur while loading or running jobs.
#[derive(Debug)]
pub enum WorkerError {
    /// Failed to read the jobs file.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to spawn the job subprocess.
    Spawn { source: std::io::Error },
    /// Failed while waiting for the job subprocess.
    Io { source: std::io::Error },
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::Read { path, source } => {
                write!(f, "failed to read jobs file {}: {}", path.display(), source)
            }
            WorkerError::Spawn { source } => write!(f, "failed to spawn job: {}", source),
            WorkerError::Io { source } => write!(f, "I/O error during job: {}", source),
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkerError::Read { source, .. } => Some(source),
            WorkerError::Spawn { source } => Some(source),
            WorkerError::Io { source } => Some(source),
        }
    }
}

pub fn parse_jobs(text: &str) -> Vec<Job> {
    text.lines()
        .enumerate()
        .filter_map(|(i, line)| {
            let command = line.trim();
            if command.is_empty() || command.starts_with('#') {
                return None;
            }
            Some(Job {
                line: i + 1,
                command: command.to_string(),
            })
        })
        .collect()
}

pub fn load_jobs(path: &Path) -> Result<Vec<Job>, WorkerError> {
    let text = std::fs::read_to_string(path).map_err(|e| WorkerError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(parse_jobs(&text))
}

/// Run one job through `shell -c`, inheriting stdout/stderr.
pub async fn run_job(shell: &str, job: &Job) -> Result<JobOutcome, WorkerError> {
    tracing::info!(line = job.line, command = %job.command, "starting job");
    let start = Instant::now();

    let mut child = Command::new(shell)
        .arg("-c")
        .arg(&job.command)
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| WorkerError::Spawn { source: e })?;

    let status = child
        .wait()
        .await
        .map_err(|e| WorkerError::Io { source: e })?;

    let outcome = JobOutcome {
        exit_code: status.code(),
        duration: start.elapsed(),
    };
    tracing::info!(
        line = job.line,
        exit_code = ?outcome.exit_code,
        duration_ms = outcome.duration.as_millis() as u64,
        "job finished"
    );
    Ok(outcome)
}

/// Run `jobs` until they are exhausted or the process is told to go quiet.
///
/// Once quiet, no further job is started. If the quiet came without a stop,
/// the loop idles until SIGTERM/SIGINT so the shutdown sequence (or an
/// operator) decides when the process exits.
pub async fn run_worker(
    controller: Arc<Controller>,
    tracker: WorkTracker,
    signals: SignalHandler,
    jobs: Vec<Job>,
    config: &WorkerConfig,
) -> WorkerSummary {
    let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut running: JoinSet<bool> = JoinSet::new();
    let mut summary = WorkerSummary::default();
    let total = jobs.len();

    for (index, job) in jobs.into_iter().enumerate() {
        let permit = tokio::select! {
            permit = Arc::clone(&permits).acquire_owned() => permit,
            _ = signals.wait_quiet() => {
                summary.not_started = total - index;
                break;
            }
        };
        let Ok(permit) = permit else {
            break;
        };
        if signals.quiesced() {
            summary.not_started = total - index;
            break;
        }

        let in_flight = tracker.enter();
        let controller = Arc::clone(&controller);
        let shell = config.shell.clone();
        running.spawn(async move {
            let _permit = permit;
            let _in_flight = in_flight;
            let work = job.descriptor();
            match controller.wrap(&work, || run_job(&shell, &job)).await {
                Ok(outcome) => outcome.success(),
                Err(e) => {
                    tracing::warn!(line = job.line, error = %e, "job failed to run");
                    false
                }
            }
        });
    }

    while let Some(result) = running.join_next().await {
        match result {
            Ok(true) => summary.succeeded += 1,
            Ok(false) => summary.failed += 1,
            Err(e) => {
                tracing::error!(error = %e, "job task panicked");
                summary.failed += 1;
            }
        }
    }

    if signals.quiesced() && !signals.stopping() {
        tracing::info!("quiet and idle, waiting for stop signal");
        signals.wait_stopping().await;
    }

    tracing::info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        not_started = summary.not_started,
        "worker finished"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardConfig;
    use crate::registry::LocalRegistry;
    use crate::signals::{SignalError, SignalSender};
    use nix::sys::signal::Signal;
    use nix::unistd::Pid;

    /// Delivers lifecycle "signals" straight to a handler instead of the OS.
    struct Loopback(SignalHandler);

    impl SignalSender for Loopback {
        fn send(&self, signal: Signal, _pid: Pid) -> Result<(), SignalError> {
            match signal {
                Signal::SIGTSTP => self.0.request_quiet(),
                Signal::SIGTERM => self.0.request_stop(),
                _ => {}
            }
            Ok(())
        }
    }

    fn worker_config(concurrency: usize) -> WorkerConfig {
        WorkerConfig {
            concurrency,
            shell: "sh".to_string(),
        }
    }

    fn controller(max_rss_mb: u64, signals: &SignalHandler, tracker: &WorkTracker) -> Arc<Controller> {
        let loopback: Arc<dyn SignalSender> = Arc::new(Loopback(signals.clone()));
        let registry = Arc::new(LocalRegistry::new(
            "host:1",
            tracker.clone(),
            Signal::SIGTSTP,
            Arc::clone(&loopback),
        ));
        let config = GuardConfig {
            max_rss_mb,
            ..GuardConfig::default()
        };
        let sampler = || -> Result<f64, crate::memory::SampleError> { Ok(100.0) };
        Arc::new(
            Controller::builder(config, registry)
                .identity("host:1")
                .sampler(Arc::new(sampler))
                .signaler(loopback)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_parse_jobs_skips_blank_and_comments() {
        let jobs = parse_jobs("echo one\n\n# comment\n   echo two  \n");
        assert_eq!(
            jobs,
            vec![
                Job {
                    line: 1,
                    command: "echo one".to_string()
                },
                Job {
                    line: 4,
                    command: "echo two".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_job_descriptor() {
        let job = Job {
            line: 7,
            command: "make report".to_string(),
        };
        let work = job.descriptor();
        assert_eq!(work.id, "7");
        assert_eq!(work.class, "shell");
        assert_eq!(work.args, serde_json::json!("make report"));
    }

    #[test]
    fn test_load_jobs_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_jobs(&dir.path().join("jobs.txt")).unwrap_err();
        assert!(matches!(err, WorkerError::Read { .. }));
    }

    #[test]
    fn test_load_jobs_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.txt");
        std::fs::write(&path, "true\nfalse\n").unwrap();
        assert_eq!(load_jobs(&path).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_run_job_exit_codes() {
        let ok = Job {
            line: 1,
            command: "exit 0".to_string(),
        };
        let bad = Job {
            line: 2,
            command: "exit 42".to_string(),
        };
        assert!(run_job("sh", &ok).await.unwrap().success());
        let outcome = run_job("sh", &bad).await.unwrap();
        assert_eq!(outcome.exit_code, Some(42));
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn test_run_job_spawn_failure() {
        let job = Job {
            line: 1,
            command: "true".to_string(),
        };
        let err = run_job("nonexistent-shell-xyz", &job).await.unwrap_err();
        assert!(matches!(err, WorkerError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_worker_runs_all_jobs_below_ceiling() {
        let signals = SignalHandler::detached();
        let tracker = WorkTracker::new();
        let controller = controller(0, &signals, &tracker);
        let jobs = parse_jobs("true\nfalse\ntrue\nexit 3\n");

        let summary = run_worker(controller, tracker.clone(), signals, jobs, &worker_config(2)).await;

        assert_eq!(
            summary,
            WorkerSummary {
                succeeded: 2,
                failed: 2,
                not_started: 0
            }
        );
        assert_eq!(tracker.count(), 0);
    }

    #[tokio::test]
    async fn test_worker_takes_no_jobs_once_quiet() {
        let signals = SignalHandler::detached();
        signals.request_stop();
        let tracker = WorkTracker::new();
        let controller = controller(0, &signals, &tracker);

        let summary = run_worker(controller, tracker, signals, parse_jobs("true\ntrue\n"), &worker_config(1)).await;

        assert_eq!(summary.not_started, 2);
        assert_eq!(summary.succeeded, 0);
    }

    #[tokio::test]
    async fn test_quiet_wakes_worker_waiting_for_a_slot() {
        let signals = SignalHandler::detached();
        let tracker = WorkTracker::new();
        let controller = controller(0, &signals, &tracker);
        let jobs = parse_jobs("sleep 1\ntrue\ntrue\n");

        let (worker_tracker, worker_signals) = (tracker.clone(), signals.clone());
        let worker = tokio::spawn(async move {
            run_worker(controller, worker_tracker, worker_signals, jobs, &worker_config(1)).await
        });
        // The first job holds the only slot; the loop now waits for a permit.
        tokio::time::timeout(Duration::from_secs(5), async {
            while tracker.count() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        signals.request_stop();

        let summary = tokio::time::timeout(Duration::from_secs(10), worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            summary,
            WorkerSummary {
                succeeded: 1,
                failed: 0,
                not_started: 2
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_breach_quiets_worker_then_stop_ends_it() {
        let signals = SignalHandler::detached();
        let tracker = WorkTracker::new();
        // 100 MB sampled against a 50 MB ceiling: the first job trips the guard.
        let controller = controller(50, &signals, &tracker);
        let jobs = parse_jobs("true\ntrue\ntrue\n");

        let summary = run_worker(
            Arc::clone(&controller),
            tracker,
            signals.clone(),
            jobs,
            &worker_config(1),
        )
        .await;

        assert!(controller.shutdown_requested());
        assert!(signals.stopping());
        assert!(summary.not_started >= 1);
        assert_eq!(summary.succeeded + summary.failed + summary.not_started, 3);
    }
}
