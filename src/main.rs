use clap::Parser;
use memguard::config::{GraceTime, MemguardConfig};
use memguard::registry::{self, LocalRegistry, WorkTracker};
use memguard::signals::{ProcessSignaler, SignalHandler, SignalSender};
use memguard::status::StatusFile;
use memguard::worker;
use memguard::Controller;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Run shell jobs in a worker process that shuts itself down gracefully
/// once its resident memory exceeds a ceiling.
#[derive(Parser, Debug)]
#[command(name = "memguard", version, about)]
pub struct Cli {
    /// Jobs file: one shell command per line
    #[arg(value_name = "JOBS_FILE")]
    jobs: Option<PathBuf>,

    /// Config file path
    #[arg(short, long, default_value = "memguard.toml")]
    config: PathBuf,

    /// Resident memory ceiling in MB, 0 disables (overrides config)
    #[arg(long, value_name = "MB")]
    max_rss: Option<u64>,

    /// Seconds to let in-flight jobs drain, or "infinite" (overrides config)
    #[arg(long, value_name = "SECS")]
    grace_time: Option<GraceTime>,

    /// Seconds between SIGTERM and the kill signal (overrides config)
    #[arg(long, value_name = "SECS")]
    shutdown_wait: Option<u64>,

    /// Final signal, e.g. SIGKILL (overrides config)
    #[arg(long)]
    kill_signal: Option<String>,

    /// Skip the reclaim-and-resample step before acting on a breach
    #[arg(long)]
    no_gc: bool,

    /// Max concurrent jobs (overrides config)
    #[arg(short = 'j', long)]
    concurrency: Option<usize>,

    /// Shutdown status file (overrides config)
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Print the last recorded shutdown and exit
    #[arg(long)]
    status: bool,

    /// Extra logging (sampler fallbacks, drain checks)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut MemguardConfig) {
        if let Some(mb) = self.max_rss {
            config.guard.max_rss_mb = mb;
        }
        if let Some(grace) = self.grace_time {
            config.guard.grace_time = grace;
        }
        if let Some(wait) = self.shutdown_wait {
            config.guard.shutdown_wait_secs = wait;
        }
        if let Some(signal) = &self.kill_signal {
            config.guard.kill_signal = signal.clone();
        }
        if self.no_gc {
            config.guard.gc = false;
        }
        if let Some(n) = self.concurrency {
            config.worker.concurrency = n;
        }
        if let Some(path) = &self.status_file {
            config.guard.status_file = Some(path.clone());
        }
    }

    fn log_filter(&self) -> EnvFilter {
        let default = if self.verbose {
            "memguard=debug"
        } else if self.quiet {
            "memguard=warn"
        } else {
            "memguard=info"
        };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_filter())
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match MemguardConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };
    cli.apply_overrides(&mut config);
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }

    if cli.status {
        return print_status(&config);
    }

    if cli.dry_run {
        println!("memguard v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("{config:#?}");
        if !config.guard.enabled() {
            println!("max_rss_mb is 0: memory guard disabled");
        }
        return ExitCode::SUCCESS;
    }

    let Some(jobs_path) = cli.jobs.as_deref() else {
        tracing::error!("no jobs file given");
        return ExitCode::FAILURE;
    };
    let jobs = match worker::load_jobs(jobs_path) {
        Ok(jobs) => jobs,
        Err(e) => {
            tracing::error!(error = %e, "failed to load jobs");
            return ExitCode::FAILURE;
        }
    };

    // validate() already accepted the signal name.
    let quiet_signal = match config.guard.quiet_signal() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "invalid quiet signal");
            return ExitCode::FAILURE;
        }
    };
    let signals = match SignalHandler::install(quiet_signal) {
        Ok(handler) => handler,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    let identity = registry::identity();
    let tracker = WorkTracker::new();
    let signaler: Arc<dyn SignalSender> = Arc::new(ProcessSignaler);
    let registry = Arc::new(LocalRegistry::new(
        identity.clone(),
        tracker.clone(),
        quiet_signal,
        Arc::clone(&signaler),
    ));
    let controller = match Controller::builder(config.guard.clone(), registry.clone())
        .identity(identity.clone())
        .signaler(signaler)
        .build()
    {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!(error = %e, "failed to build controller");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        identity = %identity,
        max_rss_mb = config.guard.max_rss_mb,
        grace_time = %config.guard.grace_time,
        jobs = jobs.len(),
        "memguard worker starting"
    );

    let summary = worker::run_worker(controller, tracker, signals, jobs, &config.worker).await;
    tracing::debug!(lifecycle = ?registry.lifecycle(), "worker exiting");
    if summary.failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn print_status(config: &MemguardConfig) -> ExitCode {
    let Some(path) = &config.guard.status_file else {
        println!("No status file configured (set guard.status_file or --status-file).");
        return ExitCode::SUCCESS;
    };
    match StatusFile::new(path.clone()).read() {
        Ok(Some(status)) => {
            println!("Identity:    {}", status.identity);
            println!("PID:         {}", status.pid);
            println!("State:       {}", status.state);
            println!("RSS:         {:.1} MB (max {} MB)", status.rss_mb, status.max_rss_mb);
            println!("Triggered by work {}", status.work_id);
            println!("Started:     {}", status.started_at.to_rfc3339());
            println!("Last update: {}", status.last_update.to_rfc3339());
            ExitCode::SUCCESS
        }
        Ok(None) => {
            println!("No shutdown recorded at {}.", path.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to read status file");
            ExitCode::FAILURE
        }
    }
}
