/// Composition root: wraps units of work and starts the shutdown sequence
/// when a post-work memory check breaches the ceiling.
use crate::breach::{
    BreachDecision, BreachEvaluator, HookError, ReclaimHook, ShutdownHook, SkipPredicate,
    WorkDescriptor,
};
use crate::config::{ConfigError, GuardConfig};
use crate::guard::ShutdownGuard;
use crate::memory::{MemorySampler, ProcSampler};
use crate::registry::{self, ProcessRegistry};
use crate::sequencer::{SequencerSettings, ShutdownSequencer, ShutdownState, ShutdownTrigger};
use crate::signals::{ProcessSignaler, SignalSender};
use crate::status::StatusFile;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// State shared with the detached shutdown task.
struct Shared {
    guard: ShutdownGuard,
    sequencer: ShutdownSequencer,
}

pub struct Controller {
    evaluator: Arc<BreachEvaluator>,
    on_shutdown: Option<ShutdownHook>,
    shared: Arc<Shared>,
    runtime: Handle,
}

impl Controller {
    pub fn builder(config: GuardConfig, registry: Arc<dyn ProcessRegistry>) -> ControllerBuilder {
        ControllerBuilder {
            config,
            registry,
            identity: None,
            sampler: None,
            signaler: None,
            skip: None,
            on_shutdown: None,
            reclaim: None,
            runtime: None,
        }
    }

    /// Run `job`, then check memory. The job's output is returned untouched;
    /// a breach only ever schedules background work.
    ///
    /// The check runs on the blocking pool: sampling may shell out to `ps`
    /// and the hooks are arbitrary user code.
    pub async fn wrap<F, Fut, T>(&self, work: &WorkDescriptor, job: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let output = job().await;
        self.check_async(work).await;
        output
    }

    /// `check` for async callers.
    pub async fn check_async(&self, work: &WorkDescriptor) -> Option<JoinHandle<()>> {
        if self.evaluator.max_rss_mb() == 0 {
            return None;
        }
        let evaluator = Arc::clone(&self.evaluator);
        let owned = work.clone();
        let decision = match self
            .runtime
            .spawn_blocking(move || evaluator.evaluate(&owned))
            .await
        {
            Ok(decision) => decision,
            Err(e) => {
                warn!(error = %e, work_id = %work.id, "memory check did not complete");
                BreachDecision::NoBreach
            }
        };
        self.act_on(work, decision)
    }

    /// Blocking variant for thread-based workers. The check also runs when
    /// `job` panics; the panic is resumed afterwards.
    pub fn wrap_blocking<F, T>(&self, work: &WorkDescriptor, job: F) -> T
    where
        F: FnOnce() -> T,
    {
        let output = catch_unwind(AssertUnwindSafe(job));
        self.check(work);
        match output {
            Ok(output) => output,
            Err(panic) => resume_unwind(panic),
        }
    }

    /// Post-work check. Returns the shutdown task handle if this call started it.
    pub fn check(&self, work: &WorkDescriptor) -> Option<JoinHandle<()>> {
        self.act_on(work, self.evaluator.evaluate(work))
    }

    fn act_on(&self, work: &WorkDescriptor, decision: BreachDecision) -> Option<JoinHandle<()>> {
        match decision {
            BreachDecision::NoBreach => None,
            BreachDecision::Skipped { .. } => None,
            BreachDecision::Breached { rss_mb } => self.request_shutdown(work, rss_mb),
        }
    }

    /// Start the shutdown sequence unless one is already under way.
    ///
    /// The sequence runs detached on the controller's runtime; the returned
    /// handle resolves when it ends (or never, once the kill signal lands).
    pub fn request_shutdown(&self, work: &WorkDescriptor, rss_mb: f64) -> Option<JoinHandle<()>> {
        if !self.shared.guard.try_acquire() {
            debug!(work_id = %work.id, rss_mb, "shutdown already in progress");
            return None;
        }
        self.run_on_shutdown(work);

        let trigger = ShutdownTrigger {
            rss_mb,
            work_id: work.id.clone(),
            class: work.class.clone(),
        };
        let shared = Arc::clone(&self.shared);
        let sequence = self
            .runtime
            .spawn(async move { shared.sequencer.run(&trigger).await });

        Some(self.runtime.spawn(async move {
            match sequence.await {
                Ok(Ok(state)) => debug!(state = %state, "shutdown sequence finished"),
                Ok(Err(e)) => error!(error = %e, "shutdown sequence failed"),
                Err(e) if e.is_panic() => error!(error = %e, "shutdown sequence panicked"),
                Err(e) => error!(error = %e, "shutdown sequence cancelled"),
            }
        }))
    }

    fn run_on_shutdown(&self, work: &WorkDescriptor) {
        let Some(hook) = &self.on_shutdown else {
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| hook(work))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, work_id = %work.id, "on_shutdown hook failed"),
            Err(_) => warn!(work_id = %work.id, "on_shutdown hook panicked"),
        }
    }

    pub fn state(&self) -> ShutdownState {
        self.shared.sequencer.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.shared.sequencer.subscribe()
    }

    pub fn identity(&self) -> &str {
        self.shared.sequencer.identity()
    }

    pub fn max_rss_mb(&self) -> u64 {
        self.evaluator.max_rss_mb()
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shared.guard.is_acquired()
    }
}

pub struct ControllerBuilder {
    config: GuardConfig,
    registry: Arc<dyn ProcessRegistry>,
    identity: Option<String>,
    sampler: Option<Arc<dyn MemorySampler>>,
    signaler: Option<Arc<dyn SignalSender>>,
    skip: Option<SkipPredicate>,
    on_shutdown: Option<ShutdownHook>,
    reclaim: Option<ReclaimHook>,
    runtime: Option<Handle>,
}

impl ControllerBuilder {
    /// Registry key for this process. Defaults to `host:pid`.
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn sampler(mut self, sampler: Arc<dyn MemorySampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn signaler(mut self, signaler: Arc<dyn SignalSender>) -> Self {
        self.signaler = Some(signaler);
        self
    }

    pub fn skip_shutdown_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&WorkDescriptor) -> Result<bool, HookError> + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(predicate));
        self
    }

    pub fn on_shutdown<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WorkDescriptor) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.on_shutdown = Some(Arc::new(hook));
        self
    }

    pub fn reclaim<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reclaim = Some(Arc::new(hook));
        self
    }

    /// Runtime for the shutdown task. Defaults to the runtime `build` runs on.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn build(self) -> Result<Controller, BuildError> {
        let kill_signal = self.config.kill_signal().map_err(|e| BuildError::Config {
            source: ConfigError::Signal {
                field: "kill_signal",
                source: e,
            },
        })?;
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| BuildError::NoRuntime)?,
        };

        let sampler = self
            .sampler
            .unwrap_or_else(|| Arc::new(ProcSampler::new()));
        let signaler = self.signaler.unwrap_or_else(|| Arc::new(ProcessSignaler));
        let identity = self.identity.unwrap_or_else(registry::identity);

        let mut evaluator = BreachEvaluator::new(self.config.max_rss_mb, self.config.gc, sampler);
        if let Some(skip) = self.skip {
            evaluator.set_skip(skip);
        }
        if let Some(reclaim) = self.reclaim {
            evaluator.set_reclaim(reclaim);
        }

        let settings = SequencerSettings {
            max_rss_mb: self.config.max_rss_mb,
            grace_time: self.config.grace_time,
            shutdown_wait: self.config.shutdown_wait(),
            kill_signal,
        };
        let mut sequencer = ShutdownSequencer::new(identity, settings, self.registry, signaler);
        if let Some(path) = self.config.status_file.clone() {
            sequencer = sequencer.with_status_file(StatusFile::new(path));
        }

        Ok(Controller {
            evaluator: Arc::new(evaluator),
            on_shutdown: self.on_shutdown,
            shared: Arc::new(Shared {
                guard: ShutdownGuard::new(),
                sequencer,
            }),
            runtime,
        })
    }
}

#[derive(Debug)]
pub enum BuildError {
    Config { source: ConfigError },
    /// `build` was called outside a tokio runtime and no handle was given.
    NoRuntime,
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::Config { source } => write!(f, "invalid guard config: {source}"),
            BuildError::NoRuntime => write!(f, "no tokio runtime available for the shutdown task"),
        }
    }
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BuildError::Config { source } => Some(source),
            BuildError::NoRuntime => None,
        }
    }
}
