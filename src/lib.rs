//! Memory-guarded graceful shutdown for long-running worker processes.
//!
//! After each unit of work the [`Controller`] samples this process's resident
//! memory. Once a configured ceiling is exceeded it starts, exactly once, a
//! background sequence that quiesces the process, lets in-flight work drain
//! for a grace period, stops it, and finally delivers a kill signal to itself.

pub mod breach;
pub mod config;
pub mod controller;
pub mod guard;
pub mod memory;
pub mod registry;
pub mod sequencer;
pub mod signals;
pub mod status;
pub mod worker;

pub use breach::{BreachDecision, BreachEvaluator, WorkDescriptor};
pub use config::{GraceTime, GuardConfig, MemguardConfig};
pub use controller::{BuildError, Controller, ControllerBuilder};
pub use guard::ShutdownGuard;
pub use memory::{MemorySampler, ProcSampler};
pub use registry::{LocalRegistry, ProcessRecord, ProcessRegistry, WorkTracker};
pub use sequencer::{ShutdownSequencer, ShutdownState};
pub use signals::{ProcessSignaler, SignalHandler, SignalSender};
