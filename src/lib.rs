//! Pluggable task schedulers and a pausable periodic timer.
//!
//! A [`Scheduler`] decides where tasks run: inline on the caller
//! ([`SelfScheduler`]), on one dedicated worker ([`ThreadScheduler`]), or
//! across a pool of children ([`SchedulerSet`]). A [`ThreadTimer`] fires a
//! fixed task set on any scheduler once per interval, optionally adapting the
//! interval to how long each batch takes.

pub mod cli;
pub mod error;
pub mod logger;
pub mod scheduler;
pub mod timer;

pub use schedtools_config as config;

pub use error::{SchedulerError, SchedulerResult, TimerError};
pub use scheduler::{
    EventBus, EventKind, InterruptToken, Observer, ObserverId, Scheduler, SchedulerEvent,
    SchedulerSet, SelfScheduler, Task, Termination, ThreadScheduler, interrupted,
    sleep_interruptibly,
};
pub use timer::{ThreadTimer, TimerMetrics, TimerState, TimerTask};
