//! Task schedulers.
//!
//! Every scheduler follows the same lifecycle: it accepts tasks only between
//! `start` and `terminate`, and once terminated it stays terminated. Task
//! panics are contained at the execution boundary and logged.

mod events;
mod interrupt;
mod self_scheduler;
mod set;
mod thread_scheduler;

pub use events::{EventBus, EventKind, Observer, ObserverId, SchedulerEvent};
pub use interrupt::{InterruptToken, interrupted, sleep_interruptibly};
pub use self_scheduler::SelfScheduler;
pub use set::SchedulerSet;
pub use thread_scheduler::ThreadScheduler;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use crate::error::{SchedulerError, SchedulerResult};

/// A unit of work executed at most once.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Outcome of a bounded termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The scheduler's execution context has fully stopped.
    Completed,
    /// The timeout elapsed while work was still running.
    TimedOut,
}

impl Termination {
    pub fn is_completed(self) -> bool {
        self == Termination::Completed
    }
}

pub trait Scheduler: Send + Sync {
    /// Hands `task` to the scheduler. Fails if not started or already terminated.
    fn schedule_task(&self, task: Task) -> SchedulerResult<()>;

    /// Number of tasks waiting to run, excluding any that is executing.
    fn queue_size(&self) -> usize;

    /// Starting an already started scheduler is a no-op.
    fn start(&self) -> SchedulerResult<()>;

    /// Stops accepting tasks and blocks until the execution context has stopped.
    fn terminate(&self) -> SchedulerResult<()>;

    /// Like [`Scheduler::terminate`] but waits at most `timeout`.
    fn terminate_timeout(&self, timeout: Duration) -> SchedulerResult<Termination>;

    /// Like [`Scheduler::terminate`] but also interrupts the running task and
    /// discards anything still queued.
    fn force_terminate(&self) -> SchedulerResult<()>;

    fn is_started(&self) -> bool;

    fn is_terminated(&self) -> bool;

    fn is_active(&self) -> bool {
        self.is_started() && !self.is_terminated()
    }

    /// No queued task and no task executing.
    fn is_done(&self) -> bool;

    /// Blocks until [`Scheduler::is_done`] holds.
    fn wait_until_done(&self);

    fn events(&self) -> &EventBus;

    fn schedule<F>(&self, task: F) -> SchedulerResult<()>
    where
        F: FnOnce() + Send + 'static,
        Self: Sized,
    {
        self.schedule_task(Box::new(task))
    }
}

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
    fn schedule_task(&self, task: Task) -> SchedulerResult<()> {
        (**self).schedule_task(task)
    }

    fn queue_size(&self) -> usize {
        (**self).queue_size()
    }

    fn start(&self) -> SchedulerResult<()> {
        (**self).start()
    }

    fn terminate(&self) -> SchedulerResult<()> {
        (**self).terminate()
    }

    fn terminate_timeout(&self, timeout: Duration) -> SchedulerResult<Termination> {
        (**self).terminate_timeout(timeout)
    }

    fn force_terminate(&self) -> SchedulerResult<()> {
        (**self).force_terminate()
    }

    fn is_started(&self) -> bool {
        (**self).is_started()
    }

    fn is_terminated(&self) -> bool {
        (**self).is_terminated()
    }

    fn is_done(&self) -> bool {
        (**self).is_done()
    }

    fn wait_until_done(&self) {
        (**self).wait_until_done()
    }

    fn events(&self) -> &EventBus {
        (**self).events()
    }
}

/// Started/terminated flags shared by every scheduler implementation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Lifecycle {
    started: bool,
    terminated: bool,
}

impl Lifecycle {
    pub(crate) const fn running() -> Self {
        Self {
            started: true,
            terminated: false,
        }
    }

    pub(crate) fn is_started(self) -> bool {
        self.started
    }

    pub(crate) fn is_terminated(self) -> bool {
        self.terminated
    }

    pub(crate) fn ensure_accepting(self) -> SchedulerResult<()> {
        if self.terminated {
            Err(SchedulerError::Terminated)
        } else if !self.started {
            Err(SchedulerError::NotStarted)
        } else {
            Ok(())
        }
    }

    /// Returns `true` only on the transition into the started state.
    pub(crate) fn begin(&mut self) -> SchedulerResult<bool> {
        if self.terminated {
            return Err(SchedulerError::Terminated);
        }
        if self.started {
            return Ok(false);
        }
        self.started = true;
        Ok(true)
    }

    pub(crate) fn end(&mut self) -> SchedulerResult<()> {
        if self.terminated {
            return Err(SchedulerError::AlreadyTerminated);
        }
        self.terminated = true;
        Ok(())
    }
}

/// Runs `task`, logging instead of propagating a panic. Returns `false` if it panicked.
pub(crate) fn run_guarded(task: Task, scheduler: &str) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(()) => true,
        Err(payload) => {
            error!(
                scheduler,
                panic = %panic_message(&*payload),
                "task panicked; continuing with next task"
            );
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
