use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::info;

use super::events::{EventBus, EventKind};
use super::{Lifecycle, Scheduler, Task, Termination, run_guarded};
use crate::error::SchedulerResult;

/// Executes each task synchronously on the thread that schedules it.
///
/// Panics are still contained, so the caller never observes a task failure.
/// `force_terminate` behaves like `terminate`: the running task belongs to the
/// caller's thread and cannot be interrupted.
pub struct SelfScheduler {
    state: Mutex<State>,
    idle: Condvar,
    events: EventBus,
}

struct State {
    lifecycle: Lifecycle,
    /// Threads currently inside `schedule_task`.
    running: Vec<ThreadId>,
    /// `Terminated` is owed to observers once the last caller leaves.
    terminated_pending: bool,
}

impl Default for SelfScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SelfScheduler {
    pub fn new() -> Self {
        Self::with_lifecycle(Lifecycle::default())
    }

    /// A scheduler that is already started.
    pub fn started() -> Self {
        Self::with_lifecycle(Lifecycle::running())
    }

    fn with_lifecycle(lifecycle: Lifecycle) -> Self {
        Self {
            state: Mutex::new(State {
                lifecycle,
                running: Vec::new(),
                terminated_pending: false,
            }),
            idle: Condvar::new(),
            events: EventBus::new(),
        }
    }

    fn shutdown(&self, deadline: Option<Instant>) -> SchedulerResult<Termination> {
        let mut state = self.state.lock();
        state.lifecycle.end()?;
        info!("terminating self scheduler");

        let outcome = self.wait_for_callers(&mut state, deadline);
        // Callers still inside (a timed-out wait, or a task terminating its
        // own scheduler) emit `Terminated` after their last event.
        let emit_now = state.running.is_empty();
        state.terminated_pending = !emit_now;
        drop(state);
        if emit_now {
            self.events.force_notify(EventKind::Terminated);
        }
        Ok(outcome)
    }

    /// Waits for other threads still executing tasks inline. A task that
    /// terminates its own scheduler is not waited for.
    fn wait_for_callers(
        &self,
        state: &mut MutexGuard<'_, State>,
        deadline: Option<Instant>,
    ) -> Termination {
        let me = thread::current().id();
        while state.running.iter().any(|id| *id != me) {
            match deadline {
                Some(deadline) => {
                    if self.idle.wait_until(state, deadline).timed_out() {
                        return Termination::TimedOut;
                    }
                }
                None => self.idle.wait(state),
            }
        }
        Termination::Completed
    }
}

impl Scheduler for SelfScheduler {
    fn schedule_task(&self, task: Task) -> SchedulerResult<()> {
        let me = thread::current().id();
        {
            let mut state = self.state.lock();
            state.lifecycle.ensure_accepting()?;
            state.running.push(me);
        }

        self.events.force_notify(EventKind::TaskStarted);
        run_guarded(task, "self");

        let (last, terminated) = {
            let mut state = self.state.lock();
            if let Some(index) = state.running.iter().position(|id| *id == me) {
                state.running.swap_remove(index);
            }
            let last = state.running.is_empty();
            let terminated = last && std::mem::take(&mut state.terminated_pending);
            self.idle.notify_all();
            (last, terminated)
        };

        self.events.force_notify(if last {
            EventKind::AllTasksFinished
        } else {
            EventKind::TaskFinished
        });
        if terminated {
            self.events.force_notify(EventKind::Terminated);
        }
        Ok(())
    }

    fn queue_size(&self) -> usize {
        self.state.lock().running.len()
    }

    fn start(&self) -> SchedulerResult<()> {
        if self.state.lock().lifecycle.begin()? {
            self.events.force_notify(EventKind::Started);
        }
        Ok(())
    }

    fn terminate(&self) -> SchedulerResult<()> {
        self.shutdown(None).map(drop)
    }

    fn terminate_timeout(&self, timeout: Duration) -> SchedulerResult<Termination> {
        self.shutdown(Some(Instant::now() + timeout))
    }

    fn force_terminate(&self) -> SchedulerResult<()> {
        self.shutdown(None).map(drop)
    }

    fn is_started(&self) -> bool {
        self.state.lock().lifecycle.is_started()
    }

    fn is_terminated(&self) -> bool {
        self.state.lock().lifecycle.is_terminated()
    }

    fn is_done(&self) -> bool {
        self.state.lock().running.is_empty()
    }

    fn wait_until_done(&self) {
        let mut state = self.state.lock();
        let me = thread::current().id();
        while state.running.iter().any(|id| *id != me) {
            self.idle.wait(&mut state);
        }
    }

    fn events(&self) -> &EventBus {
        &self.events
    }
}

impl fmt::Debug for SelfScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SelfScheduler")
            .field("lifecycle", &state.lifecycle)
            .field("running", &state.running.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![expect(clippy::panic, reason = "Panicking tasks exercise failure containment")]

    use super::*;
    use crate::error::SchedulerError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn runs_inline_on_caller_thread() {
        let scheduler = SelfScheduler::started();
        let caller = thread::current().id();
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);

        scheduler
            .schedule(move || {
                *slot.lock() = Some(thread::current().id());
            })
            .unwrap();

        assert_eq!(*seen.lock(), Some(caller));
        assert!(scheduler.is_done());
        assert_eq!(scheduler.queue_size(), 0);
    }

    #[test]
    fn queue_size_is_one_while_inside_task() {
        let scheduler = Arc::new(SelfScheduler::started());
        let inner = Arc::clone(&scheduler);
        let observed = Arc::new(Mutex::new((0, true)));
        let slot = Arc::clone(&observed);

        scheduler
            .schedule(move || {
                *slot.lock() = (inner.queue_size(), inner.is_done());
            })
            .unwrap();

        assert_eq!(*observed.lock(), (1, false));
    }

    #[test]
    fn honours_lifecycle_gating() {
        let scheduler = SelfScheduler::new();
        assert!(matches!(
            scheduler.schedule(|| {}),
            Err(SchedulerError::NotStarted)
        ));
        scheduler.start().unwrap();
        scheduler.terminate().unwrap();
        assert!(matches!(
            scheduler.schedule(|| {}),
            Err(SchedulerError::Terminated)
        ));
    }

    #[test]
    fn reports_events_like_threaded_schedulers() {
        let scheduler = SelfScheduler::new();
        let (_, events) = scheduler.events().subscribe_channel();

        scheduler.start().unwrap();
        scheduler.schedule(|| {}).unwrap();
        scheduler.terminate().unwrap();

        let kinds: Vec<_> = events.try_iter().filter_map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Started,
                EventKind::TaskStarted,
                EventKind::AllTasksFinished,
                EventKind::Terminated,
            ]
        );
    }

    #[test]
    fn panic_is_not_propagated_to_caller() {
        let scheduler = SelfScheduler::started();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        scheduler.schedule(|| panic!("inline failure")).unwrap();
        scheduler
            .schedule(move || flag.store(true, Ordering::SeqCst))
            .unwrap();

        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn timed_out_termination_still_ends_with_terminated() {
        let scheduler = Arc::new(SelfScheduler::started());
        let (_, events) = scheduler.events().subscribe_channel();
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

        let caller = {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || {
                scheduler
                    .schedule(move || {
                        entered_tx.send(()).unwrap();
                        let _ = release_rx.recv();
                    })
                    .unwrap();
            })
        };
        entered_rx.recv().unwrap();

        let outcome = scheduler
            .terminate_timeout(Duration::from_millis(20))
            .unwrap();
        assert_eq!(outcome, Termination::TimedOut);
        assert!(scheduler.is_terminated());
        let before: Vec<_> = events.try_iter().filter_map(|e| e.kind()).collect();
        assert!(!before.contains(&EventKind::Terminated));

        drop(release_tx);
        caller.join().unwrap();
        let after: Vec<_> = events.try_iter().filter_map(|e| e.kind()).collect();
        assert_eq!(
            after,
            vec![EventKind::AllTasksFinished, EventKind::Terminated]
        );
    }

    #[test]
    fn task_may_terminate_its_own_scheduler() {
        let scheduler = Arc::new(SelfScheduler::started());
        let (_, events) = scheduler.events().subscribe_channel();
        let inner = Arc::clone(&scheduler);

        scheduler
            .schedule(move || {
                inner.terminate().unwrap();
            })
            .unwrap();

        assert!(scheduler.is_terminated());
        let kinds: Vec<_> = events.try_iter().filter_map(|e| e.kind()).collect();
        assert_eq!(kinds.last(), Some(&EventKind::Terminated));
        assert_eq!(
            kinds.iter().filter(|kind| **kind == EventKind::Terminated).count(),
            1
        );
    }
}
