use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use schedtools_config::{SchedulerConfig, ShutdownPolicy};
use tracing::{debug, error, info};

use super::events::{EventBus, EventKind};
use super::interrupt::InterruptToken;
use super::{Lifecycle, Scheduler, Task, Termination, run_guarded};
use crate::error::{SchedulerError, SchedulerResult};

/// Runs tasks one at a time, in submission order, on a dedicated worker thread.
pub struct ThreadScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    config: SchedulerConfig,
    state: Mutex<State>,
    /// Signalled when a task is queued or termination is requested.
    work_ready: Condvar,
    /// Signalled when the scheduler becomes done.
    idle: Condvar,
    /// Signalled when the worker thread leaves its loop.
    exited: Condvar,
    events: EventBus,
    interrupt: InterruptToken,
}

struct State {
    lifecycle: Lifecycle,
    queue: VecDeque<Task>,
    done: bool,
    forced: bool,
    worker_exited: bool,
}

impl ThreadScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State {
                    lifecycle: Lifecycle::default(),
                    queue: VecDeque::new(),
                    done: true,
                    forced: false,
                    worker_exited: true,
                }),
                work_ready: Condvar::new(),
                idle: Condvar::new(),
                exited: Condvar::new(),
                events: EventBus::new(),
                interrupt: InterruptToken::new(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Creates and starts a scheduler.
    pub fn spawn(config: SchedulerConfig) -> SchedulerResult<Self> {
        let scheduler = Self::new(config);
        scheduler.start()?;
        Ok(scheduler)
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    fn shutdown(&self, force: bool, timeout: Option<Duration>) -> SchedulerResult<Termination> {
        let had_worker = {
            let mut state = self.shared.state.lock();
            state.lifecycle.end()?;
            state.forced |= force;
            self.shared.work_ready.notify_all();
            !state.worker_exited
        };
        info!(scheduler = %self.name(), force, "terminating scheduler");

        if force {
            self.shared.interrupt.interrupt();
        }

        if !had_worker {
            // Never started: nothing will ever run, so close out here.
            let mut state = self.shared.state.lock();
            state.queue.clear();
            state.done = true;
            self.shared.idle.notify_all();
            drop(state);
            self.shared.events.force_notify(EventKind::Terminated);
            return Ok(Termination::Completed);
        }

        Ok(self.join_worker(timeout))
    }

    fn join_worker(&self, timeout: Option<Duration>) -> Termination {
        let mut worker = self.worker.lock();
        if worker
            .as_ref()
            .is_some_and(|handle| handle.thread().id() == thread::current().id())
        {
            debug!(scheduler = %self.name(), "terminate called from the worker; not joining");
            return Termination::TimedOut;
        }

        if let Some(timeout) = timeout {
            let deadline = Instant::now() + timeout;
            let mut state = self.shared.state.lock();
            while !state.worker_exited {
                if self
                    .shared
                    .exited
                    .wait_until(&mut state, deadline)
                    .timed_out()
                {
                    break;
                }
            }
            if !state.worker_exited {
                return Termination::TimedOut;
            }
        }

        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                error!(scheduler = %self.name(), "worker thread panicked");
            }
        }
        Termination::Completed
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule_task(&self, task: Task) -> SchedulerResult<()> {
        let mut state = self.shared.state.lock();
        state.lifecycle.ensure_accepting()?;
        state.queue.push_back(task);
        state.done = false;
        self.shared.work_ready.notify_one();
        Ok(())
    }

    fn queue_size(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    fn start(&self) -> SchedulerResult<()> {
        {
            let mut state = self.shared.state.lock();
            if !state.lifecycle.begin()? {
                return Ok(());
            }
            state.worker_exited = false;
        }

        info!(scheduler = %self.name(), "starting scheduler");
        self.shared.events.force_notify(EventKind::Started);

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(self.shared.config.name.clone())
            .spawn(move || worker_loop(&shared));

        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(source) => {
                error!(scheduler = %self.name(), %source, "failed to spawn worker thread");
                {
                    let mut state = self.shared.state.lock();
                    let _ = state.lifecycle.end();
                    state.queue.clear();
                    state.done = true;
                    state.worker_exited = true;
                    self.shared.idle.notify_all();
                }
                self.shared.events.force_notify(EventKind::Terminated);
                Err(SchedulerError::Spawn {
                    name: self.shared.config.name.clone(),
                    source,
                })
            }
        }
    }

    fn terminate(&self) -> SchedulerResult<()> {
        self.shutdown(false, None).map(drop)
    }

    fn terminate_timeout(&self, timeout: Duration) -> SchedulerResult<Termination> {
        self.shutdown(false, Some(timeout))
    }

    fn force_terminate(&self) -> SchedulerResult<()> {
        self.shutdown(true, None).map(drop)
    }

    fn is_started(&self) -> bool {
        self.shared.state.lock().lifecycle.is_started()
    }

    fn is_terminated(&self) -> bool {
        self.shared.state.lock().lifecycle.is_terminated()
    }

    fn is_done(&self) -> bool {
        self.shared.state.lock().done
    }

    fn wait_until_done(&self) {
        let mut state = self.shared.state.lock();
        while !state.done {
            self.shared.idle.wait(&mut state);
        }
    }

    fn events(&self) -> &EventBus {
        &self.shared.events
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        // Signal only; joining here could block an unrelated thread on a long task.
        let mut state = self.shared.state.lock();
        if state.lifecycle.is_started() && !state.lifecycle.is_terminated() {
            let _ = state.lifecycle.end();
            self.shared.work_ready.notify_all();
        }
    }
}

impl fmt::Debug for ThreadScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ThreadScheduler")
            .field("name", &self.shared.config.name)
            .field("lifecycle", &state.lifecycle)
            .field("queued", &state.queue.len())
            .field("done", &state.done)
            .finish()
    }
}

fn worker_loop(shared: &Shared) {
    let _bound = shared.interrupt.bind_current();
    let name = shared.config.name.as_str();

    while let Some(task) = next_task(shared) {
        shared.events.force_notify(EventKind::TaskStarted);
        run_guarded(task, name);

        let drained = {
            let mut state = shared.state.lock();
            if state.queue.is_empty() {
                state.done = true;
                shared.idle.notify_all();
                true
            } else {
                false
            }
        };

        shared.events.force_notify(if drained {
            EventKind::AllTasksFinished
        } else {
            EventKind::TaskFinished
        });
    }

    {
        let mut state = shared.state.lock();
        state.done = true;
        state.worker_exited = true;
        shared.idle.notify_all();
        shared.exited.notify_all();
    }
    debug!(scheduler = name, "worker exited");
    shared.events.force_notify(EventKind::Terminated);
}

/// Blocks until a task is available; `None` once the worker should exit.
fn next_task(shared: &Shared) -> Option<Task> {
    let mut state = shared.state.lock();
    loop {
        if state.lifecycle.is_terminated() {
            let discard = state.forced || shared.config.shutdown == ShutdownPolicy::Discard;
            if discard || state.queue.is_empty() {
                let dropped = state.queue.len();
                state.queue.clear();
                if dropped > 0 {
                    debug!(
                        scheduler = %shared.config.name,
                        dropped,
                        "discarding queued tasks on termination"
                    );
                }
                return None;
            }
        }

        if let Some(task) = state.queue.pop_front() {
            state.done = false;
            return Some(task);
        }

        shared.work_ready.wait(&mut state);
    }
}

#[cfg(test)]
mod tests {
    #![expect(clippy::panic, reason = "Panicking tasks exercise failure containment")]

    use super::*;
    use crate::scheduler::{SchedulerEvent, sleep_interruptibly};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn started(name: &str) -> ThreadScheduler {
        ThreadScheduler::spawn(SchedulerConfig::named(name)).unwrap()
    }

    #[test]
    fn tasks_run_in_fifo_order_without_overlap() {
        let scheduler = started("fifo");
        let log = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicUsize::new(0));

        for i in 0..20 {
            let log = Arc::clone(&log);
            let running = Arc::clone(&running);
            scheduler
                .schedule(move || {
                    assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                    thread::sleep(Duration::from_millis(1));
                    log.lock().push(i);
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        scheduler.wait_until_done();
        assert_eq!(*log.lock(), (0..20).collect::<Vec<_>>());
        assert_eq!(scheduler.queue_size(), 0);
        assert!(scheduler.is_done());
        scheduler.terminate().unwrap();
    }

    #[test]
    fn scheduling_requires_started_and_not_terminated() {
        let scheduler = ThreadScheduler::new(SchedulerConfig::named("gate"));
        assert!(matches!(
            scheduler.schedule(|| {}),
            Err(SchedulerError::NotStarted)
        ));

        scheduler.start().unwrap();
        scheduler.start().unwrap();
        assert!(scheduler.is_active());

        scheduler.terminate().unwrap();
        assert!(scheduler.is_terminated());
        assert!(!scheduler.is_active());
        assert!(matches!(
            scheduler.schedule(|| {}),
            Err(SchedulerError::Terminated)
        ));
        assert!(matches!(scheduler.start(), Err(SchedulerError::Terminated)));
        assert!(matches!(
            scheduler.terminate(),
            Err(SchedulerError::AlreadyTerminated)
        ));
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let scheduler = started("panics");
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);

        scheduler.schedule(|| panic!("task failure")).unwrap();
        scheduler
            .schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        scheduler.wait_until_done();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        scheduler.terminate().unwrap();
    }

    #[test]
    fn events_follow_lifecycle_order() {
        let scheduler = ThreadScheduler::new(SchedulerConfig::named("events"));
        let (_, events) = scheduler.events().subscribe_channel();

        scheduler.start().unwrap();
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock();
        let blocker = Arc::clone(&gate);
        scheduler
            .schedule(move || {
                drop(blocker.lock());
            })
            .unwrap();
        scheduler.schedule(|| {}).unwrap();
        drop(held);
        scheduler.wait_until_done();
        scheduler.terminate().unwrap();

        let kinds: Vec<_> = events.try_iter().filter_map(|e: SchedulerEvent| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Started,
                EventKind::TaskStarted,
                EventKind::TaskFinished,
                EventKind::TaskStarted,
                EventKind::AllTasksFinished,
                EventKind::Terminated,
            ]
        );
    }

    #[test]
    fn terminate_discards_queue_by_default() {
        let scheduler = started("discard");
        let ran = Arc::new(AtomicUsize::new(0));
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);

        scheduler
            .schedule(move || {
                entered_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
            })
            .unwrap();
        for _ in 0..5 {
            let ran = Arc::clone(&ran);
            scheduler
                .schedule(move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        entered_rx.recv().unwrap();
        scheduler.terminate().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.queue_size(), 0);
    }

    #[test]
    fn drain_policy_runs_accepted_tasks() {
        let config = SchedulerConfig::named("drain").with_shutdown(ShutdownPolicy::Drain);
        let scheduler = ThreadScheduler::spawn(config).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let ran = Arc::clone(&ran);
            scheduler
                .schedule(move || {
                    thread::sleep(Duration::from_millis(2));
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        scheduler.terminate().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn bounded_terminate_reports_timeout() {
        let scheduler = started("slow");
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        scheduler
            .schedule(move || {
                entered_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(300));
            })
            .unwrap();
        entered_rx.recv().unwrap();

        let outcome = scheduler
            .terminate_timeout(Duration::from_millis(20))
            .unwrap();
        assert_eq!(outcome, Termination::TimedOut);
        assert!(scheduler.is_terminated());
    }

    #[test]
    fn force_terminate_interrupts_cooperative_task() {
        let scheduler = started("force");
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);

        scheduler
            .schedule(move || {
                entered_tx.send(()).unwrap();
                let completed = sleep_interruptibly(Duration::from_secs(30));
                result_tx.send(completed).unwrap();
            })
            .unwrap();

        entered_rx.recv().unwrap();
        let started_at = Instant::now();
        scheduler.force_terminate().unwrap();

        assert!(started_at.elapsed() < Duration::from_secs(10));
        assert!(!result_rx.recv().unwrap());
    }

    #[test]
    fn terminate_before_start_is_allowed_once() {
        let scheduler = ThreadScheduler::new(SchedulerConfig::named("idle"));
        let (_, events) = scheduler.events().subscribe_channel();
        scheduler.terminate().unwrap();

        assert!(scheduler.is_terminated());
        assert!(!scheduler.is_started());
        assert!(events.try_recv().unwrap().is(EventKind::Terminated));
        assert!(matches!(
            scheduler.terminate_timeout(Duration::from_millis(1)),
            Err(SchedulerError::AlreadyTerminated)
        ));
    }
}
