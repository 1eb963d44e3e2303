//! A fixed pool of child schedulers behind one [`Scheduler`] facade.
//!
//! New tasks go to the first idle child in array order; when every child is
//! busy they wait in an overflow queue that is drained whenever a child
//! reports `AllTasksFinished`.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use super::events::{EventBus, EventKind, ObserverId, SchedulerEvent};
use super::{Lifecycle, Scheduler, Task, Termination};
use crate::error::{SchedulerError, SchedulerResult};

pub struct SchedulerSet<S: Scheduler + 'static> {
    shared: Arc<SetShared<S>>,
}

struct SetShared<S: Scheduler + 'static> {
    children: Vec<S>,
    state: Mutex<SetState>,
    idle: Condvar,
    events: EventBus,
    subscriptions: Mutex<Vec<ObserverId>>,
}

struct SetState {
    lifecycle: Lifecycle,
    overflow: VecDeque<Task>,
    /// Tasks picked for a child but not yet handed over.
    in_flight: usize,
    /// Children with a hand-off in progress; placement skips them.
    reserved: Vec<bool>,
    /// Whether `AllTasksFinished` was already re-emitted for the current idle period.
    idle_announced: bool,
    /// Set right before `Terminated` is emitted; nothing is forwarded afterwards.
    closed: bool,
}

#[derive(Clone, Copy)]
enum Shutdown {
    Orderly(Option<Instant>),
    Forced,
}

impl<S: Scheduler + 'static> SchedulerSet<S> {
    /// Builds a set over pre-built children, in the given order.
    pub fn from_schedulers(children: Vec<S>) -> SchedulerResult<Self> {
        if children.is_empty() {
            return Err(SchedulerError::InvalidArgument(
                "a scheduler set needs at least one child".to_string(),
            ));
        }

        let reserved = vec![false; children.len()];
        let shared = Arc::new(SetShared {
            children,
            state: Mutex::new(SetState {
                lifecycle: Lifecycle::default(),
                overflow: VecDeque::new(),
                in_flight: 0,
                reserved,
                idle_announced: true,
                closed: false,
            }),
            idle: Condvar::new(),
            events: EventBus::new(),
            subscriptions: Mutex::new(Vec::new()),
        });

        let subscriptions = shared
            .children
            .iter()
            .enumerate()
            .map(|(index, child)| {
                let weak: Weak<SetShared<S>> = Arc::downgrade(&shared);
                child.events().subscribe(move |event: &SchedulerEvent| {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_child_event(index, event);
                    }
                })
            })
            .collect();
        *shared.subscriptions.lock() = subscriptions;

        Ok(Self { shared })
    }

    /// Builds `amount` children with `factory`.
    pub fn with_factory<F>(amount: usize, mut factory: F) -> SchedulerResult<Self>
    where
        F: FnMut() -> S,
    {
        Self::try_with_factory(amount, || Ok::<S, std::convert::Infallible>(factory()))
    }

    /// Builds `amount` children with a fallible factory; the first failure
    /// aborts construction before any child is started.
    pub fn try_with_factory<F, E>(amount: usize, mut factory: F) -> SchedulerResult<Self>
    where
        F: FnMut() -> Result<S, E>,
        E: fmt::Display,
    {
        if amount == 0 {
            return Err(SchedulerError::InvalidArgument(
                "a scheduler set needs at least one child".to_string(),
            ));
        }

        let mut children = Vec::with_capacity(amount);
        for index in 0..amount {
            match factory() {
                Ok(child) => children.push(child),
                Err(err) => {
                    error!(index, %err, "failed to create child scheduler");
                    return Err(SchedulerError::InvalidArgument(format!(
                        "child scheduler {index} could not be created: {err}"
                    )));
                }
            }
        }
        Self::from_schedulers(children)
    }

    pub fn children(&self) -> &[S] {
        &self.shared.children
    }

    pub fn overflow_len(&self) -> usize {
        self.shared.state.lock().overflow.len()
    }

    fn shutdown(&self, mode: Shutdown) -> SchedulerResult<Termination> {
        {
            let mut state = self.shared.state.lock();
            state.lifecycle.end()?;
            let dropped = state.overflow.len();
            state.overflow.clear();
            info!(children = self.shared.children.len(), dropped, "terminating scheduler set");
        }

        let mut outcome = Termination::Completed;
        for (index, child) in self.shared.children.iter().enumerate() {
            let result = match mode {
                Shutdown::Forced => child.force_terminate().map(|()| Termination::Completed),
                Shutdown::Orderly(None) => child.terminate().map(|()| Termination::Completed),
                Shutdown::Orderly(Some(deadline)) => {
                    child.terminate_timeout(deadline.saturating_duration_since(Instant::now()))
                }
            };

            match result {
                Ok(Termination::Completed) => {}
                Ok(Termination::TimedOut) => outcome = Termination::TimedOut,
                Err(SchedulerError::AlreadyTerminated) => {}
                Err(err) => warn!(index, %err, "child scheduler failed to terminate"),
            }
        }

        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            self.shared.idle.notify_all();
        }
        self.shared.events.force_notify(EventKind::Terminated);
        Ok(outcome)
    }
}

impl<S: Scheduler + 'static> SetShared<S> {
    fn is_idle(&self, state: &SetState) -> bool {
        state.overflow.is_empty()
            && state.in_flight == 0
            && self.children.iter().all(Scheduler::is_done)
    }

    /// Claims the right to re-emit `AllTasksFinished` for this idle period.
    fn take_idle_announcement(&self, state: &mut MutexGuard<'_, SetState>) -> bool {
        if state.closed || state.idle_announced || !self.is_idle(&**state) {
            return false;
        }
        state.idle_announced = true;
        true
    }

    /// First child that is idle and not already promised a task.
    fn free_child(&self, state: &SetState) -> Option<usize> {
        self.children
            .iter()
            .enumerate()
            .position(|(index, child)| !state.reserved[index] && child.is_done())
    }

    /// Pops the overflow head for `index` and reserves the child for it.
    fn claim_overflow(&self, state: &mut SetState, index: usize) -> Option<Task> {
        if state.lifecycle.is_terminated()
            || state.reserved[index]
            || !self.children[index].is_done()
        {
            return None;
        }
        let task = state.overflow.pop_front()?;
        state.reserved[index] = true;
        Some(task)
    }

    fn on_child_event(&self, index: usize, event: &SchedulerEvent) {
        let mut dispatch = None;
        let forward = {
            let mut state = self.state.lock();
            match event.kind() {
                Some(EventKind::Started | EventKind::Terminated) => return,
                Some(EventKind::AllTasksFinished) => {
                    // A reserved child is mid hand-off; its dispatcher drains
                    // the overflow once the hand-off completes.
                    if let Some(task) = self.claim_overflow(&mut state, index) {
                        state.in_flight += 1;
                        dispatch = Some(task);
                    }
                    let announce = dispatch.is_none() && self.take_idle_announcement(&mut state);
                    if self.is_idle(&state) {
                        self.idle.notify_all();
                    }
                    announce
                }
                _ => !state.closed,
            }
        };

        if let Some(task) = dispatch {
            self.dispatch(index, task);
        }
        if forward {
            self.events.force_notify(event.clone());
        }
    }

    /// Hands `task` to a child reserved by the caller, then keeps feeding it
    /// overflow tasks for as long as it is idle again right after a hand-off.
    fn dispatch(&self, index: usize, mut task: Task) {
        let announce = loop {
            if let Err(err) = self.children[index].schedule_task(task) {
                error!(index, %err, "child scheduler rejected task; task dropped");
            }

            let mut state = self.state.lock();
            state.reserved[index] = false;
            if let Some(next) = self.claim_overflow(&mut state, index) {
                task = next;
                continue;
            }
            state.in_flight -= 1;
            let announce = self.take_idle_announcement(&mut state);
            if self.is_idle(&state) {
                self.idle.notify_all();
            }
            break announce;
        };
        if announce {
            self.events.force_notify(EventKind::AllTasksFinished);
        }
    }
}

impl<S: Scheduler + 'static> Drop for SetShared<S> {
    fn drop(&mut self) {
        let subscriptions = std::mem::take(self.subscriptions.get_mut());
        for (child, id) in self.children.iter().zip(subscriptions) {
            child.events().unsubscribe(id);
        }
    }
}

impl<S: Scheduler + 'static> Scheduler for SchedulerSet<S> {
    fn schedule_task(&self, task: Task) -> SchedulerResult<()> {
        let target = {
            let mut state = self.shared.state.lock();
            state.lifecycle.ensure_accepting()?;
            state.idle_announced = false;
            match self.shared.free_child(&state) {
                Some(index) => {
                    state.reserved[index] = true;
                    state.in_flight += 1;
                    Some((index, task))
                }
                None => {
                    state.overflow.push_back(task);
                    None
                }
            }
        };

        if let Some((index, task)) = target {
            self.shared.dispatch(index, task);
        }
        Ok(())
    }

    fn queue_size(&self) -> usize {
        let state = self.shared.state.lock();
        state.overflow.len()
            + self
                .shared
                .children
                .iter()
                .map(Scheduler::queue_size)
                .sum::<usize>()
    }

    fn start(&self) -> SchedulerResult<()> {
        if !self.shared.state.lock().lifecycle.begin()? {
            return Ok(());
        }
        for child in &self.shared.children {
            child.start()?;
        }
        info!(children = self.shared.children.len(), "scheduler set started");
        self.shared.events.force_notify(EventKind::Started);
        Ok(())
    }

    fn terminate(&self) -> SchedulerResult<()> {
        self.shutdown(Shutdown::Orderly(None)).map(drop)
    }

    /// The timeout bounds the whole set: each child gets whatever budget the
    /// previous children left over.
    fn terminate_timeout(&self, timeout: Duration) -> SchedulerResult<Termination> {
        self.shutdown(Shutdown::Orderly(Some(Instant::now() + timeout)))
    }

    fn force_terminate(&self) -> SchedulerResult<()> {
        self.shutdown(Shutdown::Forced).map(drop)
    }

    fn is_started(&self) -> bool {
        self.shared.state.lock().lifecycle.is_started()
    }

    fn is_terminated(&self) -> bool {
        self.shared.state.lock().lifecycle.is_terminated()
    }

    fn is_done(&self) -> bool {
        let state = self.shared.state.lock();
        self.shared.is_idle(&state)
    }

    fn wait_until_done(&self) {
        let mut state = self.shared.state.lock();
        while !state.closed && !self.shared.is_idle(&state) {
            self.shared.idle.wait(&mut state);
        }
    }

    fn events(&self) -> &EventBus {
        &self.shared.events
    }
}

impl<S: Scheduler + 'static> fmt::Debug for SchedulerSet<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("SchedulerSet")
            .field("children", &self.shared.children.len())
            .field("lifecycle", &state.lifecycle)
            .field("overflow", &state.overflow.len())
            .finish()
    }
}
