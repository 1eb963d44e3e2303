//! Per-scheduler event bus.
//!
//! Observers are kept in a copy-on-write list: notification clones the current
//! snapshot and iterates it without holding any lock, so observers may freely
//! subscribe, unsubscribe or call back into the emitting scheduler.

use crossbeam_channel::{Receiver, unbounded};
use parking_lot::RwLock;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Started,
    Terminated,
    TaskStarted,
    TaskFinished,
    /// A task finished and the queue was empty at that moment.
    AllTasksFinished,
}

#[derive(Clone)]
pub enum SchedulerEvent {
    Lifecycle(EventKind),
    Other(Arc<dyn Any + Send + Sync>),
}

impl SchedulerEvent {
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            SchedulerEvent::Lifecycle(kind) => Some(*kind),
            SchedulerEvent::Other(_) => None,
        }
    }

    pub fn other<T: Any + Send + Sync>(payload: T) -> Self {
        SchedulerEvent::Other(Arc::new(payload))
    }

    pub fn payload<T: Any>(&self) -> Option<&T> {
        match self {
            SchedulerEvent::Other(payload) => payload.downcast_ref(),
            SchedulerEvent::Lifecycle(_) => None,
        }
    }

    pub fn is(&self, kind: EventKind) -> bool {
        self.kind() == Some(kind)
    }
}

impl From<EventKind> for SchedulerEvent {
    fn from(kind: EventKind) -> Self {
        SchedulerEvent::Lifecycle(kind)
    }
}

impl fmt::Debug for SchedulerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerEvent::Lifecycle(kind) => f.debug_tuple("Lifecycle").field(kind).finish(),
            SchedulerEvent::Other(_) => f.debug_tuple("Other").field(&"..").finish(),
        }
    }
}

pub trait Observer: Send + Sync {
    fn update(&self, event: &SchedulerEvent);
}

impl<F> Observer for F
where
    F: Fn(&SchedulerEvent) + Send + Sync,
{
    fn update(&self, event: &SchedulerEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type ObserverList = Vec<(ObserverId, Arc<dyn Observer>)>;

pub struct EventBus {
    observers: RwLock<Arc<ObserverList>>,
    changed: AtomicBool,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observer_count())
            .field("changed", &self.has_changed())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Arc::new(Vec::new())),
            changed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<O>(&self, observer: O) -> ObserverId
    where
        O: Observer + 'static,
    {
        self.subscribe_arc(Arc::new(observer))
    }

    pub fn subscribe_arc(&self, observer: Arc<dyn Observer>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut observers = self.observers.write();
        let mut next = Vec::with_capacity(observers.len() + 1);
        next.extend(observers.iter().cloned());
        next.push((id, observer));
        *observers = Arc::new(next);
        id
    }

    /// Forwards every event into a channel; handy for tests and monitors.
    pub fn subscribe_channel(&self) -> (ObserverId, Receiver<SchedulerEvent>) {
        let (sender, receiver) = unbounded();
        let id = self.subscribe(move |event: &SchedulerEvent| {
            let _ = sender.send(event.clone());
        });
        (id, receiver)
    }

    /// Returns `false` if the id was not registered.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        if !observers.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        let next: ObserverList = observers
            .iter()
            .filter(|(existing, _)| *existing != id)
            .cloned()
            .collect();
        *observers = Arc::new(next);
        true
    }

    pub fn clear(&self) {
        *self.observers.write() = Arc::new(Vec::new());
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    pub fn set_changed(&self) {
        self.changed.store(true, Ordering::Release);
    }

    pub fn clear_changed(&self) {
        self.changed.store(false, Ordering::Release);
    }

    pub fn has_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    /// Delivers `event` only if the bus was marked changed, clearing the mark.
    ///
    /// Several `set_changed` calls followed by one `notify` reach observers once.
    pub fn notify(&self, event: impl Into<SchedulerEvent>) -> bool {
        if !self.changed.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.deliver(&event.into());
        true
    }

    /// Delivers `event` unconditionally.
    pub fn force_notify(&self, event: impl Into<SchedulerEvent>) {
        self.changed.store(false, Ordering::Release);
        self.deliver(&event.into());
    }

    fn deliver(&self, event: &SchedulerEvent) {
        let snapshot = Arc::clone(&*self.observers.read());
        for (_, observer) in snapshot.iter() {
            observer.update(event);
        }
    }
}
