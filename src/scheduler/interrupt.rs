//! Best-effort interruption of tasks running on scheduler worker threads.
//!
//! Threads cannot be interrupted from the outside, so `force_terminate` raises
//! the worker's token and unparks it. Tasks that want to be stoppable poll
//! [`interrupted`] or block through [`sleep_interruptibly`].

use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

thread_local! {
    static CURRENT: RefCell<Option<InterruptToken>> = const { RefCell::new(None) };
}

/// Interrupt flag shared between a scheduler and its worker thread.
#[derive(Debug, Clone, Default)]
pub struct InterruptToken {
    flag: Arc<AtomicBool>,
    thread: Arc<Mutex<Option<Thread>>>,
}

impl InterruptToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
        if let Some(thread) = self.thread.lock().as_ref() {
            thread.unpark();
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Installs this token as the calling thread's interrupt source until the
    /// returned guard is dropped.
    pub(crate) fn bind_current(&self) -> BoundToken {
        *self.thread.lock() = Some(thread::current());
        CURRENT.with(|current| *current.borrow_mut() = Some(self.clone()));
        BoundToken {
            thread: Arc::clone(&self.thread),
        }
    }
}

pub(crate) struct BoundToken {
    thread: Arc<Mutex<Option<Thread>>>,
}

impl Drop for BoundToken {
    fn drop(&mut self) {
        self.thread.lock().take();
        CURRENT.with(|current| current.borrow_mut().take());
    }
}

/// Whether the scheduler running the current task has been force-terminated.
///
/// Always `false` outside a scheduler worker thread.
pub fn interrupted() -> bool {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_some_and(InterruptToken::is_interrupted)
    })
}

/// Sleeps for `duration` unless the current worker is interrupted first.
///
/// Returns `true` if the full duration elapsed.
pub fn sleep_interruptibly(duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if interrupted() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::park_timeout(deadline - now);
    }
}
