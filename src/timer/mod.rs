//! Periodic firing of a fixed task set on top of any [`Scheduler`](crate::scheduler::Scheduler).

mod control;
mod metrics;
mod thread_timer;

pub use control::{Adjustment, IntervalController};
pub use metrics::{AVERAGE_WINDOW, TimerMetrics};
pub use thread_timer::{ThreadTimer, TimerState, TimerTask};
