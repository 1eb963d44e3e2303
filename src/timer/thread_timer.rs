use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use schedtools_config::{AdaptiveConfig, IntervalMode, TimerConfig};
use tracing::{debug, info, warn};

use super::control::IntervalController;
use super::metrics::{MetricsRecorder, TimerMetrics};
use crate::error::TimerError;
use crate::scheduler::{Scheduler, SelfScheduler};

/// A task fired on every tick; shared because it runs once per period.
pub type TimerTask = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Running,
    Paused,
    Canceled,
}

/// What the pending wait of the current worker is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting `pending` from `anchor` before the first fire of this worker.
    Delay,
    /// Waiting one interval from the nominal start of the last batch.
    Period,
}

/// Fires a fixed task set on a scheduler, once per interval.
///
/// Each `start`/`resume` spawns a worker tagged with the current generation;
/// `pause`/`cancel` bump the generation so the old worker exits at its next
/// wake-up without firing again. Batches never overlap: the worker waits for
/// the scheduler to finish a batch before arming the next one.
pub struct ThreadTimer {
    shared: Arc<TimerShared>,
}

struct TimerShared {
    scheduler: Arc<dyn Scheduler>,
    tasks: Vec<TimerTask>,
    inner: Mutex<TimerInner>,
    /// Wakes the worker for new settings or a generation change.
    changed: Condvar,
}

struct TimerInner {
    state: TimerState,
    generation: u64,
    mode: IntervalMode,
    initial_delay: Duration,
    controller: IntervalController,
    phase: Phase,
    anchor: Instant,
    pending: Duration,
    pause_time: Option<Instant>,
    /// Set while some worker, of any generation, has a batch outstanding.
    batch_running: bool,
    metrics: MetricsRecorder,
}

impl ThreadTimer {
    /// A timer that runs its tasks inline on its own thread.
    pub fn new(delay: Duration, interval: Duration, tasks: Vec<TimerTask>) -> Result<Self, TimerError> {
        Self::with_scheduler(delay, interval, Arc::new(SelfScheduler::started()), tasks)
    }

    pub fn with_scheduler(
        delay: Duration,
        interval: Duration,
        scheduler: Arc<dyn Scheduler>,
        tasks: Vec<TimerTask>,
    ) -> Result<Self, TimerError> {
        if delay.is_zero() || interval.is_zero() {
            return Err(TimerError::InvalidArgument(format!(
                "delay ({delay:?}) and interval ({interval:?}) must be positive"
            )));
        }
        let config = TimerConfig {
            delay_ms: millis(delay),
            interval_ms: millis(interval),
            ..TimerConfig::default()
        };
        Self::build(&config, delay, interval, scheduler, tasks)
    }

    /// Builds a timer from configuration; `None` uses an inline scheduler.
    pub fn from_config(
        config: &TimerConfig,
        scheduler: Option<Arc<dyn Scheduler>>,
        tasks: Vec<TimerTask>,
    ) -> Result<Self, TimerError> {
        if config.delay_ms == 0 || config.interval_ms == 0 {
            return Err(TimerError::InvalidArgument(format!(
                "delay_ms ({}) and interval_ms ({}) must be positive",
                config.delay_ms, config.interval_ms
            )));
        }
        if config.target_interval_ms == Some(0) {
            return Err(TimerError::InvalidArgument(
                "target_interval_ms must be positive".to_string(),
            ));
        }
        let scheduler = scheduler.unwrap_or_else(|| Arc::new(SelfScheduler::started()));
        Self::build(config, config.delay(), config.interval(), scheduler, tasks)
    }

    fn build(
        config: &TimerConfig,
        delay: Duration,
        interval: Duration,
        scheduler: Arc<dyn Scheduler>,
        tasks: Vec<TimerTask>,
    ) -> Result<Self, TimerError> {
        let target = config.target_interval_ms.map_or(interval, Duration::from_millis);
        let controller = IntervalController::new(interval, target, config.adaptive.clone());

        Ok(Self {
            shared: Arc::new(TimerShared {
                scheduler,
                tasks,
                inner: Mutex::new(TimerInner {
                    state: TimerState::Canceled,
                    generation: 0,
                    mode: config.mode,
                    initial_delay: delay,
                    controller,
                    phase: Phase::Delay,
                    anchor: Instant::now(),
                    pending: delay,
                    pause_time: None,
                    batch_running: false,
                    metrics: MetricsRecorder::new(),
                }),
                changed: Condvar::new(),
            }),
        })
    }

    /// Starts a canceled timer; a no-op while running or paused.
    pub fn start(&self) -> Result<(), TimerError> {
        let generation = {
            let mut inner = self.shared.inner.lock();
            if inner.state != TimerState::Canceled {
                return Ok(());
            }
            inner.state = TimerState::Running;
            inner.generation += 1;
            inner.phase = Phase::Delay;
            inner.anchor = Instant::now();
            inner.pending = inner.initial_delay;
            inner.pause_time = None;
            inner.metrics.resync();
            inner.generation
        };
        info!(generation, "timer started");
        self.spawn_worker(generation)
    }

    /// Pauses a running timer, remembering how far into its wait it was.
    pub fn pause(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.state != TimerState::Running {
            return;
        }
        inner.state = TimerState::Paused;
        inner.generation += 1;
        inner.pause_time = Some(Instant::now());
        self.shared.changed.notify_all();
        debug!(generation = inner.generation, "timer paused");
    }

    /// Resumes a paused timer so the next fire keeps the time that was left
    /// before pausing (less any interval reduction made while paused).
    pub fn resume(&self) -> Result<(), TimerError> {
        let generation = {
            let mut inner = self.shared.inner.lock();
            if inner.state != TimerState::Paused {
                return Ok(());
            }
            let now = Instant::now();
            let pause_time = inner.pause_time.take().unwrap_or(now);
            let time_waited = pause_time.saturating_duration_since(inner.anchor);
            let period = match inner.phase {
                Phase::Delay => inner.pending,
                Phase::Period => inner.controller.interval(),
            };

            inner.pending = period.saturating_sub(time_waited);
            inner.anchor = now;
            inner.phase = Phase::Delay;
            inner.state = TimerState::Running;
            inner.metrics.resync();
            debug!(
                generation = inner.generation,
                remaining_ms = millis(inner.pending),
                "timer resumed"
            );
            inner.generation
        };
        self.spawn_worker(generation)
    }

    pub fn cancel(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.state == TimerState::Canceled {
            return;
        }
        inner.state = TimerState::Canceled;
        inner.generation += 1;
        inner.pause_time = None;
        self.shared.changed.notify_all();
        info!(generation = inner.generation, "timer canceled");
    }

    pub fn state(&self) -> TimerState {
        self.shared.inner.lock().state
    }

    pub fn generation(&self) -> u64 {
        self.shared.inner.lock().generation
    }

    pub fn delay(&self) -> Duration {
        self.shared.inner.lock().initial_delay
    }

    pub fn interval(&self) -> Duration {
        self.shared.inner.lock().controller.interval()
    }

    pub fn target_interval(&self) -> Duration {
        self.shared.inner.lock().controller.target()
    }

    pub fn mode(&self) -> IntervalMode {
        self.shared.inner.lock().mode
    }

    pub fn wait_multiplier(&self) -> u32 {
        self.shared.inner.lock().controller.wait_multiplier()
    }

    pub fn adaptive_config(&self) -> AdaptiveConfig {
        self.shared.inner.lock().controller.config().clone()
    }

    pub fn metrics(&self) -> TimerMetrics {
        self.shared.inner.lock().metrics.snapshot()
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.shared.scheduler
    }

    /// Sets both the current and the target interval.
    pub fn set_interval(&self, interval: Duration) -> Result<(), TimerError> {
        if interval.is_zero() {
            return Err(TimerError::InvalidArgument(
                "interval must be positive".to_string(),
            ));
        }
        let mut inner = self.shared.inner.lock();
        inner.controller.set_interval(interval);
        inner.controller.set_target(interval);
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Sets the steady-state interval `Auto` mode converges to.
    pub fn set_target_interval(&self, target: Duration) -> Result<(), TimerError> {
        if target.is_zero() {
            return Err(TimerError::InvalidArgument(
                "target interval must be positive".to_string(),
            ));
        }
        let mut inner = self.shared.inner.lock();
        inner.controller.set_target(target);
        if inner.mode == IntervalMode::Manual {
            inner.controller.set_interval(target);
        }
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Sets the target interval from a fire rate in ticks per second.
    pub fn set_rate(&self, per_second: f64) -> Result<(), TimerError> {
        if !per_second.is_finite() || per_second <= 0.0 {
            return Err(TimerError::InvalidArgument(format!(
                "rate must be a positive number, got {per_second}"
            )));
        }
        let millis = (1000.0 / per_second).round().max(1.0);
        self.set_target_interval(Duration::from_millis(millis as u64))
    }

    /// Switching back to `Manual` pins the interval to the target.
    pub fn set_mode(&self, mode: IntervalMode) {
        let mut inner = self.shared.inner.lock();
        inner.mode = mode;
        if mode == IntervalMode::Manual {
            let target = inner.controller.target();
            inner.controller.set_interval(target);
        }
        self.shared.changed.notify_all();
    }

    fn spawn_worker(&self, generation: u64) -> Result<(), TimerError> {
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("schedtools-timer-{generation}"))
            .spawn(move || shared.run(generation));

        match spawned {
            Ok(_) => Ok(()),
            Err(err) => {
                let mut inner = self.shared.inner.lock();
                if inner.generation == generation {
                    inner.state = TimerState::Canceled;
                    inner.generation += 1;
                }
                Err(TimerError::Spawn(err))
            }
        }
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for ThreadTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("ThreadTimer")
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .field("mode", &inner.mode)
            .field("interval", &inner.controller.interval())
            .field("tasks", &self.shared.tasks.len())
            .finish()
    }
}

impl TimerShared {
    fn run(&self, generation: u64) {
        let mut inner = self.inner.lock();

        // Initial (or resumed) delay.
        loop {
            if inner.generation != generation {
                return;
            }
            let deadline = inner.anchor + inner.pending;
            let now = Instant::now();
            if now >= deadline {
                inner.anchor = deadline;
                break;
            }
            self.changed.wait_until(&mut inner, deadline);
        }
        inner.phase = Phase::Period;

        loop {
            // A worker replaced by pause/resume or cancel/start may still be
            // waiting on its last batch; never fire on top of it.
            if inner.batch_running {
                while inner.batch_running {
                    if inner.generation != generation {
                        return;
                    }
                    self.changed.wait(&mut inner);
                }
                if inner.generation != generation {
                    return;
                }
                inner.anchor = Instant::now();
            }

            let batch_start = inner.anchor;
            inner.batch_running = true;
            let execution = MutexGuard::unlocked(&mut inner, || self.fire_batch(batch_start));
            inner.batch_running = false;
            self.changed.notify_all();
            if inner.generation != generation {
                return;
            }

            inner.metrics.record(execution);
            if inner.mode == IntervalMode::Auto {
                let adjustment = inner.controller.observe(execution);
                debug!(?adjustment, interval_ms = millis(inner.controller.interval()), "interval adjusted");
            }

            if execution >= inner.controller.interval() {
                // Overran: start the next batch now instead of catching up.
                inner.anchor = Instant::now();
                continue;
            }

            loop {
                if inner.generation != generation {
                    return;
                }
                let interval = inner.controller.interval();
                let deadline = inner.anchor + interval;
                let now = Instant::now();
                if now >= deadline {
                    // Far behind after a shortened interval: resync rather than burst.
                    inner.anchor = if now - deadline > interval { now } else { deadline };
                    break;
                }
                self.changed.wait_until(&mut inner, deadline);
            }
        }
    }

    /// Submits every task and waits for the scheduler to drain. Returns the
    /// time elapsed since the batch's nominal start.
    fn fire_batch(&self, batch_start: Instant) -> Duration {
        for task in &self.tasks {
            let task = Arc::clone(task);
            if let Err(err) = self.scheduler.schedule_task(Box::new(move || task())) {
                warn!(%err, "timer could not schedule task");
            }
        }
        self.scheduler.wait_until_done();
        batch_start.elapsed()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_task(counter: &Arc<AtomicUsize>) -> TimerTask {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn sleeping_task(millis: u64) -> TimerTask {
        Arc::new(move || thread::sleep(Duration::from_millis(millis)))
    }

    /// A slow task that records the peak number of copies running at once.
    fn overlap_tracking_task(active: &Arc<AtomicUsize>, peak: &Arc<AtomicUsize>) -> TimerTask {
        let active = Arc::clone(active);
        let peak = Arc::clone(peak);
        Arc::new(move || {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(300));
            active.fetch_sub(1, Ordering::SeqCst);
        })
    }

    fn overlap_tracking_timer() -> (ThreadTimer, Arc<AtomicUsize>) {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let timer = ThreadTimer::new(
            Duration::from_millis(1),
            Duration::from_millis(100),
            vec![overlap_tracking_task(&active, &peak)],
        )
        .unwrap();
        (timer, peak)
    }

    #[test]
    fn resume_during_a_batch_waits_for_it() {
        let (timer, peak) = overlap_tracking_timer();
        timer.start().unwrap();
        thread::sleep(Duration::from_millis(60));
        timer.pause();
        timer.resume().unwrap();
        thread::sleep(Duration::from_millis(700));
        timer.cancel();

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(timer.metrics().total_fires >= 1);
    }

    #[test]
    fn restart_during_a_batch_waits_for_it() {
        let (timer, peak) = overlap_tracking_timer();
        timer.start().unwrap();
        thread::sleep(Duration::from_millis(60));
        timer.cancel();
        timer.start().unwrap();
        thread::sleep(Duration::from_millis(700));
        timer.cancel();

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rejects_non_positive_timing() {
        assert!(matches!(
            ThreadTimer::new(Duration::ZERO, Duration::from_millis(10), Vec::new()),
            Err(TimerError::InvalidArgument(_))
        ));
        assert!(matches!(
            ThreadTimer::new(Duration::from_millis(10), Duration::ZERO, Vec::new()),
            Err(TimerError::InvalidArgument(_))
        ));
        let config = TimerConfig {
            target_interval_ms: Some(0),
            ..TimerConfig::default()
        };
        assert!(matches!(
            ThreadTimer::from_config(&config, None, Vec::new()),
            Err(TimerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn starts_canceled_and_fires_periodically() {
        let counter = Arc::new(AtomicUsize::new(0));
        let timer = ThreadTimer::new(
            Duration::from_millis(10),
            Duration::from_millis(10),
            vec![counting_task(&counter)],
        )
        .unwrap();
        assert_eq!(timer.state(), TimerState::Canceled);

        timer.start().unwrap();
        thread::sleep(Duration::from_millis(200));
        timer.cancel();

        let fired = counter.load(Ordering::SeqCst);
        assert!(fired >= 5, "fired only {fired} times");
        assert!(timer.metrics().total_fires >= 5);
    }

    #[test]
    fn no_op_transitions_leave_generation_alone() {
        let timer = ThreadTimer::new(
            Duration::from_secs(10),
            Duration::from_secs(10),
            Vec::new(),
        )
        .unwrap();

        timer.cancel();
        timer.pause();
        timer.resume().unwrap();
        assert_eq!(timer.state(), TimerState::Canceled);
        assert_eq!(timer.generation(), 0);

        timer.start().unwrap();
        let running = timer.generation();
        timer.start().unwrap();
        timer.resume().unwrap();
        assert_eq!(timer.state(), TimerState::Running);
        assert_eq!(timer.generation(), running);

        timer.pause();
        let paused = timer.generation();
        assert_eq!(paused, running + 1);
        timer.pause();
        timer.start().unwrap();
        assert_eq!(timer.state(), TimerState::Paused);
        assert_eq!(timer.generation(), paused);

        timer.cancel();
        let canceled = timer.generation();
        timer.cancel();
        assert_eq!(timer.generation(), canceled);
        assert_eq!(timer.state(), TimerState::Canceled);
    }

    #[test]
    fn paused_timer_stops_firing() {
        let counter = Arc::new(AtomicUsize::new(0));
        let timer = ThreadTimer::new(
            Duration::from_millis(5),
            Duration::from_millis(5),
            vec![counting_task(&counter)],
        )
        .unwrap();

        timer.start().unwrap();
        thread::sleep(Duration::from_millis(60));
        timer.pause();
        thread::sleep(Duration::from_millis(20));
        let at_pause = counter.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), at_pause);
    }

    #[test]
    fn manual_mode_never_adjusts_interval() {
        let timer = ThreadTimer::new(
            Duration::from_millis(1),
            Duration::from_millis(5),
            vec![sleeping_task(15)],
        )
        .unwrap();

        timer.start().unwrap();
        thread::sleep(Duration::from_millis(100));
        timer.cancel();
        assert_eq!(timer.interval(), Duration::from_millis(5));
        assert_eq!(timer.wait_multiplier(), 0);
    }

    #[test]
    fn auto_mode_backs_off_on_overrun() {
        let config = TimerConfig {
            delay_ms: 1,
            interval_ms: 10,
            mode: IntervalMode::Auto,
            ..TimerConfig::default()
        };
        let timer = ThreadTimer::from_config(
            &config,
            None,
            vec![sleeping_task(30)],
        )
        .unwrap();

        timer.start().unwrap();
        thread::sleep(Duration::from_millis(150));
        timer.cancel();

        assert!(timer.interval() > Duration::from_millis(10));
        assert!(timer.wait_multiplier() >= 10);
    }

    #[test]
    fn set_rate_translates_to_target_interval() {
        let timer = ThreadTimer::new(
            Duration::from_millis(10),
            Duration::from_millis(10),
            Vec::new(),
        )
        .unwrap();
        timer.set_rate(50.0).unwrap();
        assert_eq!(timer.target_interval(), Duration::from_millis(20));
        assert_eq!(timer.interval(), Duration::from_millis(20));
        assert!(timer.set_rate(0.0).is_err());
        assert!(timer.set_interval(Duration::ZERO).is_err());
    }
}
