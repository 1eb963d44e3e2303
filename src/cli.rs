use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::config::{IntervalMode, SchedulerConfig, ShutdownPolicy, TimerConfig};
use crate::logger;
use crate::scheduler::{
    EventKind, Scheduler, SchedulerEvent, SchedulerSet, SelfScheduler, ThreadScheduler,
    sleep_interruptibly,
};
use crate::timer::{ThreadTimer, TimerTask};

#[derive(Parser, Debug)]
#[command(name = "schedtools", version, about = "Scheduler and periodic timer playground")]
pub struct SchedCli {
    #[arg(short, long, global = true)]
    /// Log scheduler and timer diagnostics at debug level.
    verbose: bool,

    #[arg(long, global = true)]
    /// Print the timer summary as JSON instead of a table.
    json: bool,

    #[command(subcommand)]
    command: Command,
}

impl SchedCli {
    pub fn command(&self) -> &Command {
        &self.command
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    /// Run tasks inline on the timer thread.
    #[value(name = "self")]
    #[serde(rename = "self")]
    Inline,
    /// One dedicated worker thread.
    Thread,
    /// A pool of worker threads.
    Set,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a periodic timer for a while and report how it behaved.
    Timer {
        #[arg(long, value_enum, default_value = "self")]
        scheduler: SchedulerKind,
        /// Worker count when `--scheduler set`.
        #[arg(long, default_value_t = 2)]
        workers: usize,
        /// YAML or JSON timer configuration; flags below override it.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        interval_ms: Option<u64>,
        #[arg(long)]
        delay_ms: Option<u64>,
        #[arg(long)]
        mode: Option<IntervalMode>,
        /// Simulated work per task.
        #[arg(long, default_value_t = 5)]
        work_ms: u64,
        /// Tasks fired per tick.
        #[arg(long, default_value_t = 1)]
        tasks: usize,
        #[arg(long, default_value_t = 3)]
        duration_secs: u64,
    },
    /// Push a burst of tasks through a scheduler set and report placement.
    Burst {
        #[arg(long, default_value_t = 4)]
        workers: usize,
        #[arg(long, default_value_t = 32)]
        tasks: usize,
        #[arg(long, default_value_t = 10)]
        work_ms: u64,
        /// Run queued work before exiting instead of discarding it.
        #[arg(long)]
        drain: bool,
    },
}

pub fn run() -> Result<()> {
    let cli = SchedCli::parse();
    logger::init_logging(cli.verbose);

    match &cli.command {
        Command::Timer {
            scheduler,
            workers,
            config,
            interval_ms,
            delay_ms,
            mode,
            work_ms,
            tasks,
            duration_secs,
        } => {
            let mut timer_config = match config {
                Some(path) => TimerConfig::from_path(path)
                    .with_context(|| format!("failed to load timer config {}", path.display()))?,
                None => TimerConfig::default(),
            };
            if let Some(interval) = interval_ms {
                timer_config.interval_ms = *interval;
            }
            if let Some(delay) = delay_ms {
                timer_config.delay_ms = *delay;
            }
            if let Some(mode) = mode {
                timer_config.mode = *mode;
            }
            handle_timer(
                &timer_config,
                *scheduler,
                *workers,
                Duration::from_millis(*work_ms),
                *tasks,
                Duration::from_secs(*duration_secs),
                cli.json,
            )
        }
        Command::Burst {
            workers,
            tasks,
            work_ms,
            drain,
        } => handle_burst(*workers, *tasks, Duration::from_millis(*work_ms), *drain),
    }
}

fn build_scheduler(kind: SchedulerKind, workers: usize) -> Result<Arc<dyn Scheduler>> {
    let scheduler: Arc<dyn Scheduler> = match kind {
        SchedulerKind::Inline => Arc::new(SelfScheduler::started()),
        SchedulerKind::Thread => Arc::new(
            ThreadScheduler::spawn(SchedulerConfig::named("schedtools-timer-worker"))
                .context("failed to start worker thread")?,
        ),
        SchedulerKind::Set => {
            let mut next = 0_usize;
            let set = SchedulerSet::try_with_factory(workers, || {
                next += 1;
                Ok::<_, std::io::Error>(ThreadScheduler::new(SchedulerConfig::named(format!(
                    "schedtools-set-{next}"
                ))))
            })
            .context("failed to build scheduler set")?;
            set.start().context("failed to start scheduler set")?;
            Arc::new(set)
        }
    };
    Ok(scheduler)
}

#[expect(clippy::print_stdout, reason = "the summary is the command's output")]
fn handle_timer(
    config: &TimerConfig,
    kind: SchedulerKind,
    workers: usize,
    work: Duration,
    tasks: usize,
    duration: Duration,
    json: bool,
) -> Result<()> {
    let scheduler = build_scheduler(kind, workers)?;
    let executed = Arc::new(AtomicUsize::new(0));
    let task_set: Vec<TimerTask> = (0..tasks)
        .map(|_| {
            let executed = Arc::clone(&executed);
            Arc::new(move || {
                sleep_interruptibly(work);
                executed.fetch_add(1, Ordering::Relaxed);
            }) as TimerTask
        })
        .collect();

    let timer = ThreadTimer::from_config(config, Some(Arc::clone(&scheduler)), task_set)
        .context("invalid timer configuration")?;
    info!(?kind, interval_ms = config.interval_ms, "running timer");
    timer.start().context("failed to start timer")?;
    thread::sleep(duration);
    timer.cancel();
    scheduler
        .terminate()
        .context("failed to terminate scheduler")?;

    let metrics = timer.metrics();
    let summary = TimerSummary {
        scheduler: kind,
        mode: timer.mode(),
        ticks: metrics.total_fires,
        tasks_executed: executed.load(Ordering::Relaxed),
        average_batch_ms: metrics.average_execution.as_secs_f64() * 1000.0,
        measured_rate: metrics.measured_rate,
        configured_interval_ms: config.interval_ms,
        final_interval_ms: u64::try_from(timer.interval().as_millis()).unwrap_or(u64::MAX),
        wait_multiplier: timer.wait_multiplier(),
    };

    if json {
        let rendered =
            serde_json::to_string_pretty(&summary).context("failed to serialize timer summary")?;
        println!("{rendered}");
    } else {
        print_timer_summary(&summary);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct TimerSummary {
    scheduler: SchedulerKind,
    mode: IntervalMode,
    ticks: u64,
    tasks_executed: usize,
    average_batch_ms: f64,
    measured_rate: f64,
    configured_interval_ms: u64,
    final_interval_ms: u64,
    wait_multiplier: u32,
}

#[expect(clippy::print_stdout, reason = "the summary is the command's output")]
fn print_timer_summary(summary: &TimerSummary) {
    println!("{}", "timer summary".bold());
    println!("  {:<20} {:?}", "scheduler", summary.scheduler);
    println!("  {:<20} {:?}", "mode", summary.mode);
    println!("  {:<20} {}", "ticks", summary.ticks.to_string().green());
    println!("  {:<20} {}", "tasks executed", summary.tasks_executed);
    println!("  {:<20} {:.2}ms", "avg batch time", summary.average_batch_ms);
    println!("  {:<20} {:.2}/s", "measured rate", summary.measured_rate);

    let interval_label = format!("{}ms", summary.final_interval_ms);
    let interval_label = if summary.final_interval_ms > summary.configured_interval_ms {
        interval_label.yellow()
    } else {
        interval_label.green()
    };
    println!("  {:<20} {}", "final interval", interval_label);
    println!("  {:<20} {}", "wait multiplier", summary.wait_multiplier);
}

#[expect(clippy::print_stdout, reason = "the summary is the command's output")]
fn handle_burst(workers: usize, tasks: usize, work: Duration, drain: bool) -> Result<()> {
    let shutdown = if drain {
        ShutdownPolicy::Drain
    } else {
        ShutdownPolicy::Discard
    };
    let mut next = 0_usize;
    let set = SchedulerSet::with_factory(workers, || {
        next += 1;
        ThreadScheduler::new(
            SchedulerConfig::named(format!("schedtools-burst-{next}")).with_shutdown(shutdown),
        )
    })
    .context("failed to build scheduler set")?;

    let idle_events = Arc::new(AtomicUsize::new(0));
    {
        let idle_events = Arc::clone(&idle_events);
        set.events().subscribe(move |event: &SchedulerEvent| {
            if event.is(EventKind::AllTasksFinished) {
                idle_events.fetch_add(1, Ordering::Relaxed);
            }
        });
    }
    set.start().context("failed to start scheduler set")?;

    let placements = Arc::new(Mutex::new(vec![0_usize; workers]));
    let started = Instant::now();
    for _ in 0..tasks {
        let placements = Arc::clone(&placements);
        set.schedule(move || {
            if let Some(index) = worker_index(thread::current().name()) {
                if let Some(slot) = placements.lock().get_mut(index) {
                    *slot += 1;
                }
            }
            sleep_interruptibly(work);
        })
        .context("failed to schedule burst task")?;
    }
    let peak_overflow = set.overflow_len();
    set.wait_until_done();
    let elapsed = started.elapsed();
    set.terminate().context("failed to terminate scheduler set")?;

    println!("{}", "burst summary".bold());
    println!("  {:<20} {}", "tasks", tasks);
    println!("  {:<20} {:.2?}", "elapsed", elapsed);
    println!("  {:<20} {}", "overflow after submit", peak_overflow);
    println!(
        "  {:<20} {}",
        "idle announcements",
        idle_events.load(Ordering::Relaxed)
    );
    for (index, count) in placements.lock().iter().enumerate() {
        let bar = "#".repeat(*count);
        println!("  worker {:<13} {:>4} {}", index + 1, count, bar.cyan());
    }
    Ok(())
}

/// Maps a `schedtools-burst-N` thread name back to its zero-based slot.
fn worker_index(name: Option<&str>) -> Option<usize> {
    name?
        .strip_prefix("schedtools-burst-")?
        .parse::<usize>()
        .ok()?
        .checked_sub(1)
}
