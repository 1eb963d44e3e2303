use thiserror::Error;

/// Lifecycle misuse and construction failures reported by schedulers.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler has not been started")]
    NotStarted,
    #[error("scheduler has been terminated and accepts no further work")]
    Terminated,
    #[error("scheduler was already terminated")]
    AlreadyTerminated,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to spawn worker thread `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("failed to spawn timer thread: {0}")]
    Spawn(#[source] std::io::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
