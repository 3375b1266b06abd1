use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler lock poisoned")]
    LockPoisoned,

    #[error("Failed to spawn worker process: {0}")]
    Spawn(nix::Error),

    #[error("Failed to create worker pipe: {0}")]
    Pipe(nix::Error),

    #[error("Failed to signal worker process group: {0}")]
    Signal(nix::Error),

    #[error("No tokio runtime available to run completion monitors")]
    NoRuntime,

    #[error("Invalid stop signal: {0}")]
    InvalidSignal(String),
}

impl<T> From<std::sync::PoisonError<T>> for SchedulerError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        SchedulerError::LockPoisoned
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
