//! Single-slot interruptible job scheduler.
//!
//! Runs one job at a time in a forked, killable worker process. Scheduling a
//! new job supersedes the running one: its process group is signalled and its
//! result, should it still arrive, is discarded. See [`Scheduler`].

pub mod config;
pub mod error;
pub mod gate;
pub mod scheduler;
pub mod shutdown;
pub mod sink;
pub mod worker;

pub use config::{SchedulerConfig, ShellConfig};
pub use error::{Result, SchedulerError};
pub use scheduler::{JobHandle, JobId, JobOutcome, JobReport, Scheduler};
pub use sink::SharedBuffer;
pub use worker::{ShellWork, WorkOutput};

pub use nix::sys::signal::Signal;
