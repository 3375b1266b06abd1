//! Single-slot interruptible job scheduler.
//!
//! Exactly one job runs at a time, each in its own forked worker process. A new
//! [`Scheduler::schedule`] call supersedes the running job: its result is
//! suppressed and its process group receives the job's stop signal. Whatever
//! the timing, a superseded job's bytes never reach a sink, and no two jobs'
//! bytes ever interleave.
//!
//! # Locking
//!
//! One mutex guards the [`Slot`](slot::Slot) and every sink write. The
//! scheduler sets a job's suppression flag under it; the job's monitor checks
//! the flag and writes the result under it. `schedule` holds the lock while
//! forking but never waits on a worker.

pub mod job;
pub(crate) mod slot;

pub use job::{JobHandle, JobId, JobOutcome, JobReport};

use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::gate;
use crate::scheduler::slot::{Slot, TrackedJob};
use crate::worker::monitor::CompletionMonitor;
use crate::worker::{process, signal_group, ShellWork, WorkOutput};

pub struct Scheduler {
    config: SchedulerConfig,
    slot: Arc<Mutex<Slot>>,
    runtime: Handle,
}

impl Scheduler {
    /// Create a scheduler bound to the current tokio runtime.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;
        Ok(Self::with_handle(config, runtime))
    }

    /// Create a scheduler that runs monitors and reapers on `runtime`.
    pub fn with_handle(config: SchedulerConfig, runtime: Handle) -> Self {
        Self {
            config,
            slot: Arc::new(Mutex::new(Slot::default())),
            runtime,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run `work` in a new worker process, superseding the running job.
    ///
    /// Returns as soon as the worker is launched. The result is written to
    /// `sink` later, only if no other job supersedes this one first.
    ///
    /// `work` runs in a forked copy of this process and shares no memory with
    /// it. It must not rely on threads, locks or descriptors of the caller.
    pub fn schedule<W, F, O>(&self, sink: W, stop_signal: Signal, work: F) -> Result<JobHandle>
    where
        W: Write + Send + 'static,
        F: FnOnce() -> O,
        O: WorkOutput,
    {
        let mut slot = self.slot.lock()?;

        if let Some(previous) = slot.current.as_mut() {
            if previous.supersede() {
                self.escalate(previous.pid);
            }
        }

        let (completion_signal, completion) = gate::completion_flag()?;
        let (suppressor, suppression) = gate::suppression_flag();

        let worker = process::spawn_worker(work, completion_signal)?;
        let pid = worker.pid;
        process::detach(&self.runtime, pid);

        let id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(job_id = %id, pid = pid.as_raw(), signal = %stop_signal, "Job scheduled");

        let monitor = CompletionMonitor::new(id, worker, suppression, sink, self.slot.clone());
        let monitor = self.runtime.spawn_blocking(move || monitor.run());

        slot.current = Some(TrackedJob {
            id,
            pid,
            stop_signal,
            completion,
            suppressor,
        });

        Ok(JobHandle::new(id, pid, started_at, monitor))
    }

    /// [`schedule`](Self::schedule) with the configured default stop signal.
    pub fn schedule_default<W, F, O>(&self, sink: W, work: F) -> Result<JobHandle>
    where
        W: Write + Send + 'static,
        F: FnOnce() -> O,
        O: WorkOutput,
    {
        self.schedule(sink, self.config.default_stop_signal, work)
    }

    /// Schedule a shell command through the configured shell; its stdout is
    /// the result.
    pub fn schedule_shell<W>(&self, sink: W, command: impl Into<String>) -> Result<JobHandle>
    where
        W: Write + Send + 'static,
    {
        let work = ShellWork::with_shell(command, self.config.shell.clone());
        self.schedule(sink, self.config.default_stop_signal, move || work.run())
    }

    /// Supersede the running job without scheduling a replacement.
    ///
    /// Returns false if no job is tracked or it already finished.
    pub fn cancel(&self) -> Result<bool> {
        let mut slot = self.slot.lock()?;
        let cancelled = match slot.current.as_mut() {
            Some(job) => job.supersede(),
            None => false,
        };
        if cancelled {
            if let Some(job) = slot.current.as_ref() {
                self.escalate(job.pid);
            }
        }
        Ok(cancelled)
    }

    /// Whether the tracked job is still running. Never blocks on the worker.
    pub fn is_busy(&self) -> Result<bool> {
        let mut slot = self.slot.lock()?;
        Ok(slot
            .current
            .as_mut()
            .map(|job| job.is_running())
            .unwrap_or(false))
    }

    /// Id of the tracked job, finished or not.
    pub fn current_job(&self) -> Result<Option<JobId>> {
        let slot = self.slot.lock()?;
        Ok(slot.current.as_ref().map(|job| job.id))
    }

    /// Follow up a stop signal with `SIGKILL` once the grace period elapses.
    ///
    /// Runs on the blocking pool: runtime shutdown drops pending async tasks
    /// but waits for blocking ones, and it also waits for the worker's reaper.
    fn escalate(&self, pid: Pid) {
        let Some(grace) = self.config.kill_grace else {
            return;
        };

        self.runtime.spawn_blocking(move || {
            std::thread::sleep(grace);
            match signal_group(pid, Signal::SIGKILL) {
                Ok(true) => {
                    tracing::warn!(pid = pid.as_raw(), "Killed worker that ignored its stop signal");
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(pid = pid.as_raw(), error = %e, "Failed to kill worker");
                }
            }
        });
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let Ok(mut slot) = self.slot.lock() else {
            return;
        };
        if let Some(job) = slot.current.as_mut() {
            if job.supersede() {
                self.escalate(job.pid);
            }
        }
    }
}
