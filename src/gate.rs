//! Cancellation gate.
//!
//! Two one-shot signals let the [`Scheduler`](crate::Scheduler) and a job's
//! completion monitor agree on the job's outcome:
//!
//! - the **completion flag** crosses the process boundary (a pipe), so the
//!   worker process can set it. The scheduler polls it without blocking to tell
//!   whether the tracked job is still running.
//! - the **suppression flag** stays inside the scheduler's process. The
//!   scheduler sets it when superseding a job; the monitor checks it right
//!   before delivering. Both happen under the scheduler's lock.
//!
//! Every probe distinguishes "not set yet" from "set" from "the other side is
//! gone", instead of inferring any of them from a closed stream.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::pipe2;
use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::error::{Result, SchedulerError};

/// Byte the worker writes to the completion pipe.
pub const JOB_PROCESS_COMPLETED: u8 = 0b0001_0100;

/// Outcome of a non-blocking completion probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Finished,
}

/// Create the completion flag of a new job.
///
/// The pipe is close-on-exec so processes exec'd by the work never hold it.
pub fn completion_flag() -> Result<(CompletionSignal, CompletionFlag)> {
    let (reader, writer) = pipe2(OFlag::O_CLOEXEC).map_err(SchedulerError::Pipe)?;
    fcntl(reader.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .map_err(SchedulerError::Pipe)?;

    Ok((
        CompletionSignal {
            writer: Some(File::from(writer)),
        },
        CompletionFlag {
            reader: File::from(reader),
            finished: false,
        },
    ))
}

/// Create the suppression flag of a new job.
pub fn suppression_flag() -> (Suppressor, SuppressionFlag) {
    let (tx, rx) = oneshot::channel();
    (
        Suppressor { tx: Some(tx) },
        SuppressionFlag { rx, set: false },
    )
}

/// Write half of the completion flag.
///
/// The worker sets it by writing a byte once its result is published. The
/// parent keeps its own copy for the job's monitor, which releases it on every
/// exit path. Once every copy is closed the reader sees end-of-stream, so a
/// worker that died before setting the flag still reads as finished after its
/// monitor is done. Releasing never writes, so the scheduler's process cannot
/// take a `SIGPIPE` from a read half that was already dropped.
#[derive(Debug)]
pub struct CompletionSignal {
    writer: Option<File>,
}

impl CompletionSignal {
    /// Write the flag. Only the worker process calls this.
    pub fn set(mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.write_all(&[JOB_PROCESS_COMPLETED]);
        }
    }

    /// Close this copy of the write half without writing.
    pub fn release(mut self) {
        self.writer.take();
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.writer.as_ref().map(|w| w.as_raw_fd())
    }
}

/// Read half of the completion flag, polled by the scheduler.
#[derive(Debug)]
pub struct CompletionFlag {
    reader: File,
    finished: bool,
}

impl CompletionFlag {
    /// Probe the flag without blocking.
    ///
    /// No data means the job is still running. End-of-stream means every copy
    /// of the write half is closed, which only happens once both the worker
    /// and its monitor are done, so the job is finished too. Read errors count
    /// as running: the caller then supersedes a job that may have finished,
    /// which at worst discards a result nobody has delivered yet.
    pub fn poll(&mut self) -> Liveness {
        if self.finished {
            return Liveness::Finished;
        }

        let mut byte = [0u8; 1];
        match self.reader.read(&mut byte) {
            Ok(_) => {
                self.finished = true;
                Liveness::Finished
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Liveness::Running,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to probe completion flag");
                Liveness::Running
            }
        }
    }
}

/// Scheduler half of the suppression flag.
#[derive(Debug)]
pub struct Suppressor {
    tx: Option<oneshot::Sender<()>>,
}

impl Suppressor {
    /// Set the flag. Returns false if it was already set or the monitor is
    /// gone.
    pub fn suppress(&mut self) -> bool {
        match self.tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

/// Monitor half of the suppression flag.
#[derive(Debug)]
pub struct SuppressionFlag {
    rx: oneshot::Receiver<()>,
    set: bool,
}

impl SuppressionFlag {
    /// Check the flag without blocking.
    ///
    /// A dropped [`Suppressor`] that never fired means the scheduler stopped
    /// tracking the job without superseding it, so the flag stays unset.
    pub fn is_set(&mut self) -> bool {
        if self.set {
            return true;
        }
        match self.rx.try_recv() {
            Ok(()) => {
                self.set = true;
                true
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => false,
        }
    }
}
