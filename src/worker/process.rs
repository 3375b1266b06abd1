use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{self, killpg, pthread_sigmask, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, pipe2, setpgid, ForkResult, Pid};
use tokio::runtime::Handle;

use crate::error::{Result, SchedulerError};
use crate::gate::CompletionSignal;
use crate::worker::work::WorkOutput;

/// Byte the worker writes once its whole result is in the result pipe.
pub const BUFFER_WRITTEN: u8 = 0b0100_0000;

/// Exit status of a worker whose work panicked.
const PANIC_EXIT_CODE: i32 = 101;

/// Parent-side view of a freshly forked worker.
#[derive(Debug)]
pub struct SpawnedWorker {
    /// Worker pid, which is also its process group id.
    pub pid: Pid,
    /// Read half of the result pipe.
    pub result: File,
    /// Read half of the buffer-written pipe.
    pub marker: File,
    /// The parent's copy of the completion flag's write half.
    pub completion: CompletionSignal,
}

/// Fork a worker process running `work` in its own process group.
///
/// Returns once the group exists, so the caller can signal it immediately.
pub fn spawn_worker<F, O>(work: F, completion: CompletionSignal) -> Result<SpawnedWorker>
where
    F: FnOnce() -> O,
    O: WorkOutput,
{
    let (result_rx, result_tx) = pipe2(OFlag::O_CLOEXEC).map_err(SchedulerError::Pipe)?;
    let (marker_rx, marker_tx) = pipe2(OFlag::O_CLOEXEC).map_err(SchedulerError::Pipe)?;

    // Signals stay blocked until the child has dropped the parent's handlers,
    // so a stop signal sent right after the fork is held pending instead of
    // reaching a handler inherited from the parent.
    let mut saved_mask = SigSet::empty();
    pthread_sigmask(
        SigmaskHow::SIG_SETMASK,
        Some(&SigSet::all()),
        Some(&mut saved_mask),
    )
    .map_err(SchedulerError::Spawn)?;

    // SAFETY: the child resets its signal state, closes inherited descriptors,
    // runs the work and leaves through `_exit`. It never returns into the
    // caller's stack and never touches the async runtime.
    let forked = unsafe { fork() };

    if !matches!(forked, Ok(ForkResult::Child)) {
        let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&saved_mask), None);
    }

    match forked.map_err(SchedulerError::Spawn)? {
        ForkResult::Child => {
            drop(result_rx);
            drop(marker_rx);
            run_worker(work, result_tx, marker_tx, completion)
        }
        ForkResult::Parent { child } => {
            // The child makes the same call; whichever runs first creates the
            // group.
            if let Err(e) = setpgid(child, child) {
                tracing::debug!(pid = child.as_raw(), error = %e, "setpgid from parent failed");
            }

            drop(result_tx);
            drop(marker_tx);

            Ok(SpawnedWorker {
                pid: child,
                result: File::from(result_rx),
                marker: File::from(marker_rx),
                completion,
            })
        }
    }
}

/// Send `signal` to a worker's process group.
///
/// Returns `Ok(false)` when the group no longer exists: the worker finished
/// between the liveness check and this call.
pub fn signal_group(pgid: Pid, signal: Signal) -> Result<bool> {
    match killpg(pgid, signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(SchedulerError::Signal(e)),
    }
}

/// Reap the worker as soon as it exits.
///
/// Called right after the fork rather than at kill time, so a finished or
/// killed worker never lingers as a zombie until the next job is scheduled.
pub fn detach(runtime: &Handle, pid: Pid) {
    runtime.spawn_blocking(move || loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            Ok(status) => {
                tracing::debug!(pid = pid.as_raw(), status = ?status, "Reaped worker process");
                break;
            }
            Err(e) => {
                tracing::warn!(pid = pid.as_raw(), error = %e, "Failed to reap worker process");
                break;
            }
        }
    });
}

fn run_worker<F, O>(
    work: F,
    result_tx: OwnedFd,
    marker_tx: OwnedFd,
    completion: CompletionSignal,
) -> !
where
    F: FnOnce() -> O,
    O: WorkOutput,
{
    let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
    reset_signal_state();

    let mut keep = vec![result_tx.as_raw_fd(), marker_tx.as_raw_fd()];
    keep.extend(completion.raw_fd());
    close_inherited_fds(&keep);

    let status = match panic::catch_unwind(AssertUnwindSafe(move || work().into_output())) {
        Ok(Some(output)) => match publish(&output, result_tx, marker_tx, completion) {
            Ok(()) => 0,
            Err(_) => 1,
        },
        Ok(None) => 1,
        Err(_) => PANIC_EXIT_CODE,
    };

    // SAFETY: `_exit` skips atexit handlers and destructors, all of which
    // belong to the parent process.
    unsafe { libc::_exit(status) }
}

/// Publish the result, then the buffer-written marker, then the completion
/// flag. A worker interrupted anywhere before the marker is indistinguishable
/// from one that never produced output.
///
/// The marker pipe is closed last: the monitor proceeds on its end-of-stream,
/// and by then the completion flag must already read as set.
fn publish(
    output: &[u8],
    result_tx: OwnedFd,
    marker_tx: OwnedFd,
    completion: CompletionSignal,
) -> io::Result<()> {
    let mut result = File::from(result_tx);
    result.write_all(output)?;
    drop(result);

    let mut marker = File::from(marker_tx);
    marker.write_all(&[BUFFER_WRITTEN])?;
    completion.set();
    drop(marker);

    Ok(())
}

/// Restore default dispositions and unblock everything. Handlers installed by
/// the parent (e.g. the runtime's signal driver) would otherwise swallow the
/// stop signal.
fn reset_signal_state() {
    for sig in Signal::iterator() {
        if sig == Signal::SIGKILL || sig == Signal::SIGSTOP {
            continue;
        }
        // SAFETY: installing the default disposition runs no handler code.
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }
    let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
}

/// Close every descriptor inherited from the parent except stdio and `keep`.
///
/// Another job's pipe inherited here would keep that pipe open for as long as
/// this worker runs.
fn close_inherited_fds(keep: &[RawFd]) {
    let listing = std::fs::read_dir("/proc/self/fd").or_else(|_| std::fs::read_dir("/dev/fd"));
    let Ok(entries) = listing else {
        return;
    };

    // Collected first: the listing holds a descriptor of its own
    let fds: Vec<RawFd> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
        .collect();

    for fd in fds {
        if fd > 2 && !keep.contains(&fd) {
            // SAFETY: the child owns nothing it will use through these
            // descriptors; stale ones just fail with EBADF.
            unsafe {
                libc::close(fd);
            }
        }
    }
}
