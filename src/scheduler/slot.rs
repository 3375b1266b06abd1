use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::gate::{CompletionFlag, Liveness, Suppressor};
use crate::scheduler::job::JobId;
use crate::worker::signal_group;

/// The job the scheduler currently tracks.
#[derive(Debug)]
pub(crate) struct TrackedJob {
    pub id: JobId,
    pub pid: Pid,
    pub stop_signal: Signal,
    pub completion: CompletionFlag,
    pub suppressor: Suppressor,
}

impl TrackedJob {
    pub fn is_running(&mut self) -> bool {
        self.completion.poll() == Liveness::Running
    }

    /// Suppress the job's result and send the stop signal to its process
    /// group, if the job is still running. Returns whether it was.
    ///
    /// Must be called with the scheduler's lock held. The worker can exit
    /// between the liveness check and the signal; the "no such process" error
    /// that follows is expected and ignored.
    pub fn supersede(&mut self) -> bool {
        if !self.is_running() {
            return false;
        }

        self.suppressor.suppress();

        match signal_group(self.pid, self.stop_signal) {
            Ok(true) => {
                tracing::info!(job_id = %self.id, pid = self.pid.as_raw(), signal = %self.stop_signal, "Superseded running job");
            }
            Ok(false) => {
                tracing::debug!(job_id = %self.id, pid = self.pid.as_raw(), "Superseded job had already exited");
            }
            Err(e) => {
                tracing::warn!(job_id = %self.id, pid = self.pid.as_raw(), error = %e, "Failed to signal superseded job");
            }
        }
        true
    }
}

/// The scheduler's single job slot. Guarded by the scheduler's lock, which
/// also serializes every sink write.
#[derive(Debug, Default)]
pub(crate) struct Slot {
    pub current: Option<TrackedJob>,
}
