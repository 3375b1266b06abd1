use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub type JobId = Uuid;

/// How a job ended, as decided by its completion monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// The result was written to the sink and flushed.
    Completed,
    /// A newer job (or an explicit cancel) superseded this one; any result was
    /// discarded.
    Superseded,
    /// The worker exited without publishing a result: it panicked, failed, or
    /// was killed.
    NoOutput,
    /// The result was valid but the sink rejected it.
    SinkFailed,
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobOutcome::Completed => write!(f, "completed"),
            JobOutcome::Superseded => write!(f, "superseded"),
            JobOutcome::NoOutput => write!(f, "no_output"),
            JobOutcome::SinkFailed => write!(f, "sink_failed"),
        }
    }
}

/// Handle to a scheduled job.
///
/// Dropping it detaches from the job; delivery to the sink happens either way.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    pid: Pid,
    started_at: DateTime<Utc>,
    monitor: JoinHandle<JobOutcome>,
}

impl JobHandle {
    pub(crate) fn new(
        id: JobId,
        pid: Pid,
        started_at: DateTime<Utc>,
        monitor: JoinHandle<JobOutcome>,
    ) -> Self {
        Self {
            id,
            pid,
            started_at,
            monitor,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Worker pid, which is also the id of the worker's process group.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Wait for the completion monitor to decide the job's outcome.
    pub async fn outcome(self) -> JobOutcome {
        match self.monitor.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                // Only the caller's sink can panic inside the monitor
                tracing::error!(job_id = %self.id, "Completion monitor panicked");
                JobOutcome::SinkFailed
            }
            Err(_) => JobOutcome::NoOutput,
        }
    }
}

/// Summary of a finished job, used by the JSON output mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub outcome: JobOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output: String,
}

impl JobReport {
    pub fn new(job_id: JobId, outcome: JobOutcome, started_at: DateTime<Utc>, output: &[u8]) -> Self {
        Self {
            job_id,
            outcome,
            started_at,
            finished_at: Utc::now(),
            output: String::from_utf8_lossy(output).to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_display_matches_serde() {
        for outcome in [
            JobOutcome::Completed,
            JobOutcome::Superseded,
            JobOutcome::NoOutput,
            JobOutcome::SinkFailed,
        ] {
            let json = serde_json::to_string(&outcome).unwrap();
            assert_eq!(json, format!("\"{}\"", outcome));
        }
    }

    #[test]
    fn report_decodes_output_lossily() {
        let id = Uuid::new_v4();
        let started = Utc::now();
        let report = JobReport::new(id, JobOutcome::Completed, started, b"ok\xff");

        assert_eq!(report.job_id, id);
        assert_eq!(report.outcome, JobOutcome::Completed);
        assert!(report.output.starts_with("ok"));
        assert!(report.finished_at >= started);
    }

    #[tokio::test]
    async fn handle_reports_monitor_outcome() {
        let id = Uuid::new_v4();
        let monitor = tokio::task::spawn_blocking(|| JobOutcome::Superseded);
        let handle = JobHandle::new(id, Pid::this(), Utc::now(), monitor);

        assert_eq!(handle.id(), id);
        assert_eq!(handle.outcome().await, JobOutcome::Superseded);
    }

    #[tokio::test]
    async fn handle_maps_monitor_panic_to_sink_failure() {
        let monitor = tokio::task::spawn_blocking(|| -> JobOutcome { panic!("sink exploded") });
        let handle = JobHandle::new(Uuid::new_v4(), Pid::this(), Utc::now(), monitor);

        assert_eq!(handle.outcome().await, JobOutcome::SinkFailed);
    }
}
