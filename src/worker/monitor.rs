use std::fs::File;
use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use nix::unistd::Pid;

use crate::gate::{CompletionSignal, SuppressionFlag};
use crate::scheduler::job::{JobId, JobOutcome};
use crate::scheduler::slot::Slot;
use crate::worker::process::{SpawnedWorker, BUFFER_WRITTEN};

/// Waits for one job's worker and decides whether its result reaches the sink.
///
/// Runs on the blocking pool: reading the worker's pipes is the only place a
/// job is allowed to block. The final check-and-deliver step holds the
/// scheduler's lock, so a suppression decision and a sink write can never
/// interleave.
pub(crate) struct CompletionMonitor<W> {
    job_id: JobId,
    pid: Pid,
    result: File,
    marker: File,
    completion: CompletionSignal,
    suppression: SuppressionFlag,
    sink: W,
    slot: Arc<Mutex<Slot>>,
}

impl<W> CompletionMonitor<W>
where
    W: Write + Send + 'static,
{
    pub(crate) fn new(
        job_id: JobId,
        worker: SpawnedWorker,
        suppression: SuppressionFlag,
        sink: W,
        slot: Arc<Mutex<Slot>>,
    ) -> Self {
        Self {
            job_id,
            pid: worker.pid,
            result: worker.result,
            marker: worker.marker,
            completion: worker.completion,
            suppression,
            sink,
            slot,
        }
    }

    pub(crate) fn run(self) -> JobOutcome {
        let CompletionMonitor {
            job_id,
            pid,
            mut result,
            mut marker,
            completion,
            mut suppression,
            mut sink,
            slot,
        } = self;

        let output = collect_output(job_id, &mut result, &mut marker);
        drop(result);
        drop(marker);

        // A panicking sink can't poison this lock: delivery is unwound below
        let _guard = slot.lock().unwrap_or_else(PoisonError::into_inner);

        let outcome = if suppression.is_set() {
            JobOutcome::Superseded
        } else {
            match output {
                Some(bytes) => deliver(job_id, &mut sink, &bytes),
                None => JobOutcome::NoOutput,
            }
        };

        completion.release();

        tracing::info!(job_id = %job_id, pid = pid.as_raw(), outcome = %outcome, "Job finished");
        outcome
    }
}

/// Drain the result pipe, then trust it only if the buffer-written marker
/// follows.
///
/// The result is drained first so a worker whose output exceeds the pipe
/// capacity is never stuck writing while the marker is awaited. An empty read
/// alone says nothing: an interrupted worker closes the pipe the same way as
/// one that produced no bytes.
fn collect_output(job_id: JobId, result: &mut File, marker: &mut File) -> Option<Vec<u8>> {
    let mut output = Vec::new();
    if let Err(e) = result.read_to_end(&mut output) {
        tracing::debug!(job_id = %job_id, error = %e, "Failed to read worker result");
        return None;
    }

    let mut flag = Vec::with_capacity(1);
    match marker.read_to_end(&mut flag) {
        Ok(_) if flag == [BUFFER_WRITTEN] => Some(output),
        Ok(_) => {
            tracing::debug!(job_id = %job_id, "Worker exited without writing its buffer");
            None
        }
        Err(e) => {
            tracing::debug!(job_id = %job_id, error = %e, "Failed to read buffer-written marker");
            None
        }
    }
}

fn deliver<W: Write>(job_id: JobId, sink: &mut W, bytes: &[u8]) -> JobOutcome {
    let written = panic::catch_unwind(AssertUnwindSafe(|| {
        sink.write_all(bytes)?;
        sink.flush()
    }));

    match written {
        Ok(Ok(())) => JobOutcome::Completed,
        Ok(Err(e)) => {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to write job result to sink");
            JobOutcome::SinkFailed
        }
        Err(_) => {
            tracing::error!(job_id = %job_id, "Sink panicked while writing job result");
            JobOutcome::SinkFailed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    use uuid::Uuid;

    use crate::sink::SharedBuffer;

    struct FailingSink;

    impl Write for FailingSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct PanickingSink;

    impl Write for PanickingSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            panic!("sink exploded");
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn pipe_with(bytes: &[u8]) -> File {
        let (reader, writer) = nix::unistd::pipe().unwrap();
        let mut writer = File::from(writer);
        writer.write_all(bytes).unwrap();
        drop(writer);
        File::from(reader)
    }

    #[test]
    fn collect_requires_marker() {
        let id = Uuid::new_v4();

        let mut result = pipe_with(b"payload");
        let mut marker = pipe_with(&[BUFFER_WRITTEN]);
        assert_eq!(
            collect_output(id, &mut result, &mut marker),
            Some(b"payload".to_vec())
        );

        let mut result = pipe_with(b"");
        let mut marker = pipe_with(&[BUFFER_WRITTEN]);
        assert_eq!(collect_output(id, &mut result, &mut marker), Some(Vec::new()));

        // Interrupted worker: partial bytes, no marker
        let mut result = pipe_with(b"pay");
        let mut marker = pipe_with(b"");
        assert_eq!(collect_output(id, &mut result, &mut marker), None);
    }

    #[test]
    fn deliver_writes_to_sink() {
        let buffer = SharedBuffer::new();
        let outcome = deliver(Uuid::new_v4(), &mut buffer.clone(), b"result");
        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(buffer.contents(), b"result");
    }

    #[test]
    fn deliver_reports_sink_errors() {
        assert_eq!(
            deliver(Uuid::new_v4(), &mut FailingSink, b"result"),
            JobOutcome::SinkFailed
        );
        assert_eq!(
            deliver(Uuid::new_v4(), &mut PanickingSink, b"result"),
            JobOutcome::SinkFailed
        );
    }
}
