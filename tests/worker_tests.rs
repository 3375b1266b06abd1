use std::fs::File;
use std::io::Read;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use jobslot::gate::{completion_flag, CompletionFlag, Liveness};
use jobslot::worker::{signal_group, spawn_worker, BUFFER_WRITTEN};
use jobslot::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{getpgid, pipe};

fn wait_finished(completion: &mut CompletionFlag) -> Liveness {
    let deadline = Instant::now() + Duration::from_secs(2);
    while completion.poll() == Liveness::Running && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    completion.poll()
}

fn read_all(file: &mut File) -> Vec<u8> {
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).unwrap();
    bytes
}

#[test]
fn test_worker_publishes_result_then_marker() {
    let (signal, mut completion) = completion_flag().unwrap();
    let mut worker = spawn_worker(|| "result bytes", signal).unwrap();

    assert_eq!(read_all(&mut worker.result), b"result bytes");
    assert_eq!(read_all(&mut worker.marker), vec![BUFFER_WRITTEN]);
    // Set before the marker pipe closed
    assert_eq!(completion.poll(), Liveness::Finished);

    worker.completion.release();
    assert_eq!(
        waitpid(worker.pid, None).unwrap(),
        WaitStatus::Exited(worker.pid, 0)
    );
}

#[test]
fn test_worker_leads_its_own_process_group() {
    let (signal, _completion) = completion_flag().unwrap();
    let mut worker = spawn_worker(
        || {
            std::thread::sleep(Duration::from_millis(200));
            "done"
        },
        signal,
    )
    .unwrap();

    assert_eq!(getpgid(Some(worker.pid)).unwrap(), worker.pid);
    assert_ne!(getpgid(None).unwrap(), worker.pid);

    assert_eq!(read_all(&mut worker.result), b"done");
    waitpid(worker.pid, None).unwrap();
}

#[test]
fn test_signalled_worker_writes_no_marker() {
    let (signal, mut completion) = completion_flag().unwrap();
    let mut worker = spawn_worker(
        || {
            std::thread::sleep(Duration::from_secs(10));
            "never"
        },
        signal,
    )
    .unwrap();

    assert_eq!(completion.poll(), Liveness::Running);
    assert!(signal_group(worker.pid, Signal::SIGHUP).unwrap());

    assert!(read_all(&mut worker.result).is_empty());
    assert!(read_all(&mut worker.marker).is_empty());
    assert_eq!(
        waitpid(worker.pid, None).unwrap(),
        WaitStatus::Signaled(worker.pid, Signal::SIGHUP, false)
    );

    // Only the monitor's copy keeps the flag open now
    assert_eq!(completion.poll(), Liveness::Running);
    worker.completion.release();
    assert_eq!(wait_finished(&mut completion), Liveness::Finished);

    // Group is gone: signalling it again is not an error
    assert!(!signal_group(worker.pid, Signal::SIGHUP).unwrap());
}

#[test]
fn test_panicking_worker_exits_without_marker() {
    let (signal, _completion) = completion_flag().unwrap();
    let mut worker = spawn_worker(|| -> Vec<u8> { panic!("boom") }, signal).unwrap();

    assert!(read_all(&mut worker.result).is_empty());
    assert!(read_all(&mut worker.marker).is_empty());
    assert_eq!(
        waitpid(worker.pid, None).unwrap(),
        WaitStatus::Exited(worker.pid, 101)
    );
}

#[test]
fn test_worker_drops_inherited_descriptors() {
    // Not close-on-exec, so the worker inherits the write half
    let (reader, writer) = pipe().unwrap();

    let (signal, _completion) = completion_flag().unwrap();
    let mut worker = spawn_worker(
        || {
            std::thread::sleep(Duration::from_secs(2));
            "slow"
        },
        signal,
    )
    .unwrap();
    drop(writer);

    // End-of-stream arrives once the worker has closed its copy, long before it
    // exits
    let started = Instant::now();
    let mut reader = File::from(reader);
    assert!(read_all(&mut reader).is_empty());
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(read_all(&mut worker.result), b"slow");
    waitpid(worker.pid, None).unwrap();
}

#[test]
fn test_failing_worker_ignores_parent_stderr_lock() {
    // Another thread holds the stderr lock across the fork
    let (locked_tx, locked_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder = std::thread::spawn(move || {
        let _stderr = std::io::stderr().lock();
        locked_tx.send(()).unwrap();
        let _ = release_rx.recv();
    });
    locked_rx.recv().unwrap();

    let (signal, _completion) = completion_flag().unwrap();
    let mut worker = spawn_worker(
        || -> Result<String, String> { Err("no result".to_string()) },
        signal,
    )
    .unwrap();

    assert!(read_all(&mut worker.result).is_empty());
    assert!(read_all(&mut worker.marker).is_empty());
    assert_eq!(
        waitpid(worker.pid, None).unwrap(),
        WaitStatus::Exited(worker.pid, 1)
    );

    release_tx.send(()).unwrap();
    holder.join().unwrap();
}
