use std::io;
use std::process::{Command, Stdio};

use crate::config::ShellConfig;

/// Value a work function hands back to the worker process.
///
/// `None` means the work failed: the worker exits without publishing a result
/// and the job ends with [`JobOutcome::NoOutput`](crate::JobOutcome::NoOutput).
pub trait WorkOutput {
    fn into_output(self) -> Option<Vec<u8>>;
}

impl WorkOutput for Vec<u8> {
    fn into_output(self) -> Option<Vec<u8>> {
        Some(self)
    }
}

impl WorkOutput for String {
    fn into_output(self) -> Option<Vec<u8>> {
        Some(self.into_bytes())
    }
}

impl WorkOutput for &'static str {
    fn into_output(self) -> Option<Vec<u8>> {
        Some(self.as_bytes().to_vec())
    }
}

impl WorkOutput for &'static [u8] {
    fn into_output(self) -> Option<Vec<u8>> {
        Some(self.to_vec())
    }
}

impl<T, E> WorkOutput for Result<T, E>
where
    T: WorkOutput,
    E: std::fmt::Display,
{
    fn into_output(self) -> Option<Vec<u8>> {
        match self {
            Ok(value) => value.into_output(),
            Err(e) => {
                report_failure(&format!("job failed: {}\n", e));
                None
            }
        }
    }
}

/// Write a failure message straight to descriptor 2.
///
/// Runs inside the forked worker, where `std::io::stderr` is off limits: its
/// lock may have been held by another parent thread at the moment of the fork.
fn report_failure(message: &str) {
    let mut bytes = message.as_bytes();
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a live slice for the duration of the call.
        let written =
            unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        if written <= 0 {
            return;
        }
        bytes = &bytes[written as usize..];
    }
}

/// A shell command whose standard output is the job's result.
///
/// Anything the command spawns stays in the worker's process group, so
/// superseding the job stops the whole pipeline.
#[derive(Debug, Clone)]
pub struct ShellWork {
    command: String,
    shell: ShellConfig,
}

impl ShellWork {
    pub fn new(command: impl Into<String>) -> Self {
        Self::with_shell(command, ShellConfig::default())
    }

    pub fn with_shell(command: impl Into<String>, shell: ShellConfig) -> Self {
        Self {
            command: command.into(),
            shell,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Run the command to completion and capture its stdout.
    ///
    /// A non-zero exit status is an error; stderr is passed through.
    pub fn run(&self) -> io::Result<Vec<u8>> {
        let output = Command::new(&self.shell.program)
            .arg(&self.shell.flag)
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .output()?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(io::Error::other(format!(
                "`{}` exited with {}",
                self.command, output.status
            )))
        }
    }
}
