//! Worker side of a job.
//!
//! - [`process`]: forks the caller's work into its own process group and
//!   reaps it
//! - `monitor`: waits for the worker and delivers or suppresses its result
//! - [`work`]: what a job can run ([`WorkOutput`], [`ShellWork`])
//!
//! # Handshake
//!
//! 1. The worker writes its result to the result pipe and closes it
//! 2. It writes the buffer-written marker to a second pipe
//! 3. It sets the completion flag, closes the marker pipe and exits
//!
//! The monitor trusts the result only when the marker arrived. A worker killed
//! at any point before step 2 yields no output, even if some bytes reached the
//! result pipe.

pub(crate) mod monitor;
pub mod process;
pub mod work;

pub use process::{signal_group, spawn_worker, SpawnedWorker, BUFFER_WRITTEN};
pub use work::{ShellWork, WorkOutput};
