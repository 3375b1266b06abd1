use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

use jobslot::config::parse_signal;
use jobslot::shutdown::install_shutdown_handler;
use jobslot::{
    JobHandle, JobOutcome, JobReport, Scheduler, SchedulerConfig, SharedBuffer, ShellConfig,
};

#[derive(Parser, Debug)]
#[command(name = "jobslot")]
#[command(version)]
#[command(about = "Run shell commands read from stdin, each one superseding the previous")]
struct Args {
    /// Signal sent to a superseded command's process group
    #[arg(long, default_value = "SIGHUP")]
    stop_signal: String,

    /// Shell used to run each command
    #[arg(long, default_value = "/bin/sh")]
    shell: String,

    /// Send SIGKILL this many milliseconds after the stop signal
    #[arg(long)]
    kill_grace_ms: Option<u64>,

    /// Output format
    #[arg(long, short = 'o', default_value = "raw")]
    output: OutputFormat,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Results are written to stdout as produced by the command
    Raw,
    /// One JSON object per finished command
    Json,
}

fn schedule_line(
    scheduler: &Scheduler,
    command: &str,
    format: OutputFormat,
) -> Result<JoinHandle<()>, Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Raw => {
            let handle = scheduler.schedule_shell(std::io::stdout(), command)?;
            Ok(tokio::spawn(report_raw(handle)))
        }
        OutputFormat::Json => {
            let buffer = SharedBuffer::new();
            let handle = scheduler.schedule_shell(buffer.clone(), command)?;
            Ok(tokio::spawn(report_json(handle, buffer)))
        }
    }
}

async fn report_raw(handle: JobHandle) {
    let id = handle.id();
    let outcome = handle.outcome().await;
    if outcome == JobOutcome::NoOutput {
        tracing::warn!(job_id = %id, "Command produced no output");
    }
}

async fn report_json(handle: JobHandle, buffer: SharedBuffer) {
    let id = handle.id();
    let started_at = handle.started_at();
    let outcome = handle.outcome().await;

    let report = JobReport::new(id, outcome, started_at, &buffer.take());
    match serde_json::to_string(&report) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::error!(job_id = %id, error = %e, "Failed to encode job report"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // stdout carries job results, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let mut config = SchedulerConfig::default()
        .with_stop_signal(parse_signal(&args.stop_signal)?)
        .with_shell(ShellConfig {
            program: args.shell,
            ..ShellConfig::default()
        });
    if let Some(ms) = args.kill_grace_ms {
        config = config.with_kill_grace(Duration::from_millis(ms));
    }

    let scheduler = Scheduler::new(config)?;
    let shutdown = install_shutdown_handler()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_report: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if scheduler.cancel()? {
                    tracing::info!("Cancelled running command");
                }
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    // End of input: let the last command finish
                    if let Some(report) = last_report.take() {
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                scheduler.cancel()?;
                            }
                            finished = report => finished?,
                        }
                    }
                    break;
                };

                let command = line.trim();
                if command.is_empty() {
                    // A blank line stops the running command
                    scheduler.cancel()?;
                    continue;
                }

                last_report = Some(schedule_line(&scheduler, command, args.output)?);
            }
        }
    }

    Ok(())
}
