use std::str::FromStr;
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::error::{Result, SchedulerError};

/// Shell used to run [`ShellWork`](crate::worker::ShellWork) commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellConfig {
    /// Shell executable
    pub program: String,
    /// Flag that makes the shell read the command from its next argument
    pub flag: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: "/bin/sh".to_string(),
            flag: "-c".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Signal sent to a superseded job's process group when the caller does
    /// not pick one.
    pub default_stop_signal: Signal,

    /// When set, a superseded job's process group receives `SIGKILL` once this
    /// grace period has elapsed after the stop signal.
    /// Disabled by default: the stop signal is the only termination request.
    pub kill_grace: Option<Duration>,

    pub shell: ShellConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_stop_signal: Signal::SIGHUP,
            kill_grace: None,
            shell: ShellConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_stop_signal(mut self, signal: Signal) -> Self {
        self.default_stop_signal = signal;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = Some(grace);
        self
    }

    pub fn with_shell(mut self, shell: ShellConfig) -> Self {
        self.shell = shell;
        self
    }
}

/// Parse a signal given as `SIGHUP`, `HUP`, `hup` or its number (`1`).
pub fn parse_signal(value: &str) -> Result<Signal> {
    let trimmed = value.trim();

    let parsed = if let Ok(number) = trimmed.parse::<i32>() {
        Signal::try_from(number).ok()
    } else {
        let upper = trimmed.to_ascii_uppercase();
        let name = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{}", upper)
        };
        Signal::from_str(&name).ok()
    };

    match parsed {
        Some(Signal::SIGKILL) | Some(Signal::SIGSTOP) | None => {
            Err(SchedulerError::InvalidSignal(value.to_string()))
        }
        Some(signal) => Ok(signal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.default_stop_signal, Signal::SIGHUP);
        assert!(cfg.kill_grace.is_none());
        assert_eq!(cfg.shell.program, "/bin/sh");
        assert_eq!(cfg.shell.flag, "-c");
    }

    #[test]
    fn scheduler_config_builders() {
        let cfg = SchedulerConfig::default()
            .with_stop_signal(Signal::SIGTERM)
            .with_kill_grace(Duration::from_millis(250))
            .with_shell(ShellConfig {
                program: "/bin/bash".to_string(),
                flag: "-c".to_string(),
            });
        assert_eq!(cfg.default_stop_signal, Signal::SIGTERM);
        assert_eq!(cfg.kill_grace, Some(Duration::from_millis(250)));
        assert_eq!(cfg.shell.program, "/bin/bash");
    }

    #[test]
    fn parse_signal_accepts_names_and_numbers() {
        assert_eq!(parse_signal("SIGHUP").unwrap(), Signal::SIGHUP);
        assert_eq!(parse_signal("term").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal(" INT ").unwrap(), Signal::SIGINT);
        assert_eq!(parse_signal("1").unwrap(), Signal::SIGHUP);
        assert_eq!(parse_signal("15").unwrap(), Signal::SIGTERM);
    }

    #[test]
    fn parse_signal_rejects_unknown_and_uncatchable() {
        assert!(parse_signal("SIGNOPE").is_err());
        assert!(parse_signal("").is_err());
        assert!(parse_signal("999").is_err());
        // SIGKILL and SIGSTOP cannot be used as cooperative stop requests
        assert!(parse_signal("KILL").is_err());
        assert!(parse_signal("SIGSTOP").is_err());
        assert!(parse_signal("9").is_err());
    }
}
