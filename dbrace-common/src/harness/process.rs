//! Handles to spawned OS processes.
//!
//! Signals are delivered through the system `kill` utility so the harness
//! needs no platform bindings. Exit statuses are cached once reaped.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::errors::{HarnessError, HarnessResult};

/// Poll interval while waiting for a process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Signals the harness sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Term,
    Int,
    Kill,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Term => "TERM",
            Self::Int => "INT",
            Self::Kill => "KILL",
        }
    }

    pub fn number(&self) -> i32 {
        match self {
            Self::Term => 15,
            Self::Int => 2,
            Self::Kill => 9,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG{}", self.name())
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitOutcome {
    /// Exited on its own with this code.
    Exited(i32),
    /// Killed by this signal number.
    Signaled(i32),
    Unknown,
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signaled(signal);
            }
        }
        Self::Unknown
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
            Self::Unknown => write!(f, "unknown exit status"),
        }
    }
}

/// Result of stopping a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopStatus {
    pub outcome: ExitOutcome,
    /// True when the requested signal was not enough and the process was killed.
    pub escalated: bool,
    pub signal_sent: Option<Signal>,
    pub elapsed: Duration,
}

impl StopStatus {
    /// Exit code, when the process exited rather than being killed.
    pub fn exit_code(&self) -> Option<i32> {
        match self.outcome {
            ExitOutcome::Exited(code) => Some(code),
            _ => None,
        }
    }

    /// True when the process exited with `code` without an escalated kill.
    pub fn is_interrupted(&self, code: i32) -> bool {
        !self.escalated && self.exit_code() == Some(code)
    }
}

impl fmt::Display for StopStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.outcome)?;
        if let Some(signal) = self.signal_sent {
            write!(f, " after {signal}")?;
        }
        if self.escalated {
            write!(f, " (escalated to SIGKILL)")?;
        }
        write!(f, " in {:?}", self.elapsed)
    }
}

/// A spawned process owned by the harness.
#[derive(Debug)]
pub struct ProcessHandle {
    pub name: String,
    pub pid: u32,
    pub started_at: Instant,
    child: Child,
    exit: Option<ExitStatus>,
    log_path: Option<PathBuf>,
}

impl ProcessHandle {
    /// Spawn `program`, sending stdout and stderr to `log_path` when given.
    pub fn spawn<I, S>(
        name: &str,
        program: &Path,
        args: I,
        cwd: &Path,
        env: &HashMap<String, String>,
        log_path: Option<&Path>,
    ) -> HarnessResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(cwd).stdin(Stdio::null());

        match log_path {
            Some(path) => {
                let file = File::options().create(true).append(true).open(path)?;
                cmd.stdout(file.try_clone()?).stderr(file);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        for (k, v) in env {
            cmd.env(k, v);
        }

        let child = cmd.spawn().map_err(|e| {
            HarnessError::ProcessStartFailed(format!("{}: {}", program.display(), e))
        })?;

        Ok(Self {
            name: name.to_string(),
            pid: child.id(),
            started_at: Instant::now(),
            child,
            exit: None,
            log_path: log_path.map(Path::to_path_buf),
        })
    }

    pub fn is_running(&mut self) -> bool {
        self.try_exit_status().is_none()
    }

    /// Exit status if the process has ended (non-blocking).
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            self.exit = self.child.try_wait().ok().flatten();
        }
        self.exit
    }

    /// Deliver `signal` to the process.
    pub fn signal(&self, signal: Signal) -> HarnessResult<()> {
        if self.exit.is_some() {
            return Err(HarnessError::invalid_state(
                format!("send {signal}"),
                format!("{} (pid={})", self.name, self.pid),
                "exited",
            ));
        }
        let output = Command::new("kill")
            .arg(format!("-{}", signal.name()))
            .arg(self.pid.to_string())
            .stdin(Stdio::null())
            .output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(HarnessError::Io(std::io::Error::other(format!(
                "kill -{} {} failed: {}",
                signal.name(),
                self.pid,
                String::from_utf8_lossy(&output.stderr).trim()
            ))))
        }
    }

    /// Wait up to `timeout` for the process to exit.
    pub fn wait_timeout(&mut self, timeout: Duration) -> HarnessResult<Option<ExitStatus>> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.exit = Some(status);
                return Ok(Some(status));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Send `signal`, wait up to `timeout`, then SIGKILL if still alive.
    pub fn terminate(&mut self, signal: Signal, timeout: Duration) -> HarnessResult<StopStatus> {
        let start = Instant::now();
        self.signal(signal)?;

        if let Some(status) = self.wait_timeout(timeout)? {
            return Ok(StopStatus {
                outcome: status.into(),
                escalated: false,
                signal_sent: Some(signal),
                elapsed: start.elapsed(),
            });
        }

        self.child.kill()?;
        let status = self.wait()?;
        Ok(StopStatus {
            outcome: status.into(),
            escalated: true,
            signal_sent: Some(signal),
            elapsed: start.elapsed(),
        })
    }

    /// SIGKILL the process and reap it.
    pub fn kill(&mut self) -> std::io::Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        self.child.kill()?;
        self.wait()
    }

    pub fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait()?;
        self.exit = Some(status);
        Ok(status)
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Last `max_lines` lines of the captured output.
    pub fn log_tail(&self, max_lines: usize) -> Option<String> {
        const TAIL_BYTES: u64 = 16 * 1024;
        let mut file = File::open(self.log_path.as_ref()?).ok()?;
        let len = file.metadata().ok()?.len();
        file.seek(SeekFrom::Start(len.saturating_sub(TAIL_BYTES)))
            .ok()?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes).ok()?;
        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = text.lines().collect();
        let from = lines.len().saturating_sub(max_lines);
        Some(lines[from..].join("\n"))
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.try_exit_status().is_none() {
            let _ = self.kill();
        }
    }
}
