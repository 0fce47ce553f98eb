//! Server lifecycle management.
//!
//! [`ServerManager`] starts server processes from a [`ServerConfig`], waits
//! for them to accept connections, and stops them with a graceful or forceful
//! signal. A shared registry enforces that a port and a data directory are
//! each owned by at most one running handle.

use std::collections::HashMap;
use std::fmt;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::logging::{LogLevel, PhaseContext, PhaseEventInput, ScenarioPhase, TestLogger};
use super::process::{ExitOutcome, ProcessHandle, Signal, StopStatus};
use super::sync;
use crate::config::HarnessConfig;
use crate::errors::{HarnessError, HarnessResult};

/// Flag that switches a server into durable mode.
pub const DURABLE_FLAG: &str = "--dur";

/// Exit code the fixture server uses when it cannot bind its port.
pub const BIND_FAILURE_EXIT_CODE: i32 = 48;

/// Lines of server output attached to crash and timeout reports.
const LOG_TAIL_LINES: usize = 20;

/// How to start one server instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub data_directory: PathBuf,
    /// Extra command-line flags, passed in order.
    pub flags: Vec<String>,
    /// Wipe `data_directory` before starting.
    pub reset_data: bool,
}

impl ServerConfig {
    pub fn new(port: u16, data_directory: impl Into<PathBuf>) -> Self {
        Self {
            port,
            data_directory: data_directory.into(),
            flags: Vec::new(),
            reset_data: true,
        }
    }

    pub fn durable(self) -> Self {
        self.flag(DURABLE_FLAG)
    }

    pub fn flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    pub fn flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags.extend(flags.into_iter().map(Into::into));
        self
    }

    /// Keep whatever is already in the data directory.
    pub fn preserve_data(mut self) -> Self {
        self.reset_data = false;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn is_durable(&self) -> bool {
        self.flags.iter().any(|f| f == DURABLE_FLAG)
    }

    /// Command-line arguments for a server listening on `host`.
    pub fn args(&self, host: &str) -> Vec<String> {
        let mut args = vec![
            "--port".to_string(),
            self.port.to_string(),
            "--bind".to_string(),
            host.to_string(),
            "--dbpath".to_string(),
            self.data_directory.display().to_string(),
        ];
        args.extend(self.flags.iter().cloned());
        args
    }

    /// Recovery-journal directory under the data directory.
    pub fn journal_dir(&self) -> PathBuf {
        self.data_directory.join("journal")
    }
}

/// Lifecycle state of a server handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        };
        write!(f, "{s}")
    }
}

/// How `stop` asks the server to go away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// SIGTERM: orderly shutdown.
    Graceful,
    /// SIGKILL: simulated hard crash.
    Forceful,
}

impl StopMode {
    pub fn signal(&self) -> Signal {
        match self {
            Self::Graceful => Signal::Term,
            Self::Forceful => Signal::Kill,
        }
    }
}

#[derive(Debug, Clone)]
struct Claim {
    token: u64,
    data_directory: PathBuf,
    pid: u32,
}

/// Ports and data directories owned by live handles.
#[derive(Debug, Default)]
pub struct PortRegistry {
    claims: Mutex<HashMap<u16, Claim>>,
    next_token: AtomicU64,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&self, port: u16, data_directory: &Path) -> HarnessResult<u64> {
        let dir = normalize(data_directory);
        let mut claims = self.claims.lock().unwrap();
        if claims.contains_key(&port) {
            return Err(HarnessError::PortInUse { port });
        }
        if let Some((owner, _)) = claims.iter().find(|(_, c)| c.data_directory == dir) {
            return Err(HarnessError::DataDirectoryInUse {
                path: data_directory.to_path_buf(),
                port: *owner,
            });
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        claims.insert(
            port,
            Claim {
                token,
                data_directory: dir,
                pid: 0,
            },
        );
        Ok(token)
    }

    fn set_pid(&self, port: u16, token: u64, pid: u32) {
        if let Some(claim) = self.claims.lock().unwrap().get_mut(&port)
            && claim.token == token
        {
            claim.pid = pid;
        }
    }

    fn release(&self, port: u16, token: u64) {
        let mut claims = self.claims.lock().unwrap();
        if claims.get(&port).is_some_and(|c| c.token == token) {
            claims.remove(&port);
        }
    }

    /// Ports currently owned by a handle, with their server pids.
    pub fn live(&self) -> Vec<(u16, u32)> {
        let mut live: Vec<_> = self
            .claims
            .lock()
            .unwrap()
            .iter()
            .map(|(port, c)| (*port, c.pid))
            .collect();
        live.sort_unstable();
        live
    }

    pub fn is_claimed(&self, port: u16) -> bool {
        self.claims.lock().unwrap().contains_key(&port)
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// A started server instance.
#[derive(Debug)]
pub struct ServerHandle {
    config: ServerConfig,
    process: ProcessHandle,
    state: ServerState,
    last_exit_code: Option<i32>,
    last_stop: Option<StopStatus>,
    registry: Arc<PortRegistry>,
    token: u64,
    crash_reported: bool,
}

impl ServerHandle {
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn data_directory(&self) -> &Path {
        &self.config.data_directory
    }

    pub fn pid(&self) -> u32 {
        self.process.pid
    }

    /// State as of the last manager call; see [`ServerManager::poll`].
    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn last_exit_code(&self) -> Option<i32> {
        self.last_exit_code
    }

    pub fn last_stop(&self) -> Option<&StopStatus> {
        self.last_stop.as_ref()
    }

    pub fn uptime(&self) -> Duration {
        self.process.started_at.elapsed()
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.process.log_path()
    }

    fn label(&self) -> String {
        format!("server:{}", self.config.port)
    }

    fn release(&mut self) {
        self.registry.release(self.config.port, self.token);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.process.is_running() {
            let _ = self.process.kill();
        }
        self.release();
    }
}

/// Starts, stops and restarts server processes.
pub struct ServerManager {
    binary: PathBuf,
    host: String,
    startup_timeout: Duration,
    stop_timeout: Duration,
    log_dir: PathBuf,
    env_vars: HashMap<String, String>,
    logger: TestLogger,
    registry: Arc<PortRegistry>,
}

impl ServerManager {
    pub fn new(config: &HarnessConfig, log_dir: impl Into<PathBuf>, logger: TestLogger) -> Self {
        Self {
            binary: config.server_binary.clone(),
            host: config.host.clone(),
            startup_timeout: config.startup_timeout,
            stop_timeout: config.stop_timeout,
            log_dir: log_dir.into(),
            env_vars: config.env_vars.clone(),
            logger,
            registry: Arc::new(PortRegistry::new()),
        }
    }

    pub fn registry(&self) -> &Arc<PortRegistry> {
        &self.registry
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    pub fn startup_timeout(&self) -> Duration {
        self.startup_timeout
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Start a server and block until it accepts connections.
    pub fn start(&self, config: ServerConfig) -> HarnessResult<ServerHandle> {
        let port = config.port;
        let token = self.registry.claim(port, &config.data_directory)?;

        match self.launch(&config, token) {
            Ok(handle) => Ok(handle),
            Err(err) => {
                self.registry.release(port, token);
                self.logger.log_phase_event(
                    PhaseEventInput::new(
                        ScenarioPhase::Setup,
                        format!("server start failed: {err}"),
                        PhaseContext::decision_only("SERVER_START_FAIL").port(port),
                    )
                    .level(LogLevel::Error),
                );
                Err(err)
            }
        }
    }

    fn launch(&self, config: &ServerConfig, token: u64) -> HarnessResult<ServerHandle> {
        let port = config.port;
        if TcpListener::bind((self.host.as_str(), port)).is_err() {
            return Err(HarnessError::PortInUse { port });
        }

        let dir = &config.data_directory;
        if config.reset_data && dir.exists() {
            self.logger
                .debug(format!("Resetting data directory {}", dir.display()));
            std::fs::remove_dir_all(dir)?;
        }
        std::fs::create_dir_all(dir)?;
        std::fs::create_dir_all(&self.log_dir)?;

        let log_path = self.log_dir.join(format!("server-{port}.log"));
        let args = config.args(&self.host);
        self.logger.log_with_context(
            LogLevel::Info,
            super::logging::LogSource::Server { port },
            format!("Spawning {} {}", self.binary.display(), args.join(" ")),
            vec![("reset_data".to_string(), config.reset_data.to_string())],
        );

        let process = ProcessHandle::spawn(
            &format!("server:{port}"),
            &self.binary,
            &args,
            &self.log_dir,
            &self.env_vars,
            Some(&log_path),
        )?;
        self.registry.set_pid(port, token, process.pid);

        let mut handle = ServerHandle {
            config: config.clone(),
            process,
            state: ServerState::Starting,
            last_exit_code: None,
            last_stop: None,
            registry: Arc::clone(&self.registry),
            token,
            crash_reported: false,
        };

        let pid = handle.process.pid;
        let waited = {
            let process = &mut handle.process;
            sync::wait_for_port(&self.host, port, self.startup_timeout, || {
                match process.try_exit_status() {
                    None => Ok(()),
                    Some(status) => Err(match ExitOutcome::from(status) {
                        ExitOutcome::Exited(BIND_FAILURE_EXIT_CODE) => {
                            HarnessError::PortInUse { port }
                        }
                        outcome => HarnessError::UnexpectedCrash {
                            name: format!("server:{port}"),
                            pid,
                            status: format!("{outcome} during startup"),
                        },
                    }),
                }
            })
        };

        let waited = match waited {
            Ok(waited) => waited,
            Err(err) => {
                handle.state = ServerState::Crashed;
                handle.last_exit_code = handle
                    .process
                    .try_exit_status()
                    .and_then(|status| status.code());
                self.report_log_tail(&handle);
                return Err(err);
            }
        };

        let Some(waited) = waited else {
            self.logger.error(format!(
                "server:{port} (pid={pid}) not reachable after {:?}",
                self.startup_timeout
            ));
            self.report_log_tail(&handle);
            let _ = handle.process.kill();
            handle.state = ServerState::Crashed;
            return Err(HarnessError::StartupTimeout {
                port,
                timeout: self.startup_timeout,
            });
        };

        handle.state = ServerState::Running;
        self.logger.phase(
            ScenarioPhase::Setup,
            format!(
                "server:{port} ready after {waited:?}{}",
                if config.is_durable() { " (durable)" } else { "" }
            ),
            PhaseContext::decision_only("SERVER_START")
                .port(port)
                .pid(pid),
        );
        Ok(handle)
    }

    /// Stop a running server and return how it exited.
    ///
    /// Escalates to SIGKILL when the process outlives `timeout`; the returned
    /// status records that.
    pub fn stop(
        &self,
        handle: &mut ServerHandle,
        mode: StopMode,
        timeout: Duration,
    ) -> HarnessResult<StopStatus> {
        if self.poll(handle) != ServerState::Running {
            return Err(self.not_running(handle, "stop"));
        }

        let port = handle.port();
        let signal = mode.signal();
        self.logger.log_server(
            port,
            LogLevel::Info,
            format!(
                "Sending {signal} (pid={}, timeout={timeout:?})",
                handle.pid()
            ),
        );
        handle.state = ServerState::Stopping;

        let status = match handle.process.terminate(signal, timeout) {
            Ok(status) => status,
            Err(err) => {
                if handle.process.try_exit_status().is_some() {
                    handle.state = ServerState::Running;
                    self.poll(handle);
                    return Err(self.not_running(handle, "stop"));
                }
                handle.state = ServerState::Running;
                return Err(err);
            }
        };

        handle.state = ServerState::Stopped;
        handle.last_exit_code = status.exit_code();
        handle.last_stop = Some(status.clone());
        handle.release();

        let artifact = self
            .logger
            .capture_artifact_json(&format!("stop-{port}-{}", handle.pid()), &status)
            .ok();
        let decision = if status.escalated {
            "SERVER_STOP_ESCALATED"
        } else {
            "SERVER_STOP"
        };
        let mut event = PhaseEventInput::new(
            ScenarioPhase::Teardown,
            format!("server:{port} {status}"),
            PhaseContext::decision_only(decision)
                .port(port)
                .pid(handle.pid())
                .exit_code(status.exit_code()),
        );
        if status.escalated {
            event = event.level(LogLevel::Warn);
        }
        if let Some(path) = artifact.as_deref() {
            event = event.artifact(path);
        }
        self.logger.log_phase_event(event);

        Ok(status)
    }

    /// Stop (if still running) and start again on preserved data.
    pub fn restart(
        &self,
        mut handle: ServerHandle,
        config: ServerConfig,
    ) -> HarnessResult<ServerHandle> {
        if self.poll(&mut handle) == ServerState::Running {
            self.stop(&mut handle, StopMode::Graceful, self.stop_timeout)?;
        }
        let previous = handle.label();
        drop(handle);

        self.logger.info(format!(
            "Restarting {previous} as server:{} on {}",
            config.port,
            config.data_directory.display()
        ));
        self.start(config.preserve_data())
    }

    /// Refresh `handle` and detect a crash without stopping anything.
    pub fn poll(&self, handle: &mut ServerHandle) -> ServerState {
        if matches!(handle.state, ServerState::Running | ServerState::Starting)
            && let Some(status) = handle.process.try_exit_status()
        {
            let outcome = ExitOutcome::from(status);
            handle.state = ServerState::Crashed;
            handle.last_exit_code = status.code();
            handle.release();
            self.logger.log_phase_event(
                PhaseEventInput::new(
                    ScenarioPhase::Running,
                    format!(
                        "{} (pid={}) terminated unexpectedly: {outcome}",
                        handle.label(),
                        handle.pid()
                    ),
                    PhaseContext::decision_only("SERVER_CRASH")
                        .port(handle.port())
                        .pid(handle.pid())
                        .exit_code(status.code()),
                )
                .level(LogLevel::Error),
            );
            self.report_log_tail(handle);
        }
        handle.state
    }

    /// Send a raw signal to a running server without waiting.
    pub fn signal(&self, handle: &mut ServerHandle, signal: Signal) -> HarnessResult<()> {
        if self.poll(handle) != ServerState::Running {
            let operation = format!("send {signal}");
            return Err(self.not_running(handle, &operation));
        }
        self.logger
            .log_server(handle.port(), LogLevel::Info, format!("Sending {signal}"));
        handle.process.signal(signal)
    }

    /// Error for an operation that needs a running handle.
    ///
    /// The first call after a crash reports `UnexpectedCrash`; later calls
    /// see `InvalidState`.
    fn not_running(&self, handle: &mut ServerHandle, operation: &str) -> HarnessError {
        if handle.state == ServerState::Crashed && !handle.crash_reported {
            handle.crash_reported = true;
            let status = handle
                .last_exit_code
                .map(|code| format!("exit code {code}"))
                .unwrap_or_else(|| "killed by signal".to_string());
            return HarnessError::UnexpectedCrash {
                name: handle.label(),
                pid: handle.pid(),
                status,
            };
        }
        HarnessError::invalid_state(operation, handle.label(), handle.state)
    }

    fn report_log_tail(&self, handle: &ServerHandle) {
        if let Some(tail) = handle.process.log_tail(LOG_TAIL_LINES)
            && !tail.is_empty()
        {
            let port = handle.port();
            self.logger.log_with_context(
                LogLevel::Warn,
                super::logging::LogSource::Server { port },
                "Last server output",
                vec![("tail".to_string(), tail)],
            );
        }
    }

    /// Allocate `n` distinct free local ports.
    ///
    /// Ports already owned by a handle of this manager are never returned.
    pub fn allocate_ports(&self, n: usize) -> HarnessResult<Vec<u16>> {
        for _ in 0..3 {
            let ports = allocate_ports(&self.host, n)?;
            if ports.iter().all(|port| !self.registry.is_claimed(*port)) {
                return Ok(ports);
            }
        }
        Err(HarnessError::Config(format!(
            "could not allocate {n} unclaimed ports"
        )))
    }
}

/// Return `n` distinct ports that were free a moment ago.
///
/// Every listener is held until all ports are chosen so the OS cannot hand
/// out the same port twice.
pub fn allocate_ports(host: &str, n: usize) -> HarnessResult<Vec<u16>> {
    let mut listeners = Vec::with_capacity(n);
    for _ in 0..n {
        let listener = TcpListener::bind((host, 0))?;
        listeners.push(listener);
    }
    listeners
        .iter()
        .map(|l| Ok(l.local_addr()?.port()))
        .collect()
}
