//! Scenario driver.
//!
//! A [`Scenario`] owns one scratch directory plus the logger, lifecycle
//! manager, session runner and verifier that operate inside it. It tracks the
//! scenario state machine and tears everything down on drop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;

use super::lifecycle::ServerManager;
use super::logging::{
    LogLevel, PhaseContext, PhaseEventInput, ScenarioPhase, TestLogger, TestLoggerBuilder,
};
use super::session::SessionRunner;
use super::verify::Verifier;
use crate::client::{Connector, JsonLineConnector, ServerClient};
use crate::config::HarnessConfig;
use crate::errors::{HarnessError, HarnessResult};

/// Scenario directories older than this are removed when a new scenario starts.
pub const STALE_SCENARIO_AGE: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioState {
    Setup,
    Running,
    Teardown,
    Verified,
    Failed,
}

impl ScenarioState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Failed)
    }
}

impl std::fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Setup => "setup",
            Self::Running => "running",
            Self::Teardown => "teardown",
            Self::Verified => "verified",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Remove scenario directories under `base_dir` older than `max_age`.
///
/// Returns the number of directories removed.
pub fn cleanup_stale_scenarios(base_dir: &Path, max_age: Duration) -> usize {
    let Ok(entries) = std::fs::read_dir(base_dir) else {
        return 0;
    };
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let is_stale = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > max_age);
        if is_stale && std::fs::remove_dir_all(&path).is_ok() {
            removed += 1;
        }
    }

    if removed > 0 {
        eprintln!("[dbrace::scenario] removed {removed} stale scenario directories");
    }
    removed
}

/// Outcome of [`Scenario::run`].
#[derive(Debug)]
pub struct ScenarioReport {
    pub name: String,
    pub state: ScenarioState,
    pub error: Option<HarnessError>,
    pub elapsed: Duration,
    pub dir: Option<PathBuf>,
    /// Files written under the scenario's artifact directory, plus the phase log.
    /// These are gone if the directory was cleaned up.
    pub artifacts: Vec<PathBuf>,
    pub assertions_passed: usize,
    pub assertions_failed: usize,
}

impl ScenarioReport {
    pub fn is_verified(&self) -> bool {
        self.state == ScenarioState::Verified
    }

    pub fn failure(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }

    /// `Ok` when verified, otherwise the error that failed the scenario.
    pub fn into_result(self) -> HarnessResult<()> {
        match self.error {
            None if self.state == ScenarioState::Verified => Ok(()),
            None => Err(HarnessError::invalid_state(
                "report",
                format!("scenario {}", self.name),
                self.state,
            )),
            Some(err) => Err(err),
        }
    }
}

/// A running scenario.
pub struct Scenario {
    name: String,
    config: HarnessConfig,
    dir: PathBuf,
    logger: TestLogger,
    connector: Arc<JsonLineConnector>,
    servers: ServerManager,
    sessions: SessionRunner,
    verifier: Verifier,
    state: ScenarioState,
    started_at: Instant,
}

impl Scenario {
    pub fn new(name: &str, config: HarnessConfig) -> HarnessResult<Self> {
        config.validate()?;
        cleanup_stale_scenarios(&config.temp_dir, STALE_SCENARIO_AGE);

        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S_%3f");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let dir = config.temp_dir.join(format!(
            "{}_{timestamp}_{}",
            name.replace("::", "_"),
            &suffix[..8]
        ));
        std::fs::create_dir_all(&dir)?;

        let log_dir = dir.join("logs");
        let logger = TestLoggerBuilder::new(name).log_dir(&log_dir).build();
        let connector = Arc::new(JsonLineConnector::new(config.host.clone()));
        let servers = ServerManager::new(&config, &log_dir, logger.clone());
        let sessions = SessionRunner::new(
            Arc::clone(&connector) as Arc<dyn Connector>,
            logger.clone(),
            config.session_ready_timeout,
        );
        let verifier = Verifier::new(logger.clone());

        logger.phase(
            ScenarioPhase::Setup,
            format!("scenario {name} initialized in {}", dir.display()),
            PhaseContext::decision_only("SCENARIO_INIT"),
        );

        Ok(Self {
            name: name.to_string(),
            config,
            dir,
            logger,
            connector,
            servers,
            sessions,
            verifier,
            state: ScenarioState::Setup,
            started_at: Instant::now(),
        })
    }

    /// Run `body` in a fresh scenario and report how it ended.
    ///
    /// The scenario is dropped before this returns, so servers are gone and
    /// the directory has been handled per cleanup policy.
    pub fn run<F>(name: &str, config: HarnessConfig, body: F) -> ScenarioReport
    where
        F: FnOnce(&mut Scenario) -> HarnessResult<()>,
    {
        let started = Instant::now();
        let mut scenario = match Scenario::new(name, config) {
            Ok(scenario) => scenario,
            Err(err) => {
                return ScenarioReport {
                    name: name.to_string(),
                    state: ScenarioState::Failed,
                    error: Some(err),
                    elapsed: started.elapsed(),
                    dir: None,
                    artifacts: Vec::new(),
                    assertions_passed: 0,
                    assertions_failed: 0,
                };
            }
        };

        let result = body(&mut scenario);
        scenario.finish(result.as_ref().err());

        ScenarioReport {
            name: scenario.name.clone(),
            state: scenario.state,
            error: result.err(),
            elapsed: started.elapsed(),
            dir: Some(scenario.dir.clone()),
            artifacts: scenario.artifacts(),
            assertions_passed: scenario.verifier.passed(),
            assertions_failed: scenario.verifier.failed(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn logger(&self) -> &TestLogger {
        &self.logger
    }

    pub fn servers(&self) -> &ServerManager {
        &self.servers
    }

    pub fn sessions(&self) -> &SessionRunner {
        &self.sessions
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    pub fn state(&self) -> ScenarioState {
        self.state
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Exit code the server reports when an interrupt ends it.
    pub fn interrupt_exit_code(&self) -> i32 {
        self.config.interrupt_exit_code
    }

    /// Data directory path `<scenario>/db/<name>`. Parent directories exist;
    /// the directory itself is created by the server start.
    pub fn data_dir(&self, name: &str) -> HarnessResult<PathBuf> {
        let root = self.dir.join("db");
        std::fs::create_dir_all(&root)?;
        Ok(root.join(name))
    }

    pub fn allocate_ports(&self, n: usize) -> HarnessResult<Vec<u16>> {
        self.servers.allocate_ports(n)
    }

    /// Open a control-thread connection.
    pub fn client(&self, port: u16) -> HarnessResult<Box<dyn ServerClient>> {
        self.connector.connect(port)
    }

    pub fn mark_running(&mut self) -> HarnessResult<()> {
        match self.state {
            ScenarioState::Running => Ok(()),
            ScenarioState::Setup => {
                self.transition(ScenarioState::Running, "SCENARIO_RUNNING");
                Ok(())
            }
            other => Err(HarnessError::invalid_state(
                "mark running",
                format!("scenario {}", self.name),
                other,
            )),
        }
    }

    pub fn mark_teardown(&mut self) -> HarnessResult<()> {
        match self.state {
            ScenarioState::Teardown => Ok(()),
            ScenarioState::Setup | ScenarioState::Running => {
                self.transition(ScenarioState::Teardown, "SCENARIO_TEARDOWN");
                Ok(())
            }
            other => Err(HarnessError::invalid_state(
                "mark teardown",
                format!("scenario {}", self.name),
                other,
            )),
        }
    }

    /// Settle the terminal state. The first call wins.
    pub fn finish(&mut self, error: Option<&HarnessError>) -> ScenarioState {
        if self.state.is_terminal() {
            return self.state;
        }
        let _ = self.mark_teardown();
        self.kill_leaked_servers();

        match error {
            None => self.transition(ScenarioState::Verified, "SCENARIO_VERIFIED"),
            Some(err) => {
                self.logger.log_phase_event(
                    PhaseEventInput::new(
                        ScenarioPhase::Verify,
                        format!("scenario failed: {err}"),
                        PhaseContext::decision_only("SCENARIO_FAILED"),
                    )
                    .level(LogLevel::Error),
                );
                let entry = err.code().entry();
                self.logger
                    .error(format!("{err}\n{}", entry.format_full().trim_end()));
                self.state = ScenarioState::Failed;
            }
        }

        let _ = self.logger.capture_artifact_json(
            "scenario-report",
            &serde_json::json!({
                "scenario": self.name,
                "state": self.state,
                "error": error.map(ToString::to_string),
                "error_code": error.map(|e| e.code().code_string()),
                "remediation": error.map(|e| e.code().remediation()),
                "elapsed_ms": self.started_at.elapsed().as_millis() as u64,
                "assertions_passed": self.verifier.passed(),
                "assertions_failed": self.verifier.failed(),
            }),
        );
        self.state
    }

    fn transition(&mut self, next: ScenarioState, decision: &str) {
        let phase = match next {
            ScenarioState::Setup => ScenarioPhase::Setup,
            ScenarioState::Running => ScenarioPhase::Running,
            ScenarioState::Teardown => ScenarioPhase::Teardown,
            ScenarioState::Verified | ScenarioState::Failed => ScenarioPhase::Verify,
        };
        self.logger.phase(
            phase,
            format!("scenario {} -> {next}", self.state),
            PhaseContext::decision_only(decision),
        );
        self.state = next;
    }

    /// Kill servers whose handles outlived the scenario body.
    fn kill_leaked_servers(&self) {
        for (port, pid) in self.servers.registry().live() {
            self.logger.log_phase_event(
                PhaseEventInput::new(
                    ScenarioPhase::Teardown,
                    format!("killing leaked server on port {port}"),
                    PhaseContext::decision_only("SERVER_LEAK_KILL")
                        .port(port)
                        .pid(pid),
                )
                .level(LogLevel::Warn),
            );
            let _ = std::process::Command::new("kill")
                .args(["-KILL", &pid.to_string()])
                .output();
        }
    }

    fn artifacts(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .logger
            .phase_log_path()
            .into_iter()
            .map(Path::to_path_buf)
            .collect();
        if let Some(dir) = self.logger.artifact_dir()
            && let Ok(entries) = std::fs::read_dir(dir)
        {
            let mut files: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
            files.sort();
            paths.extend(files);
        }
        paths
    }

    fn cleanup(&mut self) {
        if !self.state.is_terminal() {
            // Dropped without finish, most likely while unwinding from a panic.
            self.logger.warn("scenario dropped before finishing");
            self.kill_leaked_servers();
            self.state = ScenarioState::Failed;
        }

        let remove = if self.state == ScenarioState::Verified {
            self.config.cleanup_on_success
        } else {
            self.config.cleanup_on_failure
        };
        self.logger.print_summary();

        if remove {
            if let Err(err) = std::fs::remove_dir_all(&self.dir) {
                self.logger
                    .warn(format!("failed to remove scenario directory: {err}"));
            }
        } else {
            self.logger.info(format!(
                "preserving scenario directory for inspection: {}",
                self.dir.display()
            ));
        }
    }
}

impl Drop for Scenario {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Builder for a [`Scenario`] with configuration overrides.
pub struct ScenarioBuilder {
    name: String,
    config: HarnessConfig,
}

impl ScenarioBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            config: HarnessConfig::default(),
        }
    }

    /// Start from `DBRACE_*` environment overrides.
    pub fn from_env(name: &str) -> HarnessResult<Self> {
        Ok(Self {
            name: name.to_string(),
            config: HarnessConfig::from_env()?,
        })
    }

    pub fn config(mut self, config: HarnessConfig) -> Self {
        self.config = config;
        self
    }

    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.temp_dir = dir.into();
        self
    }

    pub fn server_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.server_binary = path.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.config.startup_timeout = timeout;
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout = timeout;
        self
    }

    pub fn session_ready_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_ready_timeout = timeout;
        self
    }

    pub fn interrupt_exit_code(mut self, code: i32) -> Self {
        self.config.interrupt_exit_code = code;
        self
    }

    /// Keep the scenario directory regardless of outcome.
    pub fn keep_artifacts(mut self) -> Self {
        self.config.cleanup_on_success = false;
        self.config.cleanup_on_failure = false;
        self
    }

    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> HarnessResult<Scenario> {
        Scenario::new(&self.name, self.config)
    }

    pub fn run<F>(self, body: F) -> ScenarioReport
    where
        F: FnOnce(&mut Scenario) -> HarnessResult<()>,
    {
        Scenario::run(&self.name, self.config, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> HarnessConfig {
        HarnessConfig {
            temp_dir: dir.to_path_buf(),
            server_binary: PathBuf::from("/bin/true"),
            ..HarnessConfig::default()
        }
    }

    #[test]
    fn test_run_verified_cleans_up() {
        let base = tempfile::tempdir().unwrap();
        let report = Scenario::run("verified_run", config_in(base.path()), |scenario| {
            scenario.mark_running()?;
            scenario.verifier().assert_eq(&1, &1, "trivial")?;
            scenario.mark_teardown()
        });

        assert!(report.is_verified());
        assert_eq!(report.assertions_passed, 1);
        assert!(report.failure().is_none());
        assert!(!report.dir.as_ref().unwrap().exists());
    }

    #[test]
    fn test_run_failure_preserves_directory() {
        let base = tempfile::tempdir().unwrap();
        let report = Scenario::run("failed_run", config_in(base.path()), |scenario| {
            scenario.mark_running()?;
            scenario.verifier().assert_eq(&3u64, &0u64, "race count")
        });

        assert_eq!(report.state, ScenarioState::Failed);
        assert_eq!(report.assertions_failed, 1);
        assert!(report.failure().unwrap().contains("race count"));
        let dir = report.dir.clone().unwrap();
        assert!(dir.exists());
        let artifact = report
            .artifacts
            .iter()
            .find(|p| p.to_string_lossy().contains("scenario-report"))
            .unwrap();
        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(artifact).unwrap()).unwrap();
        assert_eq!(saved["error_code"], "DBR-E300");
        assert!(!saved["remediation"].as_array().unwrap().is_empty());
        assert!(matches!(
            report.into_result(),
            Err(HarnessError::AssertionFailure { .. })
        ));
    }

    #[test]
    fn test_state_machine_rejects_backwards_transition() {
        let base = tempfile::tempdir().unwrap();
        let mut scenario = Scenario::new("state_machine", config_in(base.path())).unwrap();
        assert_eq!(scenario.state(), ScenarioState::Setup);
        scenario.mark_running().unwrap();
        scenario.mark_teardown().unwrap();
        assert!(matches!(
            scenario.mark_running(),
            Err(HarnessError::InvalidState { .. })
        ));
        assert_eq!(scenario.finish(None), ScenarioState::Verified);
        assert_eq!(
            scenario.finish(Some(&HarnessError::Timeout(Duration::from_secs(1)))),
            ScenarioState::Verified
        );
    }

    #[test]
    fn test_data_dir_is_scoped_to_scenario() {
        let base = tempfile::tempdir().unwrap();
        let scenario = ScenarioBuilder::new("data_dirs")
            .config(config_in(base.path()))
            .keep_artifacts()
            .build()
            .unwrap();
        let durable = scenario.data_dir("dur").unwrap();
        let plain = scenario.data_dir("nodur").unwrap();
        assert_ne!(durable, plain);
        assert!(durable.starts_with(scenario.dir()));
        assert!(durable.parent().unwrap().is_dir());
    }

    #[test]
    fn test_cleanup_stale_scenarios_keeps_fresh_dirs() {
        let base = tempfile::tempdir().unwrap();
        std::fs::create_dir(base.path().join("fresh")).unwrap();
        assert_eq!(cleanup_stale_scenarios(base.path(), STALE_SCENARIO_AGE), 0);
        assert_eq!(cleanup_stale_scenarios(base.path(), Duration::ZERO), 1);
        let missing = base.path().join("missing");
        assert_eq!(cleanup_stale_scenarios(&missing, Duration::ZERO), 0);
    }

    #[test]
    fn test_invalid_config_fails_setup() {
        let base = tempfile::tempdir().unwrap();
        let mut config = config_in(base.path());
        config.stop_timeout = Duration::ZERO;
        let report = Scenario::run("bad_config", config, |_| Ok(()));
        assert_eq!(report.state, ScenarioState::Failed);
        assert!(report.dir.is_none());
    }
}
