//! Harness configuration.
//!
//! Values resolve in three layers: built-in defaults, an optional TOML file,
//! then `DBRACE_*` environment variables. Code can override any field through
//! [`crate::harness::scenario::ScenarioBuilder`].

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::errors::{HarnessError, HarnessResult};

/// Name of the fixture server binary built by this workspace.
pub const DEFAULT_SERVER_BINARY: &str = "dbrace-stubd";

/// Exit code a server reports when it was terminated by an interrupt.
pub const DEFAULT_INTERRUPT_EXIT_CODE: i32 = 12;

/// Configuration for a scenario harness
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Base temporary directory for scenario directories
    pub temp_dir: PathBuf,
    /// Server executable launched by the lifecycle manager
    pub server_binary: PathBuf,
    /// Host the harness connects to
    pub host: String,
    /// How long `start` waits for the port to accept connections
    pub startup_timeout: Duration,
    /// How long `stop` waits before escalating to a kill
    pub stop_timeout: Duration,
    /// How long `launch` waits for a session to connect
    pub session_ready_timeout: Duration,
    /// Exit code meaning "terminated on interrupt"
    pub interrupt_exit_code: i32,
    /// Whether to remove the scenario directory on success
    pub cleanup_on_success: bool,
    /// Whether to remove the scenario directory on failure
    pub cleanup_on_failure: bool,
    /// Environment variables set for every server process
    pub env_vars: HashMap<String, String>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("dbrace_scenarios"),
            server_binary: default_server_binary(),
            host: "127.0.0.1".to_string(),
            startup_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(10),
            session_ready_timeout: Duration::from_secs(5),
            interrupt_exit_code: DEFAULT_INTERRUPT_EXIT_CODE,
            cleanup_on_success: true,
            cleanup_on_failure: false,
            env_vars: HashMap::new(),
        }
    }
}

/// On-disk form of [`HarnessConfig`]. Durations use humantime strings.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct HarnessConfigFile {
    temp_dir: Option<PathBuf>,
    server_binary: Option<PathBuf>,
    host: Option<String>,
    startup_timeout: Option<String>,
    stop_timeout: Option<String>,
    session_ready_timeout: Option<String>,
    interrupt_exit_code: Option<i32>,
    cleanup_on_success: Option<bool>,
    cleanup_on_failure: Option<bool>,
    env_vars: HashMap<String, String>,
}

impl HarnessConfig {
    /// Defaults with `DBRACE_*` overrides applied.
    pub fn from_env() -> HarnessResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults. Environment is not consulted.
    pub fn from_toml_str(text: &str) -> HarnessResult<Self> {
        let file: HarnessConfigFile = toml::from_str(text)
            .map_err(|e| HarnessError::Config(format!("invalid harness config: {e}")))?;
        let mut config = Self::default();
        config.merge_file(file)?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides on top.
    pub fn from_toml_file(path: impl AsRef<Path>) -> HarnessResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env()?;
        Ok(config)
    }

    fn merge_file(&mut self, file: HarnessConfigFile) -> HarnessResult<()> {
        fn duration(key: &str, value: Option<String>) -> HarnessResult<Option<Duration>> {
            value
                .map(|v| {
                    env::parse_duration(&v)
                        .map_err(|reason| HarnessError::Config(format!("{key} = {v:?}: {reason}")))
                })
                .transpose()
        }

        if let Some(dir) = file.temp_dir {
            self.temp_dir = dir;
        }
        if let Some(bin) = file.server_binary {
            self.server_binary = bin;
        }
        if let Some(host) = file.host {
            self.host = host;
        }
        if let Some(d) = duration("startup_timeout", file.startup_timeout)? {
            self.startup_timeout = d;
        }
        if let Some(d) = duration("stop_timeout", file.stop_timeout)? {
            self.stop_timeout = d;
        }
        if let Some(d) = duration("session_ready_timeout", file.session_ready_timeout)? {
            self.session_ready_timeout = d;
        }
        if let Some(code) = file.interrupt_exit_code {
            self.interrupt_exit_code = code;
        }
        if let Some(flag) = file.cleanup_on_success {
            self.cleanup_on_success = flag;
        }
        if let Some(flag) = file.cleanup_on_failure {
            self.cleanup_on_failure = flag;
        }
        self.env_vars.extend(file.env_vars);
        Ok(())
    }

    /// Apply `DBRACE_*` environment overrides. All parse errors are reported together.
    pub fn apply_env(&mut self) -> HarnessResult<()> {
        let mut parser = EnvParser::new();

        let bin = parser.get_path("SERVER_BIN", self.server_binary.clone(), false);
        let host = parser.get_string("HOST", &self.host);
        let startup = parser.get_duration("STARTUP_TIMEOUT", self.startup_timeout);
        let stop = parser.get_duration("STOP_TIMEOUT", self.stop_timeout);
        let ready = parser.get_duration("SESSION_READY_TIMEOUT", self.session_ready_timeout);
        let interrupt =
            parser.get_i32_range("INTERRUPT_EXIT_CODE", self.interrupt_exit_code, 0, 255);
        let keep = parser.get_bool("KEEP_ARTIFACTS", false);
        let temp = parser.get_path("TEMP_DIR", self.temp_dir.clone(), false);

        if parser.has_errors() {
            let joined = parser
                .take_errors()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(HarnessError::Config(joined));
        }

        self.server_binary = bin.value;
        self.host = host.value;
        self.startup_timeout = startup.value;
        self.stop_timeout = stop.value;
        self.session_ready_timeout = ready.value;
        self.interrupt_exit_code = interrupt.value;
        self.temp_dir = temp.value;
        if keep.is_set() && keep.value {
            self.cleanup_on_success = false;
            self.cleanup_on_failure = false;
        }
        Ok(())
    }

    /// Fail early when the server binary cannot be launched.
    pub fn validate(&self) -> HarnessResult<()> {
        if !self.server_binary.is_file() {
            return Err(HarnessError::Config(format!(
                "server binary not found at {} (set DBRACE_SERVER_BIN)",
                self.server_binary.display()
            )));
        }
        if self.startup_timeout.is_zero() || self.stop_timeout.is_zero() {
            return Err(HarnessError::Config(
                "startup_timeout and stop_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolve the fixture server binary.
///
/// `CARGO_BIN_EXE_dbrace-stubd` wins when cargo provides it, otherwise
/// `target/<profile>/dbrace-stubd` under the workspace root.
fn default_server_binary() -> PathBuf {
    let key = format!("CARGO_BIN_EXE_{DEFAULT_SERVER_BINARY}");
    if let Ok(value) = std::env::var(&key) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    // Processes are spawned with `current_dir` set to the scenario directory,
    // so the path must be absolute.
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(env!("CARGO_MANIFEST_DIR")));
    let manifest_dir = manifest_dir.canonicalize().unwrap_or(manifest_dir);
    let workspace_root = manifest_dir
        .parent()
        .unwrap_or(manifest_dir.as_path())
        .to_path_buf();
    let cargo_target = std::env::var("CARGO_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| workspace_root.join("target"));
    let cargo_target = if cargo_target.is_absolute() {
        cargo_target
    } else {
        workspace_root.join(cargo_target)
    };

    let profile = if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    };
    cargo_target.join(profile).join(DEFAULT_SERVER_BINARY)
}
