//! Scenario logging.
//!
//! - Real-time console output (human-readable)
//! - Per-scenario JSONL log files (machine-readable)
//! - A second JSONL stream of phase events with a stable schema
//! - Artifact capture for diffs, listings and stop statuses

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Walk up from `start` to the directory whose Cargo.toml declares `[workspace]`.
pub(crate) fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    let mut candidate = start.to_path_buf();
    if candidate.is_file() {
        candidate = candidate.parent()?.to_path_buf();
    }

    loop {
        let cargo_toml = candidate.join("Cargo.toml");
        if let Ok(contents) = fs::read_to_string(&cargo_toml)
            && contents.contains("[workspace]")
        {
            return Some(candidate);
        }
        match candidate.parent() {
            Some(parent) if parent != candidate => candidate = parent.to_path_buf(),
            _ => break,
        }
    }

    start.parent().map(|p| p.to_path_buf())
}

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

impl LogLevel {
    /// Returns the ANSI color code for this log level
    pub fn color_code(&self) -> &'static str {
        match self {
            LogLevel::Trace => "\x1b[90m",
            LogLevel::Debug => "\x1b[36m",
            LogLevel::Info => "\x1b[32m",
            LogLevel::Warn => "\x1b[33m",
            LogLevel::Error => "\x1b[31m",
        }
    }
}

/// Where a log entry came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    /// The harness itself
    Harness,
    /// A server instance, by port
    Server { port: u16 },
    /// A parallel session, by id
    Session { id: String },
    /// The verification layer
    Verifier,
    Custom(String),
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::Harness => write!(f, "harness"),
            LogSource::Server { port } => write!(f, "server:{port}"),
            LogSource::Session { id } => write!(f, "session:{id}"),
            LogSource::Verifier => write!(f, "verifier"),
            LogSource::Custom(s) => write!(f, "{s}"),
        }
    }
}

/// A single log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    /// Elapsed time since the logger was created
    pub elapsed_ms: u64,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<(String, String)>,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:>6}ms] [{:<5}] [{}] {}",
            self.elapsed_ms, self.level, self.source, self.message
        )?;
        if !self.context.is_empty() {
            write!(f, " {{")?;
            for (i, (k, v)) in self.context.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{k}={v}")?;
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}

impl LogEntry {
    /// Format the log entry with ANSI colors
    pub fn format_colored(&self) -> String {
        let reset = "\x1b[0m";
        let color = self.level.color_code();
        let dim = "\x1b[2m";

        let ctx = if self.context.is_empty() {
            String::new()
        } else {
            let pairs: Vec<_> = self
                .context
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            format!(" {dim}{{{}}}{reset}", pairs.join(", "))
        };

        format!(
            "{dim}[{:>6}ms]{reset} {color}[{:<5}]{reset} {dim}[{}]{reset} {}{ctx}",
            self.elapsed_ms, self.level, self.source, self.message
        )
    }
}

/// Stable schema version for phase events.
pub const PHASE_EVENT_SCHEMA_VERSION: &str = "1.0.0";

/// Scenario phase a structured event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioPhase {
    Setup,
    Running,
    Teardown,
    Verify,
}

impl fmt::Display for ScenarioPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Self::Setup => "setup",
            Self::Running => "running",
            Self::Teardown => "teardown",
            Self::Verify => "verify",
        };
        write!(f, "{phase}")
    }
}

/// Context payload attached to each phase event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseContext {
    pub decision_code: String,
    pub port: Option<u16>,
    pub session: Option<String>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub observed: Option<String>,
    pub expected: Option<String>,
}

impl PhaseContext {
    pub fn decision_only(decision_code: impl Into<String>) -> Self {
        Self {
            decision_code: decision_code.into(),
            ..Self::default()
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn values(mut self, observed: impl Into<String>, expected: impl Into<String>) -> Self {
        self.observed = Some(observed.into());
        self.expected = Some(expected.into());
        self
    }
}

/// Machine-readable phase event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub schema_version: String,
    pub timestamp: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub level: LogLevel,
    pub phase: ScenarioPhase,
    pub scenario_id: String,
    pub message: String,
    pub context: PhaseContext,
    pub artifact_paths: Vec<String>,
}

/// Input for emitting a phase event.
#[derive(Debug, Clone)]
pub struct PhaseEventInput {
    pub level: LogLevel,
    pub phase: ScenarioPhase,
    pub message: String,
    pub context: PhaseContext,
    pub artifact_paths: Vec<String>,
}

impl PhaseEventInput {
    pub fn new(phase: ScenarioPhase, message: impl Into<String>, context: PhaseContext) -> Self {
        Self {
            level: LogLevel::Info,
            phase,
            message: message.into(),
            context,
            artifact_paths: Vec::new(),
        }
    }

    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn artifact(mut self, path: &Path) -> Self {
        self.artifact_paths.push(path.display().to_string());
        self
    }
}

/// Configuration for the logger
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub min_level: LogLevel,
    /// Whether to print logs to stdout in real-time
    pub print_realtime: bool,
    pub use_colors: bool,
    /// Maximum number of entries kept in memory (0 = unlimited)
    pub max_entries: usize,
    /// Directory for persisting logs
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Debug,
            print_realtime: true,
            use_colors: true,
            max_entries: 10_000,
            log_dir: None,
        }
    }
}

/// Thread-safe logger shared by every component of a scenario
#[derive(Clone)]
pub struct TestLogger {
    config: Arc<RwLock<LoggerConfig>>,
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    start_time: Instant,
    scenario: Arc<String>,
    file_writer: Arc<Mutex<Option<BufWriter<File>>>>,
    phase_writer: Arc<Mutex<Option<BufWriter<File>>>>,
    phase_log_path: Arc<Option<PathBuf>>,
    artifact_root: Arc<Option<PathBuf>>,
}

impl fmt::Debug for TestLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestLogger")
            .field("scenario", &self.scenario)
            .finish_non_exhaustive()
    }
}

impl TestLogger {
    pub fn new(scenario: &str, config: LoggerConfig) -> Self {
        let mut file_writer = None;
        let mut phase_writer = None;
        let mut phase_log_path = None;
        let mut artifact_root = None;

        if let Some(ref dir) = config.log_dir
            && fs::create_dir_all(dir).is_ok()
        {
            let name = sanitize_component(scenario);
            let timestamp = Utc::now().format("%Y%m%d_%H%M%S");

            let log_path = dir.join(format!("{name}_{timestamp}.jsonl"));
            match File::create(&log_path) {
                Ok(file) => file_writer = Some(BufWriter::new(file)),
                Err(error) => {
                    eprintln!(
                        "Warning: Failed to create log file {}: {error}",
                        log_path.display()
                    );
                }
            }

            let phase_path = dir.join(format!("phases_{name}_{timestamp}.jsonl"));
            match File::create(&phase_path) {
                Ok(file) => {
                    phase_writer = Some(BufWriter::new(file));
                    phase_log_path = Some(phase_path);
                }
                Err(error) => {
                    eprintln!(
                        "Warning: Failed to create phase log file {}: {error}",
                        phase_path.display()
                    );
                }
            }

            let artifacts_dir = dir.join("artifacts");
            if fs::create_dir_all(&artifacts_dir).is_ok() {
                artifact_root = Some(artifacts_dir);
            }
        }

        Self {
            config: Arc::new(RwLock::new(config)),
            entries: Arc::new(Mutex::new(VecDeque::new())),
            start_time: Instant::now(),
            scenario: Arc::new(scenario.to_string()),
            file_writer: Arc::new(Mutex::new(file_writer)),
            phase_writer: Arc::new(Mutex::new(phase_writer)),
            phase_log_path: Arc::new(phase_log_path),
            artifact_root: Arc::new(artifact_root),
        }
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn log(&self, level: LogLevel, source: LogSource, message: impl Into<String>) {
        self.log_with_context(level, source, message, Vec::new());
    }

    pub fn log_with_context(
        &self,
        level: LogLevel,
        source: LogSource,
        message: impl Into<String>,
        context: Vec<(String, String)>,
    ) {
        let config = self.config.read().unwrap();
        if level < config.min_level {
            return;
        }

        let entry = LogEntry {
            timestamp: Utc::now(),
            elapsed_ms: self.start_time.elapsed().as_millis() as u64,
            level,
            source,
            message: message.into(),
            context,
        };

        if config.print_realtime {
            if config.use_colors {
                println!("{}", entry.format_colored());
            } else {
                println!("{entry}");
            }
        }

        if let Ok(mut writer) = self.file_writer.lock()
            && let Some(ref mut w) = *writer
            && let Ok(json) = serde_json::to_string(&entry)
        {
            let _ = writeln!(w, "{json}");
            let _ = w.flush();
        }

        let mut entries = self.entries.lock().unwrap();
        entries.push_back(entry);
        if config.max_entries > 0 && entries.len() > config.max_entries {
            entries.pop_front();
        }
    }

    pub fn phase_log_path(&self) -> Option<&Path> {
        self.phase_log_path.as_deref()
    }

    /// Emit a structured phase event and mirror it into the regular log.
    pub fn log_phase_event(&self, input: PhaseEventInput) -> PhaseEvent {
        let event = PhaseEvent {
            schema_version: PHASE_EVENT_SCHEMA_VERSION.to_string(),
            timestamp: Utc::now(),
            elapsed_ms: self.start_time.elapsed().as_millis() as u64,
            level: input.level,
            phase: input.phase,
            scenario_id: self.scenario.to_string(),
            message: input.message,
            context: input.context,
            artifact_paths: input.artifact_paths,
        };

        tracing::debug!(
            scenario = %event.scenario_id,
            phase = %event.phase,
            decision_code = %event.context.decision_code,
            "{}",
            event.message
        );

        let mut log_context = vec![
            ("phase".to_string(), event.phase.to_string()),
            (
                "decision_code".to_string(),
                event.context.decision_code.clone(),
            ),
        ];
        if let Some(port) = event.context.port {
            log_context.push(("port".to_string(), port.to_string()));
        }
        if let Some(session) = event.context.session.as_ref() {
            log_context.push(("session".to_string(), session.clone()));
        }
        if let Some(pid) = event.context.pid {
            log_context.push(("pid".to_string(), pid.to_string()));
        }
        if let Some(code) = event.context.exit_code {
            log_context.push(("exit_code".to_string(), code.to_string()));
        }
        if let Some(observed) = event.context.observed.as_ref() {
            log_context.push(("observed".to_string(), observed.clone()));
        }
        if let Some(expected) = event.context.expected.as_ref() {
            log_context.push(("expected".to_string(), expected.clone()));
        }
        if !event.artifact_paths.is_empty() {
            log_context.push(("artifact_paths".to_string(), event.artifact_paths.join(",")));
        }

        let source = if event.phase == ScenarioPhase::Verify {
            LogSource::Verifier
        } else {
            LogSource::Harness
        };
        self.log_with_context(
            event.level,
            source,
            format!("[{}] {}", event.phase, event.message),
            log_context,
        );

        if let Ok(mut writer_guard) = self.phase_writer.lock()
            && let Some(ref mut writer) = *writer_guard
            && let Ok(serialized) = serde_json::to_string(&event)
        {
            let _ = writeln!(writer, "{serialized}");
            let _ = writer.flush();
        }

        event
    }

    /// Shorthand for an info-level phase event.
    pub fn phase(
        &self,
        phase: ScenarioPhase,
        message: impl Into<String>,
        context: PhaseContext,
    ) -> PhaseEvent {
        self.log_phase_event(PhaseEventInput::new(phase, message, context))
    }

    /// Persist a text artifact under `artifacts/<scenario>/`.
    pub fn capture_artifact_text(
        &self,
        artifact_name: &str,
        content: &str,
    ) -> std::io::Result<PathBuf> {
        let path = self.artifact_path(artifact_name, "txt")?;
        fs::write(&path, content)?;
        Ok(path)
    }

    /// Persist a JSON artifact under `artifacts/<scenario>/`.
    pub fn capture_artifact_json<T: Serialize>(
        &self,
        artifact_name: &str,
        value: &T,
    ) -> std::io::Result<PathBuf> {
        let serialized = serde_json::to_string_pretty(value).map_err(|error| {
            std::io::Error::other(format!("failed to serialize artifact json: {error}"))
        })?;
        let path = self.artifact_path(artifact_name, "json")?;
        fs::write(&path, serialized)?;
        Ok(path)
    }

    /// Directory holding this scenario's artifacts, if files are enabled.
    pub fn artifact_dir(&self) -> Option<PathBuf> {
        self.artifact_root
            .as_deref()
            .map(|root| root.join(sanitize_component(&self.scenario)))
    }

    fn artifact_path(&self, artifact_name: &str, extension: &str) -> std::io::Result<PathBuf> {
        let Some(artifact_root) = self.artifact_root.as_deref() else {
            return Err(std::io::Error::other(
                "artifact capture requires logger log_dir to be configured",
            ));
        };
        let scenario_dir = artifact_root.join(sanitize_component(&self.scenario));
        fs::create_dir_all(&scenario_dir)?;
        Ok(scenario_dir.join(format!(
            "{}.{extension}",
            sanitize_component(artifact_name)
        )))
    }

    pub fn trace(&self, message: impl Into<String>) {
        self.log(LogLevel::Trace, LogSource::Harness, message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, LogSource::Harness, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, LogSource::Harness, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, LogSource::Harness, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, LogSource::Harness, message);
    }

    pub fn log_server(&self, port: u16, level: LogLevel, message: impl Into<String>) {
        self.log(level, LogSource::Server { port }, message);
    }

    pub fn log_session(&self, id: &str, level: LogLevel, message: impl Into<String>) {
        self.log(level, LogSource::Session { id: id.to_string() }, message);
    }

    pub fn log_verifier(&self, level: LogLevel, message: impl Into<String>) {
        self.log(level, LogSource::Verifier, message);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    pub fn entries_by_level(&self, min_level: LogLevel) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.level >= min_level)
            .cloned()
            .collect()
    }

    /// Entries whose source renders with the given prefix (`server`, `session:s1`).
    pub fn entries_by_source(&self, source_prefix: &str) -> Vec<LogEntry> {
        let prefix = source_prefix.to_lowercase();
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.source.to_string().to_lowercase().starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Case-insensitive search over messages
    pub fn search(&self, pattern: &str) -> Vec<LogEntry> {
        let pattern_lower = pattern.to_lowercase();
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.message.to_lowercase().contains(&pattern_lower))
            .cloned()
            .collect()
    }

    pub fn has_errors(&self) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.level == LogLevel::Error)
    }

    pub fn error_count(&self) -> usize {
        self.count_level(LogLevel::Error)
    }

    pub fn warn_count(&self) -> usize {
        self.count_level(LogLevel::Warn)
    }

    fn count_level(&self, level: LogLevel) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.level == level)
            .count()
    }

    pub fn summary(&self) -> LogSummary {
        let entries = self.entries.lock().unwrap();
        let mut summary = LogSummary {
            scenario: self.scenario.to_string(),
            total_entries: entries.len(),
            duration_ms: self.elapsed().as_millis() as u64,
            counts_by_level: [
                (LogLevel::Trace, 0),
                (LogLevel::Debug, 0),
                (LogLevel::Info, 0),
                (LogLevel::Warn, 0),
                (LogLevel::Error, 0),
            ]
            .into_iter()
            .collect(),
            first_error: None,
            last_error: None,
        };

        for entry in entries.iter() {
            *summary.counts_by_level.entry(entry.level).or_insert(0) += 1;
            if entry.level == LogLevel::Error {
                if summary.first_error.is_none() {
                    summary.first_error = Some(entry.message.clone());
                }
                summary.last_error = Some(entry.message.clone());
            }
        }

        summary
    }

    /// Print a formatted summary to stdout
    pub fn print_summary(&self) {
        let summary = self.summary();
        println!("\n{}", "=".repeat(60));
        println!("Scenario Log Summary: {}", summary.scenario);
        println!("{}", "=".repeat(60));
        println!("Duration: {}ms", summary.duration_ms);
        println!("Total entries: {}", summary.total_entries);
        for level in [
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ] {
            println!(
                "  {:<6} {}",
                format!("{level}:"),
                summary.counts_by_level.get(&level).unwrap_or(&0)
            );
        }
        if let Some(ref err) = summary.first_error {
            println!("First error: {err}");
        }
        if let Some(ref err) = summary.last_error
            && summary.first_error.as_ref() != Some(err)
        {
            println!("Last error: {err}");
        }
        println!("{}", "=".repeat(60));
    }
}

fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "artifact".to_string()
    } else {
        cleaned
    }
}

/// Summary of a scenario's log
#[derive(Debug, Clone, Serialize)]
pub struct LogSummary {
    pub scenario: String,
    pub total_entries: usize,
    pub duration_ms: u64,
    pub counts_by_level: std::collections::HashMap<LogLevel, usize>,
    pub first_error: Option<String>,
    pub last_error: Option<String>,
}

/// Builder for a TestLogger
pub struct TestLoggerBuilder {
    scenario: String,
    config: LoggerConfig,
}

impl TestLoggerBuilder {
    /// Logs go to `target/test-logs/` under the workspace root unless
    /// [`log_dir`](Self::log_dir) says otherwise.
    pub fn new(scenario: &str) -> Self {
        let config = LoggerConfig {
            log_dir: Self::auto_detect_log_dir(),
            ..Default::default()
        };
        Self {
            scenario: scenario.to_string(),
            config,
        }
    }

    fn auto_detect_log_dir() -> Option<PathBuf> {
        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let workspace_root = find_workspace_root(Path::new(&manifest_dir))?;
            let log_dir = workspace_root.join("target").join("test-logs");
            let _ = fs::create_dir_all(&log_dir);
            return Some(log_dir);
        }
        None
    }

    pub fn min_level(mut self, level: LogLevel) -> Self {
        self.config.min_level = level;
        self
    }

    pub fn print_realtime(mut self, enabled: bool) -> Self {
        self.config.print_realtime = enabled;
        self
    }

    pub fn use_colors(mut self, enabled: bool) -> Self {
        self.config.use_colors = enabled;
        self
    }

    pub fn max_entries(mut self, max: usize) -> Self {
        self.config.max_entries = max;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = Some(dir.into());
        self
    }

    /// Keep everything in memory.
    pub fn no_files(mut self) -> Self {
        self.config.log_dir = None;
        self
    }

    pub fn build(self) -> TestLogger {
        TestLogger::new(&self.scenario, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet(name: &str) -> TestLogger {
        TestLoggerBuilder::new(name)
            .no_files()
            .print_realtime(false)
            .build()
    }

    #[test]
    fn test_log_levels_order() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn test_logger_basic() {
        let logger = quiet("test_basic");

        logger.info("starting server");
        logger.warn("slow checkpoint");
        logger.error("server crashed");

        assert_eq!(logger.entries().len(), 3);
        assert!(logger.has_errors());
        assert_eq!(logger.error_count(), 1);
        assert_eq!(logger.warn_count(), 1);
    }

    #[test]
    fn test_logger_filtering() {
        let logger = TestLoggerBuilder::new("test_filtering")
            .no_files()
            .print_realtime(false)
            .min_level(LogLevel::Info)
            .build();

        logger.trace("trace");
        logger.debug("debug");
        logger.info("info");

        assert_eq!(logger.entries().len(), 1);
    }

    #[test]
    fn test_entries_by_source() {
        let logger = quiet("test_sources");

        logger.log_server(30001, LogLevel::Info, "listening");
        logger.log_session("s1", LogLevel::Info, "connected");
        logger.log_session("s2", LogLevel::Info, "connected");
        logger.log_verifier(LogLevel::Info, "count matched");

        assert_eq!(logger.entries_by_source("server:30001").len(), 1);
        assert_eq!(logger.entries_by_source("session").len(), 2);
        assert_eq!(logger.entries_by_source("verifier").len(), 1);
        assert_eq!(logger.search("CONNECTED").len(), 2);
    }

    #[test]
    fn test_logger_max_entries() {
        let logger = TestLoggerBuilder::new("test_max_entries")
            .no_files()
            .print_realtime(false)
            .max_entries(5)
            .build();

        for i in 0..10 {
            logger.info(format!("Message {i}"));
        }

        let entries = logger.entries();
        assert_eq!(entries.len(), 5);
        assert!(entries[0].message.contains('5'));
        assert!(entries[4].message.contains('9'));
    }

    #[test]
    fn test_logger_summary() {
        let logger = quiet("test_summary");

        logger.debug("Debug 1");
        logger.info("Info 1");
        logger.error("First error");
        logger.error("Last error");

        let summary = logger.summary();
        assert_eq!(summary.scenario, "test_summary");
        assert_eq!(summary.total_entries, 4);
        assert_eq!(summary.counts_by_level.get(&LogLevel::Error), Some(&2));
        assert_eq!(summary.first_error, Some("First error".to_string()));
        assert_eq!(summary.last_error, Some("Last error".to_string()));
    }

    #[test]
    fn test_log_entry_display() {
        let entry = LogEntry {
            timestamp: Utc::now(),
            elapsed_ms: 123,
            level: LogLevel::Info,
            source: LogSource::Server { port: 30001 },
            message: "ready".to_string(),
            context: vec![("pid".to_string(), "42".to_string())],
        };

        let s = entry.to_string();
        assert!(s.contains("123ms"));
        assert!(s.contains("INFO"));
        assert!(s.contains("server:30001"));
        assert!(s.contains("pid=42"));
    }

    #[test]
    fn test_phase_events_written_with_schema() {
        let temp_dir = tempfile::tempdir().unwrap();
        let logger = TestLoggerBuilder::new("phase scenario")
            .log_dir(temp_dir.path())
            .print_realtime(false)
            .build();

        let event = logger.phase(
            ScenarioPhase::Setup,
            "server started",
            PhaseContext::decision_only("SERVER_START")
                .port(30001)
                .pid(7),
        );
        assert_eq!(event.schema_version, PHASE_EVENT_SCHEMA_VERSION);
        assert_eq!(event.scenario_id, "phase scenario");

        let path = logger.phase_log_path().unwrap().to_path_buf();
        drop(logger);
        let contents = fs::read_to_string(path).unwrap();
        let parsed: PhaseEvent = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.phase, ScenarioPhase::Setup);
        assert_eq!(parsed.context.decision_code, "SERVER_START");
        assert_eq!(parsed.context.port, Some(30001));
    }

    #[test]
    fn test_verify_events_use_verifier_source() {
        let logger = quiet("test_verify_source");
        logger.phase(
            ScenarioPhase::Verify,
            "count",
            PhaseContext::decision_only("ASSERT_EQ_PASS"),
        );
        assert_eq!(logger.entries()[0].source, LogSource::Verifier);
    }

    #[test]
    fn test_artifact_capture_layout() {
        let temp_dir = tempfile::tempdir().unwrap();
        let logger = TestLoggerBuilder::new("durability quick")
            .log_dir(temp_dir.path())
            .print_realtime(false)
            .build();

        let path = logger
            .capture_artifact_text("diff test.0", "-1: a\n+1: b\n")
            .unwrap();
        assert!(path.ends_with("artifacts/durability_quick/diff_test.0.txt"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "-1: a\n+1: b\n");

        let json = logger
            .capture_artifact_json("stop", &serde_json::json!({"code": 12}))
            .unwrap();
        assert!(json.extension().is_some_and(|e| e == "json"));
    }

    #[test]
    fn test_artifact_capture_requires_log_dir() {
        let logger = quiet("no_dir");
        assert!(logger.capture_artifact_text("x", "y").is_err());
    }
}
