//! Global `tracing` setup for tests.
//!
//! Call [`init_global_test_logging`] once per test binary, typically from a
//! `#[ctor::ctor]` function:
//!
//! ```ignore
//! #[ctor::ctor]
//! fn setup() {
//!     dbrace_common::testing::init_global_test_logging();
//! }
//! ```

use std::path::PathBuf;
use std::sync::{Mutex, Once};

use crate::config::env::EnvParser;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

static GLOBAL_LOGGING_INIT: Once = Once::new();

/// Install a global subscriber writing JSONL to `target/test-logs/all_tests.jsonl`
/// and compact lines to the test writer.
///
/// Safe to call multiple times.
///
/// # Environment Variables
///
/// - `DBRACE_TEST_LOG_FILE`: override the JSONL path
/// - `DBRACE_TEST_LOG_LEVEL`: level for dbrace crates (default: `info`)
pub fn init_global_test_logging() {
    GLOBAL_LOGGING_INIT.call_once(|| {
        let mut env = EnvParser::with_prefix("DBRACE_TEST_");
        let level = env.get_log_level("LOG_LEVEL", "info").value;
        let log_file = env.get_optional_string("LOG_FILE").value;

        let file_layer = create_global_log_file(log_file).map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
        });

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .with_level(true)
            .compact();

        let filter = tracing_subscriber::EnvFilter::try_new(test_log_directives(&level))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stderr_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Filter directives for the dbrace crates at `level`.
fn test_log_directives(level: &str) -> String {
    format!("dbrace_common={level},dbrace_stubd={level}")
}

fn create_global_log_file(custom_path: Option<String>) -> Option<std::fs::File> {
    if let Some(custom_path) = custom_path {
        if let Some(parent) = PathBuf::from(&custom_path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        return std::fs::File::create(&custom_path).ok();
    }

    let log_dir = find_target_dir().join("test-logs");
    let _ = std::fs::create_dir_all(&log_dir);
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("all_tests.jsonl"))
        .ok()
}

/// `CARGO_TARGET_DIR`, else the nearest `target/` above the current directory.
fn find_target_dir() -> PathBuf {
    if let Ok(target_dir) = std::env::var("CARGO_TARGET_DIR") {
        return PathBuf::from(target_dir);
    }

    let mut cwd = std::env::current_dir().unwrap_or_default();
    loop {
        let target = cwd.join("target");
        if target.is_dir() {
            return target;
        }
        if !cwd.pop() {
            return PathBuf::from("target");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial(dbrace_env)]
    #[allow(unsafe_code)]
    fn test_log_level_is_validated_before_filtering() {
        // SAFETY: env-mutating tests are serialized
        unsafe { std::env::set_var("DBRACE_TEST_LOG_LEVEL", "LOUD") };
        let mut env = EnvParser::with_prefix("DBRACE_TEST_");
        let level = env.get_log_level("LOG_LEVEL", "info").value;
        assert_eq!(level, "info");
        assert!(env.has_errors());

        // SAFETY: env-mutating tests are serialized
        unsafe { std::env::set_var("DBRACE_TEST_LOG_LEVEL", "DEBUG") };
        let mut env = EnvParser::with_prefix("DBRACE_TEST_");
        let level = env.get_log_level("LOG_LEVEL", "info").value;
        assert_eq!(
            test_log_directives(&level),
            "dbrace_common=debug,dbrace_stubd=debug"
        );
        assert!(tracing_subscriber::EnvFilter::try_new(test_log_directives(&level)).is_ok());

        // SAFETY: env-mutating tests are serialized
        unsafe { std::env::remove_var("DBRACE_TEST_LOG_LEVEL") };
    }

    #[test]
    #[serial(dbrace_env)]
    #[allow(unsafe_code)]
    fn test_empty_log_file_falls_back_to_target_dir() {
        // SAFETY: env-mutating tests are serialized
        unsafe { std::env::set_var("DBRACE_TEST_LOG_FILE", "") };
        let mut env = EnvParser::with_prefix("DBRACE_TEST_");
        let log_file = env.get_optional_string("LOG_FILE");
        assert!(log_file.is_set());
        assert!(log_file.value.is_none());

        // SAFETY: env-mutating tests are serialized
        unsafe { std::env::remove_var("DBRACE_TEST_LOG_FILE") };
    }

    #[test]
    fn test_init_is_idempotent() {
        init_global_test_logging();
        init_global_test_logging();
        tracing::info!(check = "twice", "global logging initialized");
    }
}
