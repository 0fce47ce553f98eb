//! Environment variable parsing with type safety.
//!
//! Every harness knob can be overridden through a `DBRACE_*` variable.
//! Parse errors are collected so all of them can be reported at once.

use super::source::{ConfigSource, Sourced};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Path does not exist.
    #[error("Path not found for {var}: {}", .path.display())]
    PathNotFound { var: String, path: PathBuf },

    /// Invalid duration format.
    #[error("Invalid duration for {var}: {value} ({reason})")]
    InvalidDuration {
        var: String,
        value: String,
        reason: String,
    },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    /// Invalid log level.
    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

/// Type-safe environment variable parser.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a new parser with the `DBRACE_` prefix.
    pub fn new() -> Self {
        Self::with_prefix("DBRACE_")
    }

    pub fn with_prefix(prefix: &'static str) -> Self {
        Self {
            prefix,
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Get a string value with default.
    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => Sourced::from_env(value, var_name),
            Err(_) => Sourced::default_value(default.to_string()),
        }
    }

    /// Get an optional string (None if not set or empty).
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) if value.is_empty() => Sourced::from_env(None, var_name),
            Ok(value) => Sourced::from_env(Some(value), var_name),
            Err(_) => Sourced::default_value(None),
        }
    }

    /// Get a boolean value with default.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let parsed = match value.to_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => true,
                    "0" | "false" | "no" | "off" | "" => false,
                    _ => {
                        self.errors.push(EnvError::InvalidValue {
                            var: var_name.clone(),
                            expected: "boolean (true/false/1/0/yes/no)".to_string(),
                            value: value.clone(),
                        });
                        default
                    }
                };
                Sourced::from_env(parsed, var_name)
            }
            Err(_) => Sourced::default_value(default),
        }
    }

    /// Get an i32 value with default and range validation.
    pub fn get_i32_range(&mut self, name: &str, default: i32, min: i32, max: i32) -> Sourced<i32> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.trim().parse::<i32>() {
                Ok(n) if n >= min && n <= max => Sourced::from_env(n, var_name),
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name.clone(),
                        value: n.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    Sourced::from_env(default, var_name)
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name.clone(),
                        expected: "signed 32-bit integer".to_string(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            Err(_) => Sourced::default_value(default),
        }
    }

    /// Get a duration written in humantime form (`250ms`, `10s`, `1m 30s`).
    ///
    /// A bare integer is read as milliseconds.
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match parse_duration(&value) {
                Ok(duration) => Sourced::from_env(duration, var_name),
                Err(reason) => {
                    self.errors.push(EnvError::InvalidDuration {
                        var: var_name.clone(),
                        value,
                        reason,
                    });
                    Sourced::default_value(default)
                }
            },
            Err(_) => Sourced::default_value(default),
        }
    }

    /// Get a path value with ~ expansion.
    ///
    /// If `must_exist` is true, records an error if the path doesn't exist.
    pub fn get_path(&mut self, name: &str, default: PathBuf, must_exist: bool) -> Sourced<PathBuf> {
        let var_name = self.var_name(name);
        let (path, source) = match env::var(&var_name) {
            Ok(v) if !v.trim().is_empty() => (expand_home(v.trim()), ConfigSource::Environment),
            _ => (default, ConfigSource::Default),
        };

        if must_exist && !path.exists() {
            self.errors.push(EnvError::PathNotFound {
                var: var_name.clone(),
                path: path.clone(),
            });
        }

        if source == ConfigSource::Environment {
            Sourced::from_env(path, var_name)
        } else {
            Sourced::default_value(path)
        }
    }

    /// Get a log level value with validation.
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let lower = value.to_lowercase();
                match lower.as_str() {
                    "trace" | "debug" | "info" | "warn" | "error" | "off" => {
                        Sourced::from_env(lower, var_name)
                    }
                    _ => {
                        self.errors.push(EnvError::InvalidLogLevel {
                            var: var_name.clone(),
                            value: value.clone(),
                        });
                        Sourced::from_env(default.to_string(), var_name)
                    }
                }
            }
            Err(_) => Sourced::default_value(default.to_string()),
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a humantime duration, treating a bare integer as milliseconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let trimmed = value.trim();
    if let Ok(millis) = trimmed.parse::<u64>() {
        return Ok(Duration::from_millis(millis));
    }
    humantime::parse_duration(trimmed).map_err(|e| e.to_string())
}

fn expand_home(value: &str) -> PathBuf {
    if let Some(stripped) = value.strip_prefix("~/")
        && let Some(home) = env::var_os("HOME")
    {
        return PathBuf::from(home).join(stripped);
    }
    PathBuf::from(value)
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: env-mutating tests are serialized
            unsafe { env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: env-mutating tests are serialized
        unsafe { env::set_var(key, value) };
    }

    #[test]
    #[serial(dbrace_env)]
    fn test_get_bool_true_values() {
        let vars = ["DBRACE_TEST_BOOL_TRUE"];
        cleanup_env(&vars);

        for val in &["1", "true", "yes", "on", "TRUE", "Yes"] {
            set_env("DBRACE_TEST_BOOL_TRUE", val);
            let mut parser = EnvParser::new();
            let result = parser.get_bool("TEST_BOOL_TRUE", false);
            assert!(result.value, "Expected true for '{}'", val);
            assert!(!parser.has_errors());
        }

        cleanup_env(&vars);
    }

    #[test]
    #[serial(dbrace_env)]
    fn test_get_bool_invalid_uses_default() {
        let vars = ["DBRACE_BAD_BOOL"];
        cleanup_env(&vars);

        set_env("DBRACE_BAD_BOOL", "maybe");
        let mut parser = EnvParser::new();
        let result = parser.get_bool("BAD_BOOL", false);
        assert!(!result.value);
        assert!(parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    #[serial(dbrace_env)]
    fn test_get_duration_humantime_and_millis() {
        let vars = ["DBRACE_TEST_DUR"];
        cleanup_env(&vars);

        set_env("DBRACE_TEST_DUR", "1500ms");
        let mut parser = EnvParser::new();
        let result = parser.get_duration("TEST_DUR", Duration::from_secs(1));
        assert_eq!(result.value, Duration::from_millis(1500));
        assert_eq!(result.source, ConfigSource::Environment);

        set_env("DBRACE_TEST_DUR", "250");
        let result = parser.get_duration("TEST_DUR", Duration::from_secs(1));
        assert_eq!(result.value, Duration::from_millis(250));
        assert!(!parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    #[serial(dbrace_env)]
    fn test_get_duration_invalid_keeps_default() {
        let vars = ["DBRACE_TEST_BAD_DUR"];
        cleanup_env(&vars);

        set_env("DBRACE_TEST_BAD_DUR", "soon");
        let mut parser = EnvParser::new();
        let result = parser.get_duration("TEST_BAD_DUR", Duration::from_secs(7));
        assert_eq!(result.value, Duration::from_secs(7));
        assert!(matches!(
            parser.errors()[0],
            EnvError::InvalidDuration { .. }
        ));

        cleanup_env(&vars);
    }

    #[test]
    #[serial(dbrace_env)]
    fn test_get_i32_out_of_range() {
        let vars = ["DBRACE_TEST_I32"];
        cleanup_env(&vars);

        set_env("DBRACE_TEST_I32", "300");
        let mut parser = EnvParser::new();
        let result = parser.get_i32_range("TEST_I32", 12, 0, 255);
        assert_eq!(result.value, 12);
        assert!(matches!(parser.errors()[0], EnvError::OutOfRange { .. }));

        cleanup_env(&vars);
    }

    #[test]
    #[serial(dbrace_env)]
    fn test_get_path_missing_is_recorded() {
        let vars = ["DBRACE_TEST_PATH"];
        cleanup_env(&vars);

        set_env("DBRACE_TEST_PATH", "/definitely/not/here/dbrace");
        let mut parser = EnvParser::new();
        let result = parser.get_path("TEST_PATH", PathBuf::from("/tmp"), true);
        assert_eq!(result.value, PathBuf::from("/definitely/not/here/dbrace"));
        assert_eq!(parser.take_errors().len(), 1);
        assert!(!parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    #[serial(dbrace_env)]
    fn test_unset_values_are_defaults() {
        let vars = ["DBRACE_TEST_UNSET"];
        cleanup_env(&vars);

        let mut parser = EnvParser::new();
        let result = parser.get_string("TEST_UNSET", "fallback");
        assert_eq!(result.value, "fallback");
        assert!(!result.is_set());
        assert!(parser.get_optional_string("TEST_UNSET").value.is_none());
    }
}
