//! Error Catalog for dbrace
//!
//! Every harness failure maps onto a stable code so that scenario logs can be
//! grepped and compared across runs without parsing free-form messages.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                                   |
//! |------------|-------------|-----------------------------------------------|
//! | E001-E099  | Config      | Harness configuration and environment         |
//! | E100-E199  | Lifecycle   | Server start/stop/restart                     |
//! | E200-E299  | Session     | Parallel sessions and client connections      |
//! | E300-E399  | Verify      | Assertions and artifact inspection            |
//! | E500-E599  | Internal    | IO, protocol and unexpected failures          |
//!
//! # Example
//!
//! ```rust
//! use dbrace_common::errors::catalog::ErrorCode;
//!
//! let entry = ErrorCode::PortInUse.entry();
//! println!("{}", entry.format_full());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering every harness failure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// Configuration value could not be parsed
    ConfigInvalid,
    /// Server binary could not be found or executed
    ConfigServerBinary,

    // =========================================================================
    // Lifecycle Errors (E100-E199)
    // =========================================================================
    /// Server never became reachable
    StartupTimeout,
    /// Port already bound by another instance
    PortInUse,
    /// Data directory already owned by a running instance
    DataDirectoryInUse,
    /// Operation attempted in an incompatible lifecycle state
    InvalidState,
    /// Process terminated without being asked to
    UnexpectedCrash,
    /// Process could not be spawned
    ProcessStartFailed,

    // =========================================================================
    // Session Errors (E200-E299)
    // =========================================================================
    /// Session handle joined a second time
    AlreadyJoined,
    /// Join had to be resolved by killing the dependent server
    SessionHung,
    /// Session thread panicked
    SessionPanicked,
    /// Could not open a client connection
    ConnectFailed,
    /// Connection closed while an operation was in flight
    ConnectionClosed,
    /// Server rejected an operation
    ServerError,

    // =========================================================================
    // Verify Errors (E300-E399)
    // =========================================================================
    /// Observed value differs from expected value
    AssertionFailure,

    // =========================================================================
    // Internal Errors (E500-E599)
    // =========================================================================
    /// Filesystem or socket IO failed
    Io,
    /// Malformed wire message
    Protocol,
    /// Bounded wait elapsed
    Timeout,
}

impl ErrorCode {
    /// Returns the numeric part of the error code.
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            Self::ConfigInvalid => 1,
            Self::ConfigServerBinary => 2,

            Self::StartupTimeout => 100,
            Self::PortInUse => 101,
            Self::DataDirectoryInUse => 102,
            Self::InvalidState => 103,
            Self::UnexpectedCrash => 104,
            Self::ProcessStartFailed => 105,

            Self::AlreadyJoined => 200,
            Self::SessionHung => 201,
            Self::SessionPanicked => 202,
            Self::ConnectFailed => 203,
            Self::ConnectionClosed => 204,
            Self::ServerError => 205,

            Self::AssertionFailure => 300,

            Self::Io => 500,
            Self::Protocol => 501,
            Self::Timeout => 502,
        }
    }

    /// Returns the formatted code (e.g., "DBR-E101").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("DBR-E{:03}", self.code_number())
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Lifecycle,
            200..=299 => ErrorCategory::Session,
            300..=399 => ErrorCategory::Verify,
            _ => ErrorCategory::Internal,
        }
    }

    /// Returns the full error entry with all metadata.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }

    /// Returns the error message template.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigInvalid => "Harness configuration value is invalid",
            Self::ConfigServerBinary => "Server binary is missing or not executable",
            Self::StartupTimeout => "Server did not accept connections before the startup timeout",
            Self::PortInUse => "Port is already bound",
            Self::DataDirectoryInUse => "Data directory is owned by a running server",
            Self::InvalidState => "Handle is not in a state that allows this operation",
            Self::UnexpectedCrash => "Process terminated without being asked to",
            Self::ProcessStartFailed => "Process could not be spawned",
            Self::AlreadyJoined => "Session was already joined",
            Self::SessionHung => "Session did not finish and its server had to be killed",
            Self::SessionPanicked => "Session thread panicked",
            Self::ConnectFailed => "Could not connect to the server",
            Self::ConnectionClosed => "Server closed the connection mid-operation",
            Self::ServerError => "Server rejected the operation",
            Self::AssertionFailure => "Observed value does not match the expected value",
            Self::Io => "Filesystem or socket IO failed",
            Self::Protocol => "Malformed message on the client connection",
            Self::Timeout => "Bounded wait elapsed",
        }
    }

    /// Returns remediation steps.
    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigInvalid => &[
                "Check DBRACE_* environment variables for typos",
                "Durations accept humantime syntax such as 500ms or 10s",
            ],
            Self::ConfigServerBinary => &[
                "Build the workspace so target/<profile>/dbrace-stubd exists",
                "Or point DBRACE_SERVER_BIN at the server under test",
            ],
            Self::StartupTimeout => &[
                "Inspect logs/server-<port>.log in the scenario directory",
                "Raise DBRACE_STARTUP_TIMEOUT on slow machines",
            ],
            Self::PortInUse => &[
                "Use allocate_ports() instead of fixed port numbers",
                "Check for leftover servers from an earlier run",
            ],
            Self::DataDirectoryInUse => &[
                "Stop the running instance before reusing its data directory",
                "Use restart() for stop-then-start on the same directory",
            ],
            Self::InvalidState => &["Check the handle state before stopping or restarting it"],
            Self::UnexpectedCrash => &[
                "Inspect logs/server-<port>.log for the crash reason",
                "Check whether something else signalled the process",
            ],
            Self::ProcessStartFailed => &["Verify the binary path and its permissions"],
            Self::AlreadyJoined => &["Join each session handle exactly once"],
            Self::SessionHung => &[
                "The workload never completed; check for unbounded spins",
                "Increase the join timeout if the workload is legitimately slow",
            ],
            Self::SessionPanicked => &["Run the workload on the control thread to see the panic"],
            Self::ConnectFailed => &["Verify the server is Running on the target port"],
            Self::ConnectionClosed => &[
                "Expected when the server was stopped under a running session",
                "Otherwise inspect the server log for a crash",
            ],
            Self::ServerError => &["Inspect the server error code and message"],
            Self::AssertionFailure => &[
                "Compare the observed and expected values in the failure message",
                "Inspect captured artifacts under logs/artifacts/",
            ],
            Self::Io => &["Check disk space and permissions on the scenario directory"],
            Self::Protocol => &["Make sure client and server speak the same protocol version"],
            Self::Timeout => &["Raise the relevant timeout or check for a stuck process"],
        }
    }

    /// Returns all error codes in declaration order.
    #[must_use]
    pub const fn all() -> &'static [ErrorCode] {
        &[
            Self::ConfigInvalid,
            Self::ConfigServerBinary,
            Self::StartupTimeout,
            Self::PortInUse,
            Self::DataDirectoryInUse,
            Self::InvalidState,
            Self::UnexpectedCrash,
            Self::ProcessStartFailed,
            Self::AlreadyJoined,
            Self::SessionHung,
            Self::SessionPanicked,
            Self::ConnectFailed,
            Self::ConnectionClosed,
            Self::ServerError,
            Self::AssertionFailure,
            Self::Io,
            Self::Protocol,
            Self::Timeout,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code_string())
    }
}

/// Error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration errors (E001-E099)
    Config,
    /// Server lifecycle errors (E100-E199)
    Lifecycle,
    /// Session and connection errors (E200-E299)
    Session,
    /// Verification errors (E300-E399)
    Verify,
    /// Internal errors (E500-E599)
    Internal,
}

impl ErrorCategory {
    /// Returns a human-readable name for the category.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Lifecycle => "Lifecycle",
            Self::Session => "Session",
            Self::Verify => "Verification",
            Self::Internal => "Internal",
        }
    }
}

/// Full metadata for one catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code string (e.g., "DBR-E101")
    pub code: String,
    /// Error category
    pub category: ErrorCategory,
    /// Human-readable error message
    pub message: String,
    /// Steps to remediate the error
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n", self.code, self.message);
        if !self.remediation.is_empty() {
            output.push_str("Remediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }
        output
    }
}
