//! Error types for the dbrace harness.
//!
//! `HarnessError` is the single error type surfaced by lifecycle, session and
//! verification calls. Nothing in the harness retries: an error aborts the
//! scenario with the context needed to diagnose it.
//!
//! Every variant maps onto a stable catalog code, see [`catalog`].

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};

use std::path::PathBuf;
use std::time::Duration;

/// Error type for harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("server on port {port} not reachable after {timeout:?}")]
    StartupTimeout { port: u16, timeout: Duration },

    #[error("port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("data directory {} is owned by the running server on port {port}", .path.display())]
    DataDirectoryInUse { path: PathBuf, port: u16 },

    #[error("cannot {operation}: {subject} is {state}")]
    InvalidState {
        operation: String,
        subject: String,
        state: String,
    },

    #[error("session {session} was already joined")]
    AlreadyJoined { session: String },

    #[error(
        "session {session} did not finish within {waited:?}; server on port {port} was killed to release it"
    )]
    SessionHung {
        session: String,
        port: u16,
        waited: Duration,
    },

    #[error("{context}: expected {expected}, observed {observed}{}", .detail.as_deref().map(|d| format!("\n{d}")).unwrap_or_default())]
    AssertionFailure {
        context: String,
        observed: String,
        expected: String,
        detail: Option<String>,
    },

    #[error("{name} (pid={pid}) terminated unexpectedly: {status}")]
    UnexpectedCrash {
        name: String,
        pid: u32,
        status: String,
    },

    #[error("cannot connect to port {port}: {reason}")]
    ConnectFailed { port: u16, reason: String },

    #[error("connection to port {port} closed")]
    ConnectionClosed { port: u16 },

    #[error("server on port {port} returned error {code}: {message}")]
    ServerError {
        port: u16,
        code: i32,
        message: String,
    },

    #[error("session {session} panicked")]
    SessionPanicked { session: String },

    #[error("Process failed to start: {0}")]
    ProcessStartFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// Build an `InvalidState` error.
    pub fn invalid_state(
        operation: impl Into<String>,
        subject: impl Into<String>,
        state: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            subject: subject.into(),
            state: state.to_string(),
        }
    }

    /// Build an `AssertionFailure` from debug-rendered values.
    pub fn assertion<T: std::fmt::Debug + ?Sized>(
        context: impl Into<String>,
        observed: &T,
        expected: &T,
    ) -> Self {
        Self::AssertionFailure {
            context: context.into(),
            observed: format!("{observed:?}"),
            expected: format!("{expected:?}"),
            detail: None,
        }
    }

    /// Catalog code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::StartupTimeout { .. } => ErrorCode::StartupTimeout,
            Self::PortInUse { .. } => ErrorCode::PortInUse,
            Self::DataDirectoryInUse { .. } => ErrorCode::DataDirectoryInUse,
            Self::InvalidState { .. } => ErrorCode::InvalidState,
            Self::AlreadyJoined { .. } => ErrorCode::AlreadyJoined,
            Self::SessionHung { .. } => ErrorCode::SessionHung,
            Self::AssertionFailure { .. } => ErrorCode::AssertionFailure,
            Self::UnexpectedCrash { .. } => ErrorCode::UnexpectedCrash,
            Self::ConnectFailed { .. } => ErrorCode::ConnectFailed,
            Self::ConnectionClosed { .. } => ErrorCode::ConnectionClosed,
            Self::ServerError { .. } => ErrorCode::ServerError,
            Self::SessionPanicked { .. } => ErrorCode::SessionPanicked,
            Self::ProcessStartFailed(_) => ErrorCode::ProcessStartFailed,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Protocol(_) => ErrorCode::Protocol,
            Self::Config(_) => ErrorCode::ConfigInvalid,
            Self::Io(_) => ErrorCode::Io,
        }
    }

    /// True for errors that mean the peer process went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed { .. } | Self::ConnectFailed { .. }
        ) || matches!(self, Self::Io(e) if matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionAborted
        ))
    }
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;
