//! Wire protocol between the harness client and a server.
//!
//! Newline-delimited JSON over TCP. Each request line carries an `id` that
//! the matching response echoes back.

use serde::{Deserialize, Serialize};

use crate::errors::{HarnessError, HarnessResult};
use crate::workload::{OpResult, Operation};

pub const CODE_INTERNAL: i32 = 1;
/// Request could not be parsed or names a local-only operation.
pub const CODE_BAD_REQUEST: i32 = 2;
/// Duplicate `_id` on insert.
pub const CODE_DUPLICATE_KEY: i32 = 11000;
/// Operation interrupted because the server is shutting down.
pub const CODE_INTERRUPTED_AT_SHUTDOWN: i32 = 11600;
/// Operation cancelled because its client went away.
pub const CODE_INTERRUPTED: i32 = 11601;
/// Update operator not understood.
pub const CODE_BAD_UPDATE: i32 = 10147;

/// Upper bound on one encoded line.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub op: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<OpResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    pub fn success(id: u64, result: OpResult) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(WireError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Convert into the harness result type for a server on `port`.
    pub fn into_result(self, port: u16) -> HarnessResult<OpResult> {
        match (self.ok, self.result, self.error) {
            (true, Some(result), _) => Ok(result),
            (false, _, Some(err)) => Err(HarnessError::ServerError {
                port,
                code: err.code,
                message: err.message,
            }),
            (ok, _, _) => Err(HarnessError::Protocol(format!(
                "malformed response {} (ok={ok})",
                self.id
            ))),
        }
    }
}

/// Serialize a message as one protocol line, newline included.
pub fn encode_line<T: Serialize>(message: &T) -> HarnessResult<String> {
    let mut line = serde_json::to_string(message)
        .map_err(|e| HarnessError::Protocol(format!("encode failed: {e}")))?;
    line.push('\n');
    Ok(line)
}

/// Parse one protocol line.
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> HarnessResult<T> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| HarnessError::Protocol(format!("decode failed: {e}")))
}
