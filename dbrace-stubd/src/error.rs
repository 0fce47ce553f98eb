//! Errors returned by store operations.

use dbrace_common::protocol::{
    CODE_BAD_REQUEST, CODE_BAD_UPDATE, CODE_DUPLICATE_KEY, CODE_INTERNAL, CODE_INTERRUPTED,
    CODE_INTERRUPTED_AT_SHUTDOWN,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("E11000 duplicate key error {ns} _id: {id}")]
    DuplicateKey { ns: String, id: String },

    #[error("interrupted at shutdown")]
    InterruptedAtShutdown,

    #[error("operation was interrupted")]
    Interrupted,

    #[error("{0}")]
    BadUpdate(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Wire code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Self::DuplicateKey { .. } => CODE_DUPLICATE_KEY,
            Self::InterruptedAtShutdown => CODE_INTERRUPTED_AT_SHUTDOWN,
            Self::Interrupted => CODE_INTERRUPTED,
            Self::BadUpdate(_) => CODE_BAD_UPDATE,
            Self::BadRequest(_) => CODE_BAD_REQUEST,
            Self::Io(_) => CODE_INTERNAL,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
