//! Task-level error type.
//!
//! Every handler returns a `TaskError`; the worker pool asks it whether the
//! failure is transient (redeliver with backoff) or fatal (log and drop).

use crate::services::delta::DeltaError;
use crate::services::hash_codec::HashParseError;
use crate::services::datamart_store::StoreError;
use crate::sources::EngineError;
use crate::types::{MessageParseError, ReportKeyError, UnknownMatchType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("missing required task parameter: {0}")]
    MissingParameter(&'static str),

    #[error("invalid task parameter {name}: {value}")]
    InvalidParameter { name: &'static str, value: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Delta(#[from] DeltaError),

    #[error("stored entity hash is unreadable: {0}")]
    Hash(#[from] HashParseError),

    #[error(transparent)]
    Snapshot(#[from] UnknownMatchType),

    #[error(transparent)]
    ReportKey(#[from] ReportKeyError),

    #[error(transparent)]
    Message(#[from] MessageParseError),
}

impl TaskError {
    /// Whether redelivering the task can succeed. Invariant violations and
    /// malformed inputs are deliberately not retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskError::Store(e) => e.is_retryable(),
            TaskError::Engine(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;
