use shared::error::{ApiException, ErrorCode};
use thiserror::Error;

use crate::store::MutationKind;

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("remote request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("remote service rejected request: {0}")]
    Api(#[from] ApiException),
    #[error("invalid remote record: {0}")]
    Decode(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("push channel failed: {0}")]
    Push(String),
    #[error("no async runtime available: {0}")]
    RuntimeUnavailable(String),
}

impl BoardError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Api(err) => err.code,
            Self::Validation(_) => ErrorCode::Validation,
            _ => ErrorCode::Internal,
        }
    }
}

impl From<serde_json::Error> for BoardError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

/// Outcome of a fire-and-forget remote write that failed after its optimistic apply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("persisting {kind:?} (seq {seq}) failed: {message}")]
pub struct PersistenceError {
    pub seq: u64,
    pub kind: MutationKind,
    pub message: String,
}
