use thiserror::Error;

use crate::model::{RequestId, SessionId};

/// Failure of a store backend (e.g. a networked cache becoming unreachable).
///
/// Stores never retry internally; the caller owns retry/fallback policy.
/// Missing keys are *not* errors — they surface as `Option`/no-ops per the
/// individual operation contracts.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend unavailable: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        StoreError::Backend(error.into())
    }
}

/// Errors surfaced by a session manager.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
    #[error("expected an initialize request to open the session")]
    ExpectedInitializeRequest,
    #[error("duplicated request id within one session: {0}")]
    DuplicatedRequestId(RequestId),
    #[error("expected a request message")]
    NotARequest,
    #[error("malformed Last-Event-ID: {0}")]
    MalformedEventId(#[from] crate::model::EventIdError),
    #[error("session service loop is gone")]
    TransportClosed,
    #[error("initialize response channel closed before a response arrived")]
    InitializeInterrupted,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Unified error type for embedders that do not care which component failed.
#[derive(Debug, Error)]
pub enum McpSessionError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),
}
