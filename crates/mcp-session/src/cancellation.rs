//! Correlates client cancellation notifications with in-flight handlers.
//!
//! A handler registers the request it is serving and gets a
//! [`CancellationToken`] to observe cooperatively. A later
//! `notifications/cancelled` for that request id fires the token exactly
//! once; cancelling an unknown or already-completed request is a silent
//! no-op. The whole mechanism is fire-and-forget for the sender — whether
//! the handler actually stops is best-effort.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::model::{RequestId, SessionId};

#[derive(Default)]
pub struct CancellationRegistry {
    inner: RwLock<HashMap<(SessionId, RequestId), CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-flight request and return the token its handler should
    /// observe. Registering the same id twice replaces the previous token
    /// (the old handler is already gone or being superseded).
    pub async fn register(&self, session_id: SessionId, request_id: RequestId) -> CancellationToken {
        let token = CancellationToken::new();
        self.inner
            .write()
            .await
            .insert((session_id, request_id), token.clone());
        token
    }

    /// Fire cancellation for a request. Returns `true` if a live handler was
    /// correlated; `false` (silently) otherwise. The entry is removed before
    /// the token fires, so a second call cannot fire twice.
    pub async fn cancel(
        &self,
        session_id: &SessionId,
        request_id: &RequestId,
        reason: Option<&str>,
    ) -> bool {
        let token = self
            .inner
            .write()
            .await
            .remove(&(session_id.clone(), request_id.clone()));
        match token {
            Some(token) => {
                tracing::debug!(%session_id, %request_id, reason, "cancelling in-flight request");
                token.cancel();
                true
            }
            None => {
                tracing::trace!(%session_id, %request_id, "cancellation for unknown or completed request");
                false
            }
        }
    }

    /// Drop the entry for a request that finished normally.
    pub async fn complete(&self, session_id: &SessionId, request_id: &RequestId) {
        self.inner
            .write()
            .await
            .remove(&(session_id.clone(), request_id.clone()));
    }

    /// Drop every entry belonging to a session being closed.
    pub async fn drop_session(&self, session_id: &SessionId) {
        self.inner
            .write()
            .await
            .retain(|(sid, _), _| sid != session_id);
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}
