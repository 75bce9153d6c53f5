//! Session metadata and its store.
//!
//! A *session* groups the logically related interactions between one client
//! and the server, starting from the `initialize` handshake. The server
//! assigns each session a unique [`SessionId`] (returned via the
//! `Mcp-Session-Id` response header) and the client includes it on every
//! subsequent request.
//!
//! The store tracks identity and liveness only; live wiring (channels,
//! streams) belongs to the session manager. Implement [`SessionStore`] to
//! back sessions with Redis or any other external store — the in-memory
//! [`local::LocalSessionStore`] is the default.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::{error::StoreError, model::SessionId};

pub mod local;

/// Identity claims of an authenticated session. Absent for anonymous
/// sessions; this layer records the claims but never interprets them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub claim_type: String,
    pub claim_value: String,
    pub claim_issuer: String,
}

/// One logical client connection.
#[derive(Debug, Clone)]
pub struct SessionMetadata {
    pub session_id: SessionId,
    pub user_identity: Option<UserIdentity>,
    pub created_at: DateTime<Utc>,
    /// Always `>= created_at`; bumped on every request attributed to the
    /// session.
    pub last_activity_at: DateTime<Utc>,
    /// Opaque payload owned by layers above; never inspected here.
    pub custom_data: Option<Bytes>,
}

impl SessionMetadata {
    /// A fresh anonymous session created at `now`.
    pub fn new(session_id: SessionId, now: DateTime<Utc>) -> Self {
        Self {
            session_id,
            user_identity: None,
            created_at: now,
            last_activity_at: now,
            custom_data: None,
        }
    }

    pub fn with_identity(mut self, identity: UserIdentity) -> Self {
        self.user_identity = Some(identity);
        self
    }
}

/// Storage contract for session metadata.
///
/// Operations do not fail on missing keys: `get` returns `None`,
/// `update_activity` is a no-op and `remove` reports `false`. The only error
/// kind is a backend failure ([`StoreError::Backend`]), which propagates to
/// the caller untouched — the store never retries internally.
///
/// Implementations backed by a shared cache must make read-modify-write
/// sequences atomic at the storage layer (CAS / atomic ops), since multiple
/// processes may race on the same session.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Upsert by `session_id`. Last writer wins; fields are never merged.
    async fn save(&self, metadata: SessionMetadata) -> Result<(), StoreError>;

    async fn get(&self, session_id: &SessionId) -> Result<Option<SessionMetadata>, StoreError>;

    /// Record activity at `at`. Concurrent calls converge to the *greatest*
    /// observed timestamp, not the last call's. A session that no longer
    /// exists is a no-op, never an error — expiry may race a late request.
    async fn update_activity(
        &self,
        session_id: &SessionId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Returns whether the session existed.
    async fn remove(&self, session_id: &SessionId) -> Result<bool, StoreError>;

    /// Remove every session with `now - last_activity_at > idle_timeout` and
    /// return the removed ids (the count the contract asks for is their
    /// number; the ids let callers also tear down per-session state).
    ///
    /// Safe to run concurrently with `save`/`get`/`update_activity`: a
    /// session saved or touched after `now` was computed is never removed.
    async fn prune_idle(
        &self,
        idle_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionId>, StoreError>;

    /// Remove all sessions. Test/shutdown hook.
    async fn clear(&self) -> Result<(), StoreError>;
}
