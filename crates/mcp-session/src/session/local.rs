//! In-memory session store.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{SessionMetadata, SessionStore};
use crate::{clock::elapsed_exceeds, error::StoreError, model::SessionId};

/// Process-local [`SessionStore`] over a `tokio` `RwLock`ed map. All
/// critical sections are O(1) per session; no lock is held across an await
/// point.
#[derive(Default)]
pub struct LocalSessionStore {
    sessions: RwLock<HashMap<SessionId, SessionMetadata>>,
}

impl LocalSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for LocalSessionStore {
    async fn save(&self, metadata: SessionMetadata) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .insert(metadata.session_id.clone(), metadata);
        Ok(())
    }

    async fn get(&self, session_id: &SessionId) -> Result<Option<SessionMetadata>, StoreError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn update_activity(
        &self,
        session_id: &SessionId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            // greatest-wins: racing updates may arrive reordered
            session.last_activity_at = session.last_activity_at.max(at);
        }
        Ok(())
    }

    async fn remove(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        Ok(self.sessions.write().await.remove(session_id).is_some())
    }

    async fn prune_idle(
        &self,
        idle_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionId>, StoreError> {
        let mut removed = Vec::new();
        self.sessions.write().await.retain(|id, session| {
            if elapsed_exceeds(session.last_activity_at, now, idle_timeout) {
                removed.push(id.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), "pruned idle sessions");
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.sessions.write().await.clear();
        Ok(())
    }
}
