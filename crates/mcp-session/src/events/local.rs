//! In-memory event stream store.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream::BoxStream};
use tokio::sync::RwLock;

use super::{EventStore, MonotonicSequencer, StoredEvent, StreamEvent, should_retain};
use crate::{
    clock::{Clock, deadline_after},
    error::StoreError,
    model::{EventId, SessionId, StreamId},
};

/// Expiry windows applied to every retained event.
#[derive(Debug, Clone, Copy)]
pub struct EventRetention {
    /// Extended to `now + sliding` every time the event is replayed.
    pub sliding: Duration,
    /// Fixed at store time; never extended.
    pub absolute: Duration,
}

struct RetainedEvent {
    event_id: EventId,
    payload: Bytes,
    sliding_deadline: DateTime<Utc>,
    absolute_deadline: DateTime<Utc>,
}

impl RetainedEvent {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        now > self.sliding_deadline || now > self.absolute_deadline
    }
}

struct StreamEntry {
    session_id: SessionId,
    events: Vec<RetainedEvent>,
}

/// Process-local [`EventStore`]. One `RwLock`ed map of stream entries; the
/// single write lock makes every append and replay snapshot atomic, which is
/// the in-process analogue of the CAS discipline an external cache backend
/// would need.
pub struct LocalEventStore {
    streams: RwLock<HashMap<StreamId, StreamEntry>>,
    sequencer: MonotonicSequencer,
    clock: Arc<dyn Clock>,
    retention: EventRetention,
    retry_hint: Option<Duration>,
}

impl LocalEventStore {
    pub fn new(
        retention: EventRetention,
        retry_hint: Option<Duration>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            sequencer: MonotonicSequencer::new(),
            clock,
            retention,
            retry_hint,
        }
    }

    /// Number of streams currently holding retained events.
    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }

    /// Number of retained events on one stream; `None` for unknown streams.
    pub async fn retained_len(&self, stream_id: &StreamId) -> Option<usize> {
        self.streams
            .read()
            .await
            .get(stream_id)
            .map(|entry| entry.events.len())
    }
}

#[async_trait]
impl EventStore for LocalEventStore {
    async fn next_event_id(
        &self,
        _session_id: &SessionId,
        stream_id: &StreamId,
    ) -> Result<EventId, StoreError> {
        let sequence = self.sequencer.next(self.clock.now());
        Ok(EventId::new(stream_id.clone(), sequence))
    }

    async fn store_event(
        &self,
        session_id: &SessionId,
        stream_id: &StreamId,
        event: StreamEvent,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut streams = self.streams.write().await;
        let has_entry = streams.contains_key(stream_id);
        if !should_retain(event.kind, has_entry) {
            return Ok(false);
        }
        let entry = streams.entry(stream_id.clone()).or_insert_with(|| {
            tracing::trace!(%session_id, %stream_id, "opening retention entry");
            StreamEntry {
                session_id: session_id.clone(),
                events: Vec::new(),
            }
        });
        entry.events.push(RetainedEvent {
            event_id: event.event_id,
            payload: event.payload,
            sliding_deadline: deadline_after(now, self.retention.sliding),
            absolute_deadline: deadline_after(now, self.retention.absolute),
        });
        Ok(true)
    }

    async fn replay_after(
        &self,
        last_event_id: &EventId,
    ) -> Result<BoxStream<'static, StoredEvent>, StoreError> {
        let now = self.clock.now();
        let retry = self.retry_hint;
        let mut streams = self.streams.write().await;

        let Some(entry) = streams.get_mut(last_event_id.stream_id()) else {
            // unknown or fully expired stream: nothing to redeliver
            return Ok(futures::stream::empty().boxed());
        };

        let mut missed: Vec<StoredEvent> = entry
            .events
            .iter_mut()
            .filter(|event| {
                event.event_id.sequence() > last_event_id.sequence() && !event.expired(now)
            })
            .map(|event| {
                // replay is an access: extend the sliding window
                event.sliding_deadline = deadline_after(now, self.retention.sliding);
                StoredEvent {
                    event_id: event.event_id.clone(),
                    payload: event.payload.clone(),
                    retry,
                }
            })
            .collect();
        drop(streams);

        missed.sort_by_key(|event| event.event_id.sequence());
        Ok(futures::stream::iter(missed).boxed())
    }

    async fn clean_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut removed = 0;
        let mut streams = self.streams.write().await;
        streams.retain(|stream_id, entry| {
            let before = entry.events.len();
            entry.events.retain(|event| !event.expired(now));
            removed += before - entry.events.len();
            if entry.events.is_empty() {
                tracing::trace!(%stream_id, "dropping empty retention entry");
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn remove_session(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.streams
            .write()
            .await
            .retain(|_, entry| entry.session_id != *session_id);
        Ok(())
    }
}
