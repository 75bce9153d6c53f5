//! Resumable event stream store.
//!
//! Outbound server→client messages that a disconnected client could
//! legitimately miss are retained per `(session, stream)`, keyed by a
//! totally-ordered [`EventId`]. A reconnecting client presents its last seen
//! id (`Last-Event-ID`) and gets back exactly the suffix it is missing —
//! strictly *after* the watermark, never redelivering the acknowledged event.
//!
//! # Retention
//!
//! Not all traffic is replayable. Retaining every message would grow memory
//! without bound for high-frequency notification streams that have no replay
//! requirement, so retention is decided by [`should_retain`], a pure function
//! over the message kind: server-initiated requests are retained
//! unconditionally (they create the stream's retention entry), responses are
//! retained only when the stream already has an outstanding entry, and
//! notifications are never retained. Replay therefore reconstructs exactly
//! the request/response pairs a disconnected client would otherwise lose.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::{
    error::StoreError,
    model::{EventId, MessageKind, SessionId, StreamId},
};

pub mod local;

/// Decide whether an outbound message of `kind` is retained for replay on a
/// stream that does (`stream_has_entry`) or does not yet have a retention
/// entry.
pub fn should_retain(kind: MessageKind, stream_has_entry: bool) -> bool {
    match kind {
        MessageKind::Request => true,
        MessageKind::Response => stream_has_entry,
        MessageKind::Notification => false,
    }
}

/// An outbound message as submitted for retention.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub event_id: EventId,
    pub kind: MessageKind,
    /// Opaque; preserved byte-for-byte on replay.
    pub payload: Bytes,
}

/// A retained event as it comes back out of [`EventStore::replay_after`],
/// with the per-event metadata a transport needs to re-emit it.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub event_id: EventId,
    pub payload: Bytes,
    /// Reconnection-interval hint to forward as the SSE `retry:` field.
    pub retry: Option<Duration>,
}

/// Storage contract for replayable events.
///
/// Implementations backed by a shared cache must append atomically (CAS or
/// native list-append), since multiple processes may write one stream.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Allocate the next identifier on `stream_id`. Allocation is atomic per
    /// stream: two concurrent calls never yield the same id, and every id
    /// sorts after all previously allocated ids for that stream — including
    /// ids allocated before a process restart, when the backing store is
    /// durable (the sequence token is a timestamp with a monotonic
    /// tiebreak, not a resettable counter).
    async fn next_event_id(
        &self,
        session_id: &SessionId,
        stream_id: &StreamId,
    ) -> Result<EventId, StoreError>;

    /// Append `event` to its stream's retained list, subject to
    /// [`should_retain`]. Returns whether the event was retained.
    async fn store_event(
        &self,
        session_id: &SessionId,
        stream_id: &StreamId,
        event: StreamEvent,
    ) -> Result<bool, StoreError>;

    /// Replay the retained suffix strictly after `last_event_id`, in id
    /// order, as a lazy single-pass stream.
    ///
    /// All bookkeeping (lookup, filter, sort, expiry extension) completes and
    /// internal locks are released before the stream is handed back, so a
    /// slow consumer never blocks other sessions.
    ///
    /// A `last_event_id` naming an unknown stream yields an *empty* stream,
    /// not an error: the client may be resuming a stream that has fully
    /// expired, and must treat this as "nothing to redeliver".
    async fn replay_after(
        &self,
        last_event_id: &EventId,
    ) -> Result<BoxStream<'static, StoredEvent>, StoreError>;

    /// Drop every event whose sliding or absolute deadline elapsed at `now`,
    /// and drop a stream's entry entirely once its list becomes empty so
    /// idle streams do not leak map entries. Returns the number of events
    /// removed.
    async fn clean_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Drop all streams belonging to a closed session.
    async fn remove_session(&self, session_id: &SessionId) -> Result<(), StoreError>;
}

/// Allocates sequence tokens that are strictly increasing across the whole
/// store: `max(now_in_micros, previous + 1)`. Global monotonicity implies
/// per-stream monotonicity, survives a stream's retention entry being
/// expired away, and — because the token tracks wall time — keeps advancing
/// across process restarts.
#[derive(Debug, Default)]
pub struct MonotonicSequencer {
    last: AtomicU64,
}

impl MonotonicSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, now: DateTime<Utc>) -> u64 {
        let wall = now.timestamp_micros().max(0) as u64;
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = wall.max(last.saturating_add(1));
            match self.last.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(observed) => last = observed,
            }
        }
    }
}
