//! Per-stream delivery mode state machine.
//!
//! A stream starts `Streaming` (the server holds an HTTP response open and
//! pushes events). The server may demote it to `Polling` — dropping the live
//! response while the client keeps catching up via `Last-Event-ID` replays —
//! and either side may close it. Transitions only move forward; a stream
//! never re-enters `Streaming` from `Polling`. A client that wants live
//! delivery again reconnects, and the server decides the mode afresh on the
//! new stream.
//!
//! The demotion to `Polling` is only legal once every event the client still
//! needs is in the event store. Delivery order in the session manager makes
//! that structural: events are stored *before* they are pushed live, so by
//! the time a live push fails (or the server ends the response), nothing is
//! only in the dying channel.

use thiserror::Error;

use crate::model::StreamId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Streaming,
    Polling,
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("stream {stream_id} is closed")]
pub struct StreamClosed {
    pub stream_id: StreamId,
}

/// Mode and progress of one logical stream.
#[derive(Debug, Clone)]
pub struct StreamState {
    stream_id: StreamId,
    mode: StreamMode,
    last_sequence: u64,
}

impl StreamState {
    pub fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            mode: StreamMode::Streaming,
            last_sequence: 0,
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn is_live(&self) -> bool {
        self.mode == StreamMode::Streaming
    }

    /// Highest sequence number handed out on this stream.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    pub fn record_sequence(&mut self, sequence: u64) {
        self.last_sequence = self.last_sequence.max(sequence);
    }

    /// `Streaming → Polling`. Idempotent when already polling; an error once
    /// closed.
    pub fn begin_polling(&mut self) -> Result<(), StreamClosed> {
        match self.mode {
            StreamMode::Streaming | StreamMode::Polling => {
                self.mode = StreamMode::Polling;
                Ok(())
            }
            StreamMode::Closed => Err(StreamClosed {
                stream_id: self.stream_id.clone(),
            }),
        }
    }

    /// Terminal; allowed from any mode.
    pub fn close(&mut self) {
        self.mode = StreamMode::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::stream_id;

    #[test]
    fn starts_streaming() {
        let state = StreamState::new(stream_id());
        assert_eq!(state.mode(), StreamMode::Streaming);
        assert!(state.is_live());
    }

    #[test]
    fn demotion_is_forward_only() {
        let mut state = StreamState::new(stream_id());
        state.begin_polling().unwrap();
        assert_eq!(state.mode(), StreamMode::Polling);
        // idempotent
        state.begin_polling().unwrap();
        assert_eq!(state.mode(), StreamMode::Polling);

        state.close();
        assert_eq!(state.mode(), StreamMode::Closed);
        assert!(state.begin_polling().is_err());
    }

    #[test]
    fn sequence_tracking_is_monotonic() {
        let mut state = StreamState::new(stream_id());
        state.record_sequence(5);
        state.record_sequence(3);
        assert_eq!(state.last_sequence(), 5);
    }
}
