//! Session lifecycle orchestration.
//!
//! A [`SessionManager`] is what the HTTP front end talks to for every request
//! that carries (or should carry) a session id: it opens sessions, routes
//! messages into them, hands out the SSE streams for responses, and replays
//! missed events on reconnect.
//!
//! The manager deliberately knows nothing about RPC semantics. Inbound
//! messages are classified envelopes with opaque payloads; whoever consumes
//! the session's transport (see [`local::SessionTransport`]) owns dispatch.
//!
//! [`local::LocalSessionManager`] is the in-process implementation. A custom
//! implementation can back sessions and events with an external cache by
//! implementing this trait over its own stores.

use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::model::{ClientMessage, ServerSseMessage, SessionId};

pub mod local;

/// One client→server message as delivered to the session's consumer, with
/// the cooperative cancellation token for request messages.
#[derive(Debug)]
pub struct InboundMessage {
    pub message: ClientMessage,
    /// Present for requests: fires if the client cancels the request while
    /// the handler is still working on it.
    pub cancellation: Option<CancellationToken>,
}

/// Controls how sessions are created, validated, resumed, and closed.
pub trait SessionManager: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;
    /// Handle given to the embedder for exchanging messages within one
    /// session.
    type Transport: Send + 'static;

    /// Create a new session and return its id together with the transport
    /// the embedder uses to serve it.
    fn create_session(
        &self,
    ) -> impl Future<Output = Result<(SessionId, Self::Transport), Self::Error>> + Send;

    /// Forward the first message (the `initialize` request) into the session
    /// and return the raw response body once the embedder answers it.
    fn initialize_session(
        &self,
        id: &SessionId,
        message: ClientMessage,
    ) -> impl Future<Output = Result<bytes::Bytes, Self::Error>> + Send;

    /// `true` if a session with this id exists and is active.
    fn has_session(&self, id: &SessionId)
    -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Close and remove the session, tearing down its streams, retained
    /// events, and cancellation entries. Idempotent.
    fn close_session(&self, id: &SessionId)
    -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Route a client request into the session and return the SSE stream
    /// carrying its response(s).
    fn create_stream(
        &self,
        id: &SessionId,
        message: ClientMessage,
    ) -> impl Future<
        Output = Result<impl Stream<Item = ServerSseMessage> + Send + 'static, Self::Error>,
    > + Send;

    /// Accept a notification or response from the client without producing a
    /// response stream. Cancellation notifications are correlated here.
    fn accept_message(
        &self,
        id: &SessionId,
        message: ClientMessage,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Open the standalone SSE stream for server-initiated traffic
    /// (HTTP GET without `Last-Event-ID`).
    fn create_standalone_stream(
        &self,
        id: &SessionId,
    ) -> impl Future<
        Output = Result<impl Stream<Item = ServerSseMessage> + Send + 'static, Self::Error>,
    > + Send;

    /// Resume from `last_event_id`: replay the missed suffix, then continue
    /// live delivery if the referenced stream is still open.
    fn resume(
        &self,
        id: &SessionId,
        last_event_id: &str,
    ) -> impl Future<
        Output = Result<impl Stream<Item = ServerSseMessage> + Send + 'static, Self::Error>,
    > + Send;
}
