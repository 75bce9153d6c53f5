//! Session and resumable event-stream layer for MCP streamable HTTP servers.
//!
//! HTTP is stateless; the MCP wire protocol wants a reliable, resumable,
//! bidirectional stream. This crate is the layer in between: it tracks
//! sessions across requests, retains the outbound events a disconnected
//! client would otherwise lose, replays exactly the missing suffix on
//! reconnect (`Last-Event-ID`), correlates cancellation with in-flight
//! requests, validates `Host`/`Origin` against DNS rebinding, and prunes
//! everything that goes idle.
//!
//! RPC dispatch stays outside: the [`StreamableHttpService`] hands each new
//! session's [`SessionTransport`] to the embedder, which consumes inbound
//! messages and answers through the session's [`SessionSender`]. Message
//! bodies are opaque bytes end to end.
//!
//! # Quick start
//!
//! ```ignore
//! let manager = Arc::new(LocalSessionManager::new(SessionConfig::default())?);
//! let (service, mut transports) = StreamableHttpService::new(manager.clone(), manager.config());
//!
//! // serve `service` with any tower-compatible HTTP server, and:
//! tokio::spawn(async move {
//!     while let Some((session_id, transport)) = transports.recv().await {
//!         tokio::spawn(serve_one_session(session_id, transport));
//!     }
//! });
//!
//! // background pruning:
//! let reaper = IdleReaper::new(manager.clone(), reap_interval, clock);
//! let handle = reaper.spawn(shutdown_token.child_token());
//! ```

pub mod cancellation;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod http_header;
pub mod manager;
pub mod model;
pub mod pagination;
pub mod reaper;
pub mod security;
pub mod service;
pub mod session;
pub mod stream;

pub use cancellation::CancellationRegistry;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SessionConfig};
pub use error::{McpSessionError, SessionError, StoreError};
pub use events::{
    EventStore, StoredEvent, StreamEvent,
    local::{EventRetention, LocalEventStore},
};
pub use manager::{
    InboundMessage, SessionManager,
    local::{LocalSessionManager, SessionSender, SessionTransport},
};
pub use model::{
    ClientMessage, EventId, MessageKind, RequestId, ServerMessage, ServerSseMessage, SessionId,
    StreamId,
};
pub use pagination::{Cursor, Page};
pub use reaper::{IdleReaper, Reap, SweepReport};
pub use security::LoopbackGuard;
pub use service::StreamableHttpService;
pub use session::{SessionMetadata, SessionStore, UserIdentity, local::LocalSessionStore};
pub use stream::{StreamMode, StreamState};
