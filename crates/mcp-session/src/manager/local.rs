//! In-process session manager.
//!
//! Wires the session store, the event store, and the cancellation registry
//! together and owns the live delivery channels. One [`SessionWiring`] per
//! open session holds the standalone ("common") stream for server-initiated
//! traffic plus one stream per in-flight client request; responses are
//! routed request-wise by id, everything else goes to the common stream.
//!
//! Delivery order is store-first: an outbound message is offered to the
//! event store *before* it is pushed on the live channel. A stream can
//! therefore be demoted to polling at any moment — on explicit request, on a
//! disconnected receiver, or on backpressure from a slow client — without
//! losing anything a replay is required to reconstruct.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, stream::BoxStream};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use super::{InboundMessage, SessionManager};
use crate::{
    cancellation::CancellationRegistry,
    clock::{Clock, SystemClock},
    config::{ConfigError, SessionConfig},
    error::{SessionError, StoreError},
    events::{EventStore, StoredEvent, StreamEvent},
    events::local::{EventRetention, LocalEventStore},
    model::{
        ClientMessage, EventId, MessageKind, RequestId, ServerMessage, ServerSseMessage,
        SessionId, StreamId, session_id, stream_id,
    },
    reaper::{Reap, SweepReport},
    session::{SessionMetadata, SessionStore, local::LocalSessionStore},
    stream::StreamState,
};

struct LiveStream {
    state: StreamState,
    /// `None` once the live half is gone (demoted or never attached).
    tx: Option<mpsc::Sender<ServerSseMessage>>,
}

impl LiveStream {
    fn attached(state: StreamState, tx: mpsc::Sender<ServerSseMessage>) -> Self {
        Self {
            state,
            tx: Some(tx),
        }
    }
}

struct WiringInner {
    /// Live half of the standalone stream; the stream's id outlives any
    /// single attachment.
    common: Option<LiveStream>,
    /// One entry per in-flight client request, keyed by request id.
    requests: HashMap<RequestId, LiveStream>,
    /// Pending `initialize` responder.
    initialize: Option<(RequestId, oneshot::Sender<Bytes>)>,
}

/// Per-session live state shared between the manager and the session's
/// [`SessionSender`].
pub(crate) struct SessionWiring {
    session_id: SessionId,
    common_stream_id: StreamId,
    to_service_tx: mpsc::Sender<InboundMessage>,
    channel_capacity: usize,
    sse_retry: Option<Duration>,
    inner: Mutex<WiringInner>,
}

/// The embedder's handle to one session: a stream of inbound client
/// messages and a sender for outbound server messages.
pub struct SessionTransport {
    pub inbound: mpsc::Receiver<InboundMessage>,
    pub sender: SessionSender,
}

/// Outbound half of a session. Cheap to clone; delivery within one session
/// is serialized, so event ids, retention order, and live push order always
/// agree.
#[derive(Clone)]
pub struct SessionSender {
    wiring: Arc<SessionWiring>,
    events: Arc<dyn EventStore>,
    cancellations: Arc<CancellationRegistry>,
}

enum Route {
    RequestWise(RequestId),
    Common,
}

impl SessionSender {
    pub fn session_id(&self) -> &SessionId {
        &self.wiring.session_id
    }

    /// Deliver one server→client message: answer a pending initialize, or
    /// route to the right stream, retain it if its kind calls for that, and
    /// push it live when the stream still has a live half.
    ///
    /// Never blocks on a slow client: a full or closed live channel demotes
    /// the stream to polling instead.
    pub async fn send(&self, message: ServerMessage) -> Result<(), SessionError> {
        let mut inner = self.wiring.inner.lock().await;

        if message.kind == MessageKind::Response {
            let answers_initialize = matches!(
                (&inner.initialize, &message.request_id),
                (Some((pending, _)), Some(id)) if pending == id
            );
            if answers_initialize && let Some((_, responder)) = inner.initialize.take() {
                drop(inner);
                let _ = responder.send(message.payload);
                return Ok(());
            }
        }

        let route = match (message.kind, &message.request_id) {
            (MessageKind::Response, Some(id)) if inner.requests.contains_key(id) => {
                Route::RequestWise(id.clone())
            }
            _ => Route::Common,
        };

        match route {
            Route::RequestWise(request_id) => {
                let stream_id = match inner.requests.get(&request_id) {
                    Some(slot) => slot.state.stream_id().clone(),
                    None => return Ok(()),
                };
                let event_id = self.store(&stream_id, &message).await?;
                if let Some(slot) = inner.requests.get_mut(&request_id) {
                    push_live(slot, frame(event_id, self.wiring.sse_retry, &message));
                    // one response ends the request's stream
                    slot.state.close();
                }
                inner.requests.remove(&request_id);
                drop(inner);
                self.cancellations
                    .complete(&self.wiring.session_id, &request_id)
                    .await;
            }
            Route::Common => {
                let stream_id = self.wiring.common_stream_id.clone();
                let event_id = self.store(&stream_id, &message).await?;
                if let Some(live) = inner.common.as_mut() {
                    push_live(live, frame(event_id, self.wiring.sse_retry, &message));
                }
            }
        }
        Ok(())
    }

    async fn store(
        &self,
        stream_id: &StreamId,
        message: &ServerMessage,
    ) -> Result<EventId, SessionError> {
        let session_id = &self.wiring.session_id;
        let event_id = self.events.next_event_id(session_id, stream_id).await?;
        self.events
            .store_event(
                session_id,
                stream_id,
                StreamEvent {
                    event_id: event_id.clone(),
                    kind: message.kind,
                    payload: message.payload.clone(),
                },
            )
            .await?;
        Ok(event_id)
    }
}

fn frame(event_id: EventId, retry: Option<Duration>, message: &ServerMessage) -> ServerSseMessage {
    ServerSseMessage {
        event_id: Some(event_id),
        retry,
        message: message.payload.clone(),
    }
}

/// Offer a frame to a live half. Backpressure or a gone receiver demotes the
/// stream to polling; anything the client still needs is already stored.
fn push_live(live: &mut LiveStream, frame: ServerSseMessage) {
    if let Some(event_id) = &frame.event_id {
        live.state.record_sequence(event_id.sequence());
    }
    if !live.state.is_live() {
        return;
    }
    let Some(tx) = &live.tx else {
        return;
    };
    if let Err(err) = tx.try_send(frame) {
        tracing::debug!(
            stream_id = %live.state.stream_id(),
            full = matches!(err, mpsc::error::TrySendError::Full(_)),
            "live push failed, demoting stream to polling"
        );
        let _ = live.state.begin_polling();
        live.tx = None;
    }
}

/// In-process [`SessionManager`] over injected stores.
pub struct LocalSessionManager<S = LocalSessionStore, E = LocalEventStore> {
    store: Arc<S>,
    events: Arc<E>,
    cancellations: Arc<CancellationRegistry>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    live: RwLock<HashMap<SessionId, Arc<SessionWiring>>>,
}

impl LocalSessionManager {
    /// Build a manager over fresh in-memory stores and the system clock.
    pub fn new(config: SessionConfig) -> Result<Self, ConfigError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let events = Arc::new(LocalEventStore::new(
            EventRetention {
                sliding: config.event_sliding_expiry,
                absolute: config.event_absolute_expiry,
            },
            config.sse_retry,
            clock.clone(),
        ));
        Self::with_stores(Arc::new(LocalSessionStore::new()), events, config, clock)
    }
}

impl<S: SessionStore, E: EventStore> LocalSessionManager<S, E> {
    /// Build a manager over explicitly injected stores and clock. The
    /// configuration is validated here, once, before anything runs.
    pub fn with_stores(
        store: Arc<S>,
        events: Arc<E>,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            events,
            cancellations: Arc::new(CancellationRegistry::new()),
            clock,
            config,
            live: RwLock::new(HashMap::new()),
        })
    }

    pub fn session_store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn event_store(&self) -> &Arc<E> {
        &self.events
    }

    pub fn cancellations(&self) -> &Arc<CancellationRegistry> {
        &self.cancellations
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Stop holding the live response of `stream_id` open and let the client
    /// poll with `Last-Event-ID` instead. Everything the client still needs
    /// is in the event store already (events are stored before any live
    /// push), so the transition needs no extra flush.
    pub async fn switch_to_polling(
        &self,
        session_id: &SessionId,
        stream_id: &StreamId,
    ) -> Result<(), SessionError> {
        let wiring = self.wiring(session_id).await?;
        let mut inner = wiring.inner.lock().await;
        let live = if wiring.common_stream_id == *stream_id {
            inner.common.as_mut()
        } else {
            inner
                .requests
                .values_mut()
                .find(|slot| slot.state.stream_id() == stream_id)
        };
        if let Some(live) = live {
            live.state
                .begin_polling()
                .map_err(|_| SessionError::TransportClosed)?;
            live.tx = None;
            tracing::debug!(%session_id, %stream_id, "stream switched to polling");
        }
        Ok(())
    }

    async fn wiring(&self, id: &SessionId) -> Result<Arc<SessionWiring>, SessionError> {
        self.live
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession(id.clone()))
    }

    async fn touch(&self, id: &SessionId) -> Result<(), SessionError> {
        self.store.update_activity(id, self.clock.now()).await?;
        Ok(())
    }

    async fn teardown(&self, id: &SessionId) -> Result<(), SessionError> {
        self.live.write().await.remove(id);
        self.cancellations.drop_session(id).await;
        self.events.remove_session(id).await?;
        self.store.remove(id).await?;
        Ok(())
    }
}

impl<S: SessionStore, E: EventStore> Reap for LocalSessionManager<S, E> {
    /// One sweep: prune idle sessions from the store, tear down their live
    /// wiring, retained events and cancellation entries, then expire old
    /// events everywhere.
    async fn reap(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let pruned = self.store.prune_idle(self.config.idle_timeout, now).await?;
        if !pruned.is_empty() {
            let mut live = self.live.write().await;
            for id in &pruned {
                live.remove(id);
            }
            drop(live);
            for id in &pruned {
                self.cancellations.drop_session(id).await;
                self.events.remove_session(id).await?;
            }
        }
        let expired_events = self.events.clean_expired(now).await?;
        Ok(SweepReport {
            pruned_sessions: pruned.len(),
            expired_events,
        })
    }
}

impl<S: SessionStore, E: EventStore> SessionManager for LocalSessionManager<S, E> {
    type Error = SessionError;
    type Transport = SessionTransport;

    async fn create_session(&self) -> Result<(SessionId, SessionTransport), SessionError> {
        let id = session_id();
        let now = self.clock.now();
        self.store
            .save(SessionMetadata::new(id.clone(), now))
            .await?;

        let (to_service_tx, inbound) = mpsc::channel(self.config.channel_capacity);
        let wiring = Arc::new(SessionWiring {
            session_id: id.clone(),
            common_stream_id: stream_id(),
            to_service_tx,
            channel_capacity: self.config.channel_capacity,
            sse_retry: self.config.sse_retry,
            inner: Mutex::new(WiringInner {
                common: None,
                requests: HashMap::new(),
                initialize: None,
            }),
        });
        self.live.write().await.insert(id.clone(), wiring.clone());
        tracing::info!(session_id = %id, "session created");

        let sender = SessionSender {
            wiring,
            events: self.events.clone(),
            cancellations: self.cancellations.clone(),
        };
        Ok((id, SessionTransport { inbound, sender }))
    }

    async fn initialize_session(
        &self,
        id: &SessionId,
        message: ClientMessage,
    ) -> Result<Bytes, SessionError> {
        if !message.is_initialize_request() {
            return Err(SessionError::ExpectedInitializeRequest);
        }
        let request_id = message
            .request_id
            .clone()
            .ok_or(SessionError::NotARequest)?;
        let wiring = self.wiring(id).await?;

        let (responder, response) = oneshot::channel();
        wiring.inner.lock().await.initialize = Some((request_id, responder));
        wiring
            .to_service_tx
            .send(InboundMessage {
                message,
                cancellation: None,
            })
            .await
            .map_err(|_| SessionError::TransportClosed)?;

        response
            .await
            .map_err(|_| SessionError::InitializeInterrupted)
    }

    async fn has_session(&self, id: &SessionId) -> Result<bool, SessionError> {
        Ok(self.store.get(id).await?.is_some())
    }

    async fn close_session(&self, id: &SessionId) -> Result<(), SessionError> {
        tracing::info!(session_id = %id, "session closed");
        self.teardown(id).await
    }

    #[allow(refining_impl_trait)]
    async fn create_stream(
        &self,
        id: &SessionId,
        message: ClientMessage,
    ) -> Result<ReceiverStream<ServerSseMessage>, SessionError> {
        if message.kind != MessageKind::Request {
            return Err(SessionError::NotARequest);
        }
        let request_id = message
            .request_id
            .clone()
            .ok_or(SessionError::NotARequest)?;
        let wiring = self.wiring(id).await?;
        self.touch(id).await?;

        let rx = {
            let mut inner = wiring.inner.lock().await;
            if inner.requests.contains_key(&request_id) {
                return Err(SessionError::DuplicatedRequestId(request_id));
            }
            let (tx, rx) = mpsc::channel(wiring.channel_capacity);
            inner.requests.insert(
                request_id.clone(),
                LiveStream::attached(StreamState::new(stream_id()), tx),
            );
            rx
        };

        let token = self
            .cancellations
            .register(id.clone(), request_id.clone())
            .await;
        let forwarded = wiring
            .to_service_tx
            .send(InboundMessage {
                message,
                cancellation: Some(token),
            })
            .await;
        if forwarded.is_err() {
            wiring.inner.lock().await.requests.remove(&request_id);
            self.cancellations.complete(id, &request_id).await;
            return Err(SessionError::TransportClosed);
        }
        Ok(ReceiverStream::new(rx))
    }

    async fn accept_message(
        &self,
        id: &SessionId,
        message: ClientMessage,
    ) -> Result<(), SessionError> {
        let wiring = self.wiring(id).await?;
        self.touch(id).await?;

        if let Some(cancelled) = message.cancelled_params() {
            // fire-and-forget: unknown or finished requests are silent no-ops
            self.cancellations
                .cancel(id, &cancelled.request_id, cancelled.reason.as_deref())
                .await;
        }
        wiring
            .to_service_tx
            .send(InboundMessage {
                message,
                cancellation: None,
            })
            .await
            .map_err(|_| SessionError::TransportClosed)
    }

    async fn create_standalone_stream(
        &self,
        id: &SessionId,
    ) -> Result<impl Stream<Item = ServerSseMessage> + Send + 'static, SessionError> {
        let wiring = self.wiring(id).await?;
        self.touch(id).await?;

        let (tx, rx) = mpsc::channel(wiring.channel_capacity);
        let mut inner = wiring.inner.lock().await;
        // a new attachment is a fresh stream instance on the same stream id;
        // any previous live half ends when its sender drops
        inner.common = Some(LiveStream::attached(
            StreamState::new(wiring.common_stream_id.clone()),
            tx,
        ));
        drop(inner);
        Ok(ReceiverStream::new(rx))
    }

    async fn resume(
        &self,
        id: &SessionId,
        last_event_id: &str,
    ) -> Result<BoxStream<'static, ServerSseMessage>, SessionError> {
        let watermark: EventId = last_event_id.parse()?;
        let wiring = self.wiring(id).await?;
        self.touch(id).await?;

        // Snapshot and re-attach under the wiring lock: sends serialize on
        // the same lock, so no event can land between the replay snapshot
        // and the new live half being installed.
        let mut inner = wiring.inner.lock().await;
        let replay = self
            .events
            .replay_after(&watermark)
            .await?
            .map(|stored: StoredEvent| ServerSseMessage {
                event_id: Some(stored.event_id),
                retry: stored.retry,
                message: stored.payload,
            });

        let live_rx = if *watermark.stream_id() == wiring.common_stream_id {
            let (tx, rx) = mpsc::channel(wiring.channel_capacity);
            inner.common = Some(LiveStream::attached(
                StreamState::new(wiring.common_stream_id.clone()),
                tx,
            ));
            Some(rx)
        } else if let Some(slot) = inner
            .requests
            .values_mut()
            .find(|slot| slot.state.stream_id() == watermark.stream_id())
        {
            let (tx, rx) = mpsc::channel(wiring.channel_capacity);
            *slot = LiveStream::attached(StreamState::new(watermark.stream_id().clone()), tx);
            Some(rx)
        } else {
            // completed or expired stream: replay is all there is, the
            // client falls back to a fresh stream
            None
        };
        drop(inner);

        tracing::debug!(session_id = %id, %last_event_id, live = live_rx.is_some(), "resuming stream");
        match live_rx {
            Some(rx) => Ok(replay.chain(ReceiverStream::new(rx)).boxed()),
            None => Ok(replay.boxed()),
        }
    }
}
