//! Streamable HTTP front end.
//!
//! A `tower_service::Service` that speaks the streamable HTTP transport:
//! POST carries client messages in (and opens per-request SSE response
//! streams), GET opens the standalone stream or resumes one from
//! `Last-Event-ID`, DELETE closes the session. Every request passes the
//! [`LoopbackGuard`] before anything else.
//!
//! New sessions are handed out on the returned transport channel; whoever
//! owns RPC dispatch consumes transports from there, one task per session,
//! the same way it would consume accepted connections.

use std::{convert::Infallible, fmt::Display, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::{Stream, StreamExt, future, stream};
use http::{Method, Request, Response, StatusCode, header};
use http_body::Frame;
use http_body_util::{BodyExt, Full, StreamBody, combinators::UnsyncBoxBody};
use tokio::sync::mpsc;
use tokio_stream::wrappers::IntervalStream;

use crate::{
    config::SessionConfig,
    http_header::{
        EVENT_STREAM_MIME_TYPE, HEADER_LAST_EVENT_ID, HEADER_SESSION_ID,
        HEADER_X_ACCEL_BUFFERING, JSON_MIME_TYPE,
    },
    manager::SessionManager,
    model::{ClientMessage, MessageKind, ServerSseMessage, SessionId},
    security::{ForbiddenError, LoopbackGuard},
};

pub type BoxResponseBody = UnsyncBoxBody<Bytes, Infallible>;

pub struct StreamableHttpService<M: SessionManager> {
    manager: Arc<M>,
    guard: LoopbackGuard,
    sse_keep_alive: Option<Duration>,
    transport_tx: mpsc::UnboundedSender<(SessionId, M::Transport)>,
}

impl<M: SessionManager> Clone for StreamableHttpService<M> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            guard: self.guard.clone(),
            sse_keep_alive: self.sse_keep_alive,
            transport_tx: self.transport_tx.clone(),
        }
    }
}

impl<M: SessionManager> StreamableHttpService<M> {
    /// Build the service. The returned receiver yields one transport per
    /// newly created session; dropping it makes the server refuse new
    /// sessions.
    pub fn new(
        manager: Arc<M>,
        config: &SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<(SessionId, M::Transport)>) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        (
            Self {
                manager,
                guard: LoopbackGuard::new(config.allowed_hosts.iter().cloned()),
                sse_keep_alive: config.sse_keep_alive,
                transport_tx,
            },
            transport_rx,
        )
    }

    async fn handle<B>(&self, req: Request<B>) -> Response<BoxResponseBody>
    where
        B: http_body::Body + Send + 'static,
        B::Error: Display,
    {
        if let Err(rejected) = self.guard.check(req.headers()) {
            tracing::warn!(%rejected, "request rejected at the boundary");
            return forbidden(rejected);
        }
        let method = req.method().clone();
        if method == Method::GET {
            self.handle_get(req).await
        } else if method == Method::POST {
            self.handle_post(req).await
        } else if method == Method::DELETE {
            self.handle_delete(req).await
        } else {
            text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
        }
    }

    async fn handle_get<B>(&self, req: Request<B>) -> Response<BoxResponseBody>
    where
        B: http_body::Body + Send + 'static,
    {
        if !accept_contains(&req, &[EVENT_STREAM_MIME_TYPE]) {
            return text_response(
                StatusCode::NOT_ACCEPTABLE,
                "Not Acceptable: Client must accept text/event-stream",
            );
        }
        let Some(session_id) = session_id_of(&req) else {
            return text_response(
                StatusCode::UNAUTHORIZED,
                "Unauthorized: Session ID is required",
            );
        };
        match self.manager.has_session(&session_id).await {
            Ok(true) => {}
            Ok(false) => {
                return text_response(StatusCode::UNAUTHORIZED, "Unauthorized: Session not found");
            }
            Err(error) => return internal_error(error),
        }

        let last_event_id = req
            .headers()
            .get(HEADER_LAST_EVENT_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        match last_event_id {
            Some(last_event_id) => {
                if last_event_id.parse::<crate::model::EventId>().is_err() {
                    return text_response(
                        StatusCode::BAD_REQUEST,
                        "Bad Request: malformed Last-Event-ID",
                    );
                }
                tracing::debug!(%session_id, %last_event_id, "resuming stream from last event");
                match self.manager.resume(&session_id, &last_event_id).await {
                    Ok(stream) => self.sse_response(stream),
                    Err(error) => internal_error(error),
                }
            }
            None => {
                tracing::debug!(%session_id, "creating standalone stream");
                match self.manager.create_standalone_stream(&session_id).await {
                    Ok(stream) => self.sse_response(stream),
                    Err(error) => internal_error(error),
                }
            }
        }
    }

    async fn handle_post<B>(&self, req: Request<B>) -> Response<BoxResponseBody>
    where
        B: http_body::Body + Send + 'static,
        B::Error: Display,
    {
        if !accept_contains(&req, &[JSON_MIME_TYPE, EVENT_STREAM_MIME_TYPE]) {
            return text_response(
                StatusCode::NOT_ACCEPTABLE,
                "Not Acceptable: Client must accept both application/json and text/event-stream",
            );
        }
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        if !content_type.is_some_and(|value| value.starts_with(JSON_MIME_TYPE)) {
            return text_response(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "Unsupported Media Type: Content-Type must be application/json",
            );
        }

        let session_id = session_id_of(&req);
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(error) => {
                return text_response(
                    StatusCode::BAD_REQUEST,
                    format!("Bad Request: failed to read body: {error}"),
                );
            }
        };
        let message = match ClientMessage::classify(body) {
            Ok(message) => message,
            Err(error) => {
                return text_response(StatusCode::BAD_REQUEST, format!("Bad Request: {error}"));
            }
        };

        match session_id {
            Some(session_id) => self.post_to_session(session_id, message).await,
            None => self.open_session(message).await,
        }
    }

    async fn post_to_session(
        &self,
        session_id: SessionId,
        message: ClientMessage,
    ) -> Response<BoxResponseBody> {
        match self.manager.has_session(&session_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(%session_id, "session not found");
                return text_response(StatusCode::UNAUTHORIZED, "Unauthorized: Session not found");
            }
            Err(error) => return internal_error(error),
        }

        match message.kind {
            MessageKind::Request => {
                match self.manager.create_stream(&session_id, message).await {
                    Ok(stream) => self.sse_response(stream),
                    Err(error) => internal_error(error),
                }
            }
            MessageKind::Notification | MessageKind::Response => {
                match self.manager.accept_message(&session_id, message).await {
                    Ok(()) => empty_response(StatusCode::ACCEPTED),
                    Err(error) => internal_error(error),
                }
            }
        }
    }

    /// POST without a session id: the initialize handshake.
    async fn open_session(&self, message: ClientMessage) -> Response<BoxResponseBody> {
        if !message.is_initialize_request() {
            return text_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "Expected initialize request",
            );
        }

        let (session_id, transport) = match self.manager.create_session().await {
            Ok(created) => created,
            Err(error) => return internal_error(error),
        };
        if self
            .transport_tx
            .send((session_id.clone(), transport))
            .is_err()
        {
            tracing::warn!("transport receiver dropped, refusing new session");
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server is shutting down",
            );
        }

        let response = match self.manager.initialize_session(&session_id, message).await {
            Ok(response) => response,
            Err(error) => return internal_error(error),
        };

        // single-frame SSE stream carrying the initialize response; it has
        // no replay id, resumption starts with the streams that follow
        let once = stream::once(future::ready(ServerSseMessage {
            event_id: None,
            retry: None,
            message: response,
        }));
        let mut http_response = self.sse_response(once);
        if let Ok(value) = session_id.as_ref().parse() {
            http_response
                .headers_mut()
                .insert(HEADER_SESSION_ID, value);
        }
        http_response
    }

    async fn handle_delete<B>(&self, req: Request<B>) -> Response<BoxResponseBody>
    where
        B: http_body::Body + Send + 'static,
    {
        let Some(session_id) = session_id_of(&req) else {
            return text_response(
                StatusCode::UNAUTHORIZED,
                "Unauthorized: Session ID is required",
            );
        };
        tracing::debug!(%session_id, "closing session");
        match self.manager.close_session(&session_id).await {
            Ok(()) => empty_response(StatusCode::NO_CONTENT),
            Err(error) => internal_error(error),
        }
    }

    fn sse_response(
        &self,
        stream: impl Stream<Item = ServerSseMessage> + Send + 'static,
    ) -> Response<BoxResponseBody> {
        let frames = stream
            .map(|message| Some(encode_sse_frame(&message)))
            .chain(stream::once(future::ready(None)));
        let merged = match self.sse_keep_alive {
            Some(period) => {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                let pings = IntervalStream::new(interval)
                    .map(|_| Some(Bytes::from_static(b":ping\n\n")));
                stream::select(frames.boxed(), pings.boxed()).boxed()
            }
            None => frames.boxed(),
        };
        let body = merged
            .take_while(|frame| future::ready(frame.is_some()))
            .filter_map(future::ready)
            .map(|bytes| Ok(Frame::data(bytes)));

        let mut response = Response::new(StreamBody::new(body).boxed_unsync());
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            http::HeaderValue::from_static(EVENT_STREAM_MIME_TYPE),
        );
        headers.insert(
            header::CACHE_CONTROL,
            http::HeaderValue::from_static("no-cache"),
        );
        headers.insert(
            HEADER_X_ACCEL_BUFFERING,
            http::HeaderValue::from_static("no"),
        );
        response
    }
}

impl<M, B> tower_service::Service<Request<B>> for StreamableHttpService<M>
where
    M: SessionManager,
    B: http_body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Display,
{
    type Response = Response<BoxResponseBody>;
    type Error = Infallible;
    type Future =
        std::pin::Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle(req).await) })
    }
}

fn encode_sse_frame(message: &ServerSseMessage) -> Bytes {
    let mut out = String::new();
    if let Some(id) = &message.event_id {
        out.push_str(&format!("id: {id}\n"));
    }
    if let Some(retry) = message.retry {
        out.push_str(&format!("retry: {}\n", retry.as_millis()));
    }
    out.push_str("data: ");
    out.push_str(&String::from_utf8_lossy(&message.message));
    out.push_str("\n\n");
    Bytes::from(out)
}

fn accept_contains<B>(req: &Request<B>, needles: &[&str]) -> bool {
    let accept = req
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    needles.iter().all(|needle| accept.contains(needle))
}

fn session_id_of<B>(req: &Request<B>) -> Option<SessionId> {
    req.headers()
        .get(HEADER_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_owned().into())
}

fn forbidden(rejected: ForbiddenError) -> Response<BoxResponseBody> {
    let body = rejected.to_json_body().to_string();
    let mut response = Response::new(Full::new(Bytes::from(body)).boxed_unsync());
    *response.status_mut() = StatusCode::FORBIDDEN;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        http::HeaderValue::from_static(JSON_MIME_TYPE),
    );
    response
}

fn text_response(status: StatusCode, body: impl Into<String>) -> Response<BoxResponseBody> {
    let mut response = Response::new(Full::new(Bytes::from(body.into())).boxed_unsync());
    *response.status_mut() = status;
    response
}

fn empty_response(status: StatusCode) -> Response<BoxResponseBody> {
    let mut response = Response::new(Full::new(Bytes::new()).boxed_unsync());
    *response.status_mut() = status;
    response
}

fn internal_error(error: impl Display) -> Response<BoxResponseBody> {
    tracing::error!(%error, "session manager failure");
    text_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}
