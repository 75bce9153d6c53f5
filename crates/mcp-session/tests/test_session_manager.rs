use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use mcp_session::{
    ClientMessage, LocalSessionManager, RequestId, ServerMessage, SessionConfig, SessionError,
    SessionManager, SessionTransport, StreamMode,
    model::session_id,
};

fn config() -> SessionConfig {
    SessionConfig {
        sse_keep_alive: None,
        ..Default::default()
    }
}

fn manager() -> Arc<LocalSessionManager> {
    Arc::new(LocalSessionManager::new(config()).unwrap())
}

fn message(raw: &str) -> ClientMessage {
    ClientMessage::classify(bytes::Bytes::copy_from_slice(raw.as_bytes())).unwrap()
}

async fn open_session(
    manager: &Arc<LocalSessionManager>,
) -> (mcp_session::SessionId, SessionTransport) {
    manager.create_session().await.unwrap()
}

#[tokio::test]
async fn initialize_round_trips_through_the_embedder() {
    let manager = manager();
    let (id, mut transport) = open_session(&manager).await;

    let consumer = tokio::spawn(async move {
        let inbound = transport.inbound.recv().await.unwrap();
        assert!(inbound.message.is_initialize_request());
        let request_id = inbound.message.request_id.clone().unwrap();
        transport
            .sender
            .send(ServerMessage::response(
                request_id,
                r#"{"jsonrpc":"2.0","id":1,"result":{"capabilities":{}}}"#,
            ))
            .await
            .unwrap();
    });

    let response = manager
        .initialize_session(
            &id,
            message(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#),
        )
        .await
        .unwrap();
    assert!(
        std::str::from_utf8(&response)
            .unwrap()
            .contains("capabilities")
    );
    consumer.await.unwrap();
}

#[tokio::test]
async fn initialize_requires_an_initialize_request() {
    let manager = manager();
    let (id, _transport) = open_session(&manager).await;

    let err = manager
        .initialize_session(
            &id,
            message(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::ExpectedInitializeRequest));
}

#[tokio::test]
async fn duplicate_request_ids_within_a_session_are_rejected() {
    let manager = manager();
    let (id, mut transport) = open_session(&manager).await;

    // hold the first request open by not answering it
    let _stream = manager
        .create_stream(&id, message(r#"{"jsonrpc":"2.0","id":5,"method":"a"}"#))
        .await
        .unwrap();
    let _ = transport.inbound.recv().await;

    let err = manager
        .create_stream(&id, message(r#"{"jsonrpc":"2.0","id":5,"method":"b"}"#))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::DuplicatedRequestId(RequestId::Number(5))
    ));
}

#[tokio::test]
async fn operations_on_an_unknown_session_report_it() {
    let manager = manager();
    let ghost = session_id();

    assert!(!manager.has_session(&ghost).await.unwrap());
    let err = manager
        .accept_message(
            &ghost,
            message(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::UnknownSession(_)));
}

#[tokio::test]
async fn demoted_stream_keeps_storing_and_replays_on_resume() {
    let manager = manager();
    let (id, transport) = open_session(&manager).await;
    let sender = transport.sender;

    // live standalone stream; one event arrives on it
    let mut live = manager.create_standalone_stream(&id).await.unwrap().boxed();
    let first = r#"{"jsonrpc":"2.0","id":"srv-1","method":"roots/list"}"#;
    sender
        .send(ServerMessage::request(RequestId::from("srv-1"), first))
        .await
        .unwrap();
    let delivered = tokio::time::timeout(Duration::from_secs(1), live.next())
        .await
        .unwrap()
        .unwrap();
    let watermark = delivered.event_id.clone().unwrap();
    assert_eq!(delivered.message.as_ref(), first.as_bytes());

    // the server frees the connection slot: no more live delivery
    manager
        .switch_to_polling(&id, watermark.stream_id())
        .await
        .unwrap();
    let second = r#"{"jsonrpc":"2.0","id":"srv-2","method":"roots/list"}"#;
    sender
        .send(ServerMessage::request(RequestId::from("srv-2"), second))
        .await
        .unwrap();
    let ended = tokio::time::timeout(Duration::from_secs(1), live.next())
        .await
        .unwrap();
    assert!(ended.is_none(), "demotion ends the live response");

    // a poll with the watermark is an ordinary replay and catches up
    let replayed: Vec<_> = manager
        .resume(&id, &watermark.to_string())
        .await
        .unwrap()
        .take(1)
        .collect()
        .await;
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].message.as_ref(), second.as_bytes());
    assert!(replayed[0].event_id.clone().unwrap().sequence() > watermark.sequence());
}

#[tokio::test]
async fn stream_modes_only_move_forward() {
    let mut state = mcp_session::StreamState::new(mcp_session::model::stream_id());
    assert_eq!(state.mode(), StreamMode::Streaming);
    state.begin_polling().unwrap();
    state.close();
    assert!(state.begin_polling().is_err());
}

#[tokio::test]
async fn close_session_tears_everything_down() {
    let manager = manager();
    let (id, transport) = open_session(&manager).await;
    transport
        .sender
        .send(ServerMessage::request(
            RequestId::from("srv-1"),
            r#"{"jsonrpc":"2.0","id":"srv-1","method":"roots/list"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(manager.event_store().stream_count().await, 1);

    manager.close_session(&id).await.unwrap();
    assert!(!manager.has_session(&id).await.unwrap());
    assert_eq!(manager.event_store().stream_count().await, 0);
    assert!(manager.session_store().is_empty().await);
}
