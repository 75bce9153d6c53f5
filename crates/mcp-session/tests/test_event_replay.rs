use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use mcp_session::{
    Clock, EventId, EventRetention, EventStore, LocalEventStore, ManualClock, MessageKind,
    StreamEvent,
    model::{SessionId, StreamId, session_id, stream_id},
};
use tokio::task::JoinSet;

fn store() -> (Arc<LocalEventStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store = LocalEventStore::new(
        EventRetention {
            sliding: Duration::from_secs(300),
            absolute: Duration::from_secs(1800),
        },
        Some(Duration::from_millis(1000)),
        clock.clone(),
    );
    (Arc::new(store), clock)
}

async fn store_request(
    store: &LocalEventStore,
    session: &SessionId,
    stream: &StreamId,
    payload: &[u8],
) -> EventId {
    let event_id = store.next_event_id(session, stream).await.unwrap();
    let retained = store
        .store_event(
            session,
            stream,
            StreamEvent {
                event_id: event_id.clone(),
                kind: MessageKind::Request,
                payload: Bytes::copy_from_slice(payload),
            },
        )
        .await
        .unwrap();
    assert!(retained);
    event_id
}

#[tokio::test]
async fn replay_after_the_kth_event_yields_exactly_the_suffix_in_order() {
    let (store, _) = store();
    let session = session_id();
    let stream = stream_id();

    let n = 8;
    let mut ids = Vec::new();
    for i in 0..n {
        let payload = format!(r#"{{"jsonrpc":"2.0","id":{i},"method":"roots/list"}}"#);
        ids.push(store_request(&store, &session, &stream, payload.as_bytes()).await);
    }

    for k in 0..n {
        let replayed: Vec<_> = store
            .replay_after(&ids[k])
            .await
            .unwrap()
            .collect::<Vec<_>>()
            .await;
        let expected: Vec<_> = ids[k + 1..].to_vec();
        assert_eq!(
            replayed.iter().map(|e| e.event_id.clone()).collect::<Vec<_>>(),
            expected,
            "replay after event {k} must be events {}..{n}",
            k + 1
        );
    }
}

#[tokio::test]
async fn replayed_payload_is_byte_identical() {
    let (store, _) = store();
    let session = session_id();
    let stream = stream_id();

    let payload = r#"{"jsonrpc":"2.0","id":"s-1","method":"sampling/createMessage","params":{"x":"é\n"}}"#.as_bytes();
    let id = store_request(&store, &session, &stream, payload).await;

    // a watermark one below the stored id selects exactly that event
    let watermark = EventId::new(stream.clone(), id.sequence() - 1);
    let replayed: Vec<_> = store
        .replay_after(&watermark)
        .await
        .unwrap()
        .collect::<Vec<_>>()
        .await;
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].event_id, id);
    assert_eq!(replayed[0].payload.as_ref(), payload);
}

#[tokio::test]
async fn replay_against_an_unknown_stream_is_empty_not_an_error() {
    let (store, _) = store();
    let watermark = EventId::new(stream_id(), 1);
    let replayed = store.replay_after(&watermark).await.unwrap().count().await;
    assert_eq!(replayed, 0);
}

#[tokio::test]
async fn concurrent_allocation_never_duplicates_ids() {
    let (store, _) = store();
    let session = session_id();
    let stream = stream_id();

    let mut tasks = JoinSet::new();
    for _ in 0..100 {
        let store = store.clone();
        let session = session.clone();
        let stream = stream.clone();
        tasks.spawn(async move { store.next_event_id(&session, &stream).await.unwrap() });
    }
    let mut sequences = Vec::new();
    while let Some(result) = tasks.join_next().await {
        sequences.push(result.unwrap().sequence());
    }
    sequences.sort_unstable();
    sequences.dedup();
    assert_eq!(sequences.len(), 100);
}

#[tokio::test]
async fn expired_window_means_resume_from_scratch() {
    let (store, clock) = store();
    let session = session_id();
    let stream = stream_id();
    let id = store_request(&store, &session, &stream, b"{}").await;

    // the client comes back long after both expiry windows
    clock.advance(Duration::from_secs(3600));
    store.clean_expired(clock.now()).await.unwrap();

    let replayed = store.replay_after(&id).await.unwrap().count().await;
    assert_eq!(replayed, 0, "an expired stream replays as empty");
    assert_eq!(store.stream_count().await, 0, "no map entry may linger");
}
