use std::{sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use mcp_session::{
    LocalSessionStore, SessionMetadata, SessionStore, UserIdentity,
    model::session_id,
};
use tokio::task::JoinSet;

#[tokio::test]
async fn concurrent_saves_then_gets_keep_all_sessions_intact() {
    let store = Arc::new(LocalSessionStore::new());
    let now = Utc::now();
    let ids: Vec<_> = (0..100).map(|_| session_id()).collect();

    let mut saves = JoinSet::new();
    for id in ids.clone() {
        let store = store.clone();
        saves.spawn(async move {
            store.save(SessionMetadata::new(id, now)).await.unwrap();
        });
    }
    while saves.join_next().await.is_some() {}

    let mut gets = JoinSet::new();
    for id in ids.clone() {
        let store = store.clone();
        gets.spawn(async move {
            let loaded = store.get(&id).await.unwrap().expect("session lost");
            assert_eq!(loaded.session_id, id);
            assert_eq!(loaded.created_at, now);
            assert_eq!(loaded.last_activity_at, now);
        });
    }
    while let Some(result) = gets.join_next().await {
        result.unwrap();
    }
    assert_eq!(store.len().await, 100);
}

#[tokio::test]
async fn prune_removes_exactly_the_sessions_past_the_timeout() {
    let store = LocalSessionStore::new();
    let idle_timeout = Duration::from_secs(60 * 60);
    let t0 = Utc::now();

    // session a: last active at t0; session b: active 59 minutes later
    let a = SessionMetadata::new(session_id(), t0);
    let mut b = SessionMetadata::new(session_id(), t0);
    b.last_activity_at = t0 + TimeDelta::minutes(59);
    let (a_id, b_id) = (a.session_id.clone(), b.session_id.clone());
    store.save(a).await.unwrap();
    store.save(b).await.unwrap();

    let now = t0 + TimeDelta::minutes(61);
    let removed = store.prune_idle(idle_timeout, now).await.unwrap();

    assert_eq!(removed, vec![a_id.clone()]);
    assert!(store.get(&a_id).await.unwrap().is_none());
    assert!(store.get(&b_id).await.unwrap().is_some());
}

#[tokio::test]
async fn prune_at_exactly_the_timeout_boundary_keeps_the_session() {
    let store = LocalSessionStore::new();
    let t0 = Utc::now();
    let meta = SessionMetadata::new(session_id(), t0);
    let id = meta.session_id.clone();
    store.save(meta).await.unwrap();

    // removal requires strictly more than the timeout to have elapsed
    let removed = store
        .prune_idle(Duration::from_secs(60), t0 + TimeDelta::seconds(60))
        .await
        .unwrap();
    assert!(removed.is_empty());
    assert!(store.get(&id).await.unwrap().is_some());
}

#[tokio::test]
async fn sessions_saved_after_the_prune_instant_survive() {
    let store = LocalSessionStore::new();
    let idle_timeout = Duration::from_secs(60 * 60);
    let t0 = Utc::now();

    let stale = SessionMetadata::new(session_id(), t0);
    let stale_id = stale.session_id.clone();
    store.save(stale).await.unwrap();

    // the reaper computed "now", and a fresh session raced in before the
    // prune pass ran
    let now = t0 + TimeDelta::minutes(61);
    let fresh = SessionMetadata::new(session_id(), now + TimeDelta::seconds(1));
    let fresh_id = fresh.session_id.clone();
    store.save(fresh).await.unwrap();

    let removed = store.prune_idle(idle_timeout, now).await.unwrap();
    assert_eq!(removed, vec![stale_id]);
    assert!(store.get(&fresh_id).await.unwrap().is_some());
}

#[tokio::test]
async fn concurrent_activity_updates_converge_to_the_greatest_timestamp() {
    let store = Arc::new(LocalSessionStore::new());
    let t0 = Utc::now();
    let meta = SessionMetadata::new(session_id(), t0);
    let id = meta.session_id.clone();
    store.save(meta).await.unwrap();

    let mut updates = JoinSet::new();
    for offset in 1..=50i64 {
        let store = store.clone();
        let id = id.clone();
        updates.spawn(async move {
            store
                .update_activity(&id, t0 + TimeDelta::seconds(offset))
                .await
                .unwrap();
        });
    }
    while updates.join_next().await.is_some() {}

    let loaded = store.get(&id).await.unwrap().unwrap();
    assert_eq!(loaded.last_activity_at, t0 + TimeDelta::seconds(50));
}

#[tokio::test]
async fn identity_claims_survive_the_round_trip() {
    let store = LocalSessionStore::new();
    let meta = SessionMetadata::new(session_id(), Utc::now()).with_identity(UserIdentity {
        claim_type: "sub".into(),
        claim_value: "user-129".into(),
        claim_issuer: "https://login.example".into(),
    });
    let id = meta.session_id.clone();
    store.save(meta).await.unwrap();

    let loaded = store.get(&id).await.unwrap().unwrap();
    let identity = loaded.user_identity.expect("authenticated session");
    assert_eq!(identity.claim_value, "user-129");

    // anonymous sessions simply carry no claims
    let anon = SessionMetadata::new(session_id(), Utc::now());
    assert!(anon.user_identity.is_none());
}

#[tokio::test]
async fn clear_empties_the_store() {
    let store = LocalSessionStore::new();
    for _ in 0..5 {
        store
            .save(SessionMetadata::new(session_id(), Utc::now()))
            .await
            .unwrap();
    }
    store.clear().await.unwrap();
    assert!(store.is_empty().await);
}
