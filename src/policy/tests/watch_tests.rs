// src/policy/tests/watch_tests.rs

use futures::StreamExt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, ResiliencePolicy};
use crate::policy::{PolicyEngine, PolicyEventType};

#[tokio::test]
async fn test_watcher_sees_create_update_delete() {
    let engine = PolicyEngine::default();
    let cancel = CancellationToken::new();
    let mut events = Box::pin(engine.watch_policies(cancel.clone()));

    engine.update_policy(ResiliencePolicy::new("cart")).unwrap();
    engine.update_policy(ResiliencePolicy::new("cart")).unwrap();
    engine.delete_policy("cart").unwrap();

    let created = events.next().await.unwrap();
    assert_eq!(created.event_type, PolicyEventType::Created);
    assert_eq!(created.policy_name, "cart");
    assert_eq!(created.version, 1);

    let updated = events.next().await.unwrap();
    assert_eq!(updated.event_type, PolicyEventType::Updated);
    assert_eq!(updated.version, 2);

    let deleted = events.next().await.unwrap();
    assert_eq!(deleted.event_type, PolicyEventType::Deleted);
    assert_eq!(deleted.version, 2);
}

#[tokio::test]
async fn test_every_watcher_gets_every_event() {
    let engine = PolicyEngine::default();
    let cancel = CancellationToken::new();
    let first = engine.watch_policies(cancel.clone());
    let second = engine.watch_policies(cancel.clone());

    for name in ["a", "b", "c"] {
        engine.update_policy(ResiliencePolicy::new(name)).unwrap();
    }

    let first: Vec<_> = first.take(3).map(|e| e.policy_name).collect().await;
    let second: Vec<_> = second.take(3).map(|e| e.policy_name).collect().await;
    assert_eq!(first, vec!["a", "b", "c"]);
    assert_eq!(second, first);
}

#[tokio::test]
async fn test_cancellation_ends_stream() {
    let engine = PolicyEngine::default();
    let cancel = CancellationToken::new();
    let mut events = Box::pin(engine.watch_policies(cancel.clone()));

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let next = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .expect("stream should end promptly after cancellation");
    assert!(next.is_none());
}

#[tokio::test]
async fn test_lagging_watcher_skips_oldest() {
    let config = EngineConfig {
        watch_capacity: 2,
        ..EngineConfig::default()
    };
    let engine = PolicyEngine::new(&config);
    let cancel = CancellationToken::new();
    let events = engine.watch_policies(cancel.clone());

    for name in ["p1", "p2", "p3", "p4", "p5"] {
        engine.update_policy(ResiliencePolicy::new(name)).unwrap();
    }

    let received: Vec<_> = events.take(2).map(|e| e.policy_name).collect().await;
    assert_eq!(received, vec!["p4", "p5"]);
}
