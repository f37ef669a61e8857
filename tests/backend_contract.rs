//! Behavior every session backend must share.

use serde_json::json;
use sessionvault::sessions::{
    Event, GetSessionConfig, InMemorySessionService, RemoteSessionService, SessionKey,
    SessionService, SqliteSessionService, StateMap,
};
use std::sync::Arc;

fn backends() -> Vec<Arc<dyn SessionService>> {
    vec![
        Arc::new(InMemorySessionService::new()),
        Arc::new(SqliteSessionService::open_in_memory().expect("in-memory sqlite")),
        Arc::new(RemoteSessionService::fallback_only()),
    ]
}

fn state(pairs: &[(&str, serde_json::Value)]) -> StateMap {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn temp_keys_never_reach_stored_state() {
    for service in backends() {
        let session = service
            .create_session("app1", "u1", state(&[("x", json!(1))]), Some("s1"))
            .await
            .unwrap();
        service
            .append_event(
                &session,
                Event::new("inv", "agent")
                    .with_state_delta([("x", json!(2)), ("temp:y", json!("ignored"))]),
            )
            .await
            .unwrap();

        let fetched = service
            .get_session(&SessionKey::new("app1", "u1", "s1"), None)
            .await
            .unwrap();
        assert_eq!(fetched.get_state("x"), Some(json!(2)), "{}", service.name());
        assert_eq!(fetched.get_state("temp:y"), None, "{}", service.name());
        assert_eq!(session.get_state("x"), Some(json!(2)), "{}", service.name());
    }
}

#[tokio::test]
async fn repeated_reads_are_identical() {
    for service in backends() {
        let session = service
            .create_session("app1", "u1", StateMap::new(), None)
            .await
            .unwrap();
        for i in 0..3 {
            service
                .append_event(
                    &session,
                    Event::new("inv", "user")
                        .with_text("user", format!("turn {i}"))
                        .with_state_delta([(format!("k{i}"), json!(i))]),
                )
                .await
                .unwrap();
        }
        let key = session.key();
        let first = service.get_session(&key, None).await.unwrap();
        let second = service.get_session(&key, None).await.unwrap();
        assert_eq!(first.events(), second.events(), "{}", service.name());
        assert_eq!(
            first.state_snapshot(),
            second.state_snapshot(),
            "{}",
            service.name()
        );
    }
}

#[tokio::test]
async fn partial_events_change_nothing() {
    for service in backends() {
        let session = service
            .create_session("app1", "u1", state(&[("x", json!(1))]), None)
            .await
            .unwrap();
        let key = session.key();
        let before = service.get_session(&key, None).await.unwrap();

        let partial = Event::new("inv", "agent")
            .with_text("model", "streaming...")
            .with_state_delta([("x", json!(42))])
            .as_partial();
        let returned = service.append_event(&session, partial.clone()).await.unwrap();
        assert_eq!(returned, partial);

        let after = service.get_session(&key, None).await.unwrap();
        assert_eq!(
            service.list_events(&key).await.unwrap().events.len(),
            0,
            "{}",
            service.name()
        );
        assert_eq!(before.state_snapshot(), after.state_snapshot());
    }
}

#[tokio::test]
async fn events_come_back_in_append_order() {
    for service in backends() {
        let session = service
            .create_session("app1", "u1", StateMap::new(), None)
            .await
            .unwrap();
        let mut expected = Vec::new();
        for i in 0..20 {
            let event = service
                .append_event(&session, Event::new("inv", "user").with_text("user", format!("{i}")))
                .await
                .unwrap();
            expected.push(event.id);
        }
        let listed: Vec<String> = service
            .list_events(&session.key())
            .await
            .unwrap()
            .events
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(listed, expected, "{}", service.name());
    }
}

#[tokio::test]
async fn tail_filter_returns_last_k_in_order() {
    for service in backends() {
        let session = service
            .create_session("app1", "u1", StateMap::new(), None)
            .await
            .unwrap();
        let mut ids = Vec::new();
        for i in 0..6 {
            let event = service
                .append_event(&session, Event::new("inv", "user").with_text("user", format!("{i}")))
                .await
                .unwrap();
            ids.push(event.id);
        }
        let tail = service
            .get_session(&session.key(), Some(&GetSessionConfig::recent(2)))
            .await
            .unwrap();
        let tail_ids: Vec<String> = tail.events().into_iter().map(|e| e.id).collect();
        assert_eq!(tail_ids, ids[4..], "{}", service.name());
    }
}

#[tokio::test]
async fn backends_agree_on_state() {
    let deltas = [
        vec![("x", json!(1)), ("temp:scratch", json!(true))],
        vec![("y", json!({"nested": [1, 2]})), ("app:theme", json!("dark"))],
        vec![("x", json!(3)), ("user:lang", json!("en"))],
    ];

    let mut snapshots = Vec::new();
    for service in backends() {
        let session = service
            .create_session("app1", "u1", state(&[("seed", json!("s"))]), Some("shared"))
            .await
            .unwrap();
        for delta in &deltas {
            service
                .append_event(
                    &session,
                    Event::new("inv", "agent").with_state_delta(delta.iter().cloned()),
                )
                .await
                .unwrap();
        }
        let fetched = service.get_session(&session.key(), None).await.unwrap();
        snapshots.push((service.name().to_string(), fetched.state_snapshot()));
    }

    let (reference_name, reference) = &snapshots[0];
    for (name, snapshot) in &snapshots[1..] {
        assert_eq!(snapshot, reference, "{name} disagrees with {reference_name}");
    }
}

#[tokio::test]
async fn list_sessions_returns_metadata_only() {
    for service in backends() {
        for id in ["a", "b"] {
            let session = service
                .create_session("app1", "u1", state(&[("x", json!(1))]), Some(id))
                .await
                .unwrap();
            service
                .append_event(&session, Event::new("inv", "user").with_text("user", "hi"))
                .await
                .unwrap();
        }
        let listed = service.list_sessions("app1", "u1").await.unwrap();
        assert_eq!(listed.len(), 2, "{}", service.name());
        for session in &listed {
            assert_eq!(session.event_count(), 0);
            assert!(session.state_snapshot().is_empty());
        }
        assert!(service.list_sessions("app1", "nobody").await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn deleting_unknown_session_is_not_found() {
    for service in backends() {
        service
            .create_session("app1", "u1", StateMap::new(), Some("keep"))
            .await
            .unwrap();
        let err = service
            .delete_session(&SessionKey::new("app1", "u1", "missing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found(), "{}", service.name());
        assert_eq!(service.list_sessions("app1", "u1").await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn duplicate_session_ids_are_rejected() {
    for service in backends() {
        service
            .create_session("app1", "u1", StateMap::new(), Some("dup"))
            .await
            .unwrap();
        let err = service
            .create_session("app1", "u1", StateMap::new(), Some("dup"))
            .await
            .unwrap_err();
        assert!(err.is_duplicate(), "{}", service.name());
    }
}

#[tokio::test]
async fn concurrent_disjoint_deltas_all_survive() {
    for service in backends() {
        let session = service
            .create_session("app1", "u1", StateMap::new(), Some("busy"))
            .await
            .unwrap();
        let key = session.key();
        let mut handles = Vec::new();
        for worker in 0..4 {
            let service = Arc::clone(&service);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let own = service.get_session(&key, None).await.unwrap();
                for i in 0..5 {
                    service
                        .append_event(
                            &own,
                            Event::new("inv", "agent")
                                .with_state_delta([(format!("w{worker}-{i}"), json!(i))]),
                        )
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let fetched = service.get_session(&key, None).await.unwrap();
        assert_eq!(fetched.event_count(), 20, "{}", service.name());
        assert_eq!(fetched.state_snapshot().len(), 20, "{}", service.name());
    }
}

#[tokio::test]
async fn caller_copies_converge_with_storage_after_interleaved_appends() {
    for service in backends() {
        service
            .create_session("app1", "u1", StateMap::new(), Some("shared"))
            .await
            .unwrap();
        let key = SessionKey::new("app1", "u1", "shared");
        let first = service.get_session(&key, None).await.unwrap();
        let second = service.get_session(&key, None).await.unwrap();

        for (copy, field) in [(&first, "a1"), (&second, "b1"), (&first, "a2"), (&second, "b2")] {
            service
                .append_event(
                    copy,
                    Event::new("inv", "agent").with_state_delta([(field, json!(true))]),
                )
                .await
                .unwrap();
            let stored = service.get_session(&key, None).await.unwrap();
            assert_eq!(copy.events(), stored.events(), "{} after {field}", service.name());
            assert_eq!(
                copy.state_snapshot(),
                stored.state_snapshot(),
                "{} after {field}",
                service.name()
            );
        }
        assert_eq!(second.event_count(), 4, "{}", service.name());
    }
}
