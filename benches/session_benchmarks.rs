use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use serde_json::json;
use sessionvault::sessions::{
    Event, GetSessionConfig, InMemorySessionService, SessionService, SqliteSessionService,
    StateMap,
};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn backends() -> Vec<Arc<dyn SessionService>> {
    vec![
        Arc::new(InMemorySessionService::new()),
        Arc::new(SqliteSessionService::open_in_memory().expect("in-memory sqlite")),
    ]
}

fn bench_append(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("append_event");

    for service in backends() {
        let session = Arc::new(
            rt.block_on(service.create_session("bench", "u1", StateMap::new(), None))
                .expect("create session"),
        );
        group.bench_function(service.name().to_string(), |b| {
            b.to_async(&rt).iter_batched(
                || {
                    Event::new("inv", "agent")
                        .with_text("model", "benchmark turn")
                        .with_state_delta([("counter", json!(1)), ("temp:scratch", json!("x"))])
                },
                |event| {
                    let service = Arc::clone(&service);
                    let session = Arc::clone(&session);
                    async move { service.append_event(&session, event).await.expect("append") }
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_get_tail(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("get_session_tail");

    for service in backends() {
        let session = rt
            .block_on(service.create_session("bench", "u1", StateMap::new(), None))
            .expect("create session");
        rt.block_on(async {
            for i in 0..500 {
                service
                    .append_event(
                        &session,
                        Event::new("inv", "user").with_text("user", format!("message {i}")),
                    )
                    .await
                    .expect("append");
            }
        });
        let key = session.key();
        let window = GetSessionConfig::recent(20);
        group.bench_function(service.name().to_string(), |b| {
            b.to_async(&rt).iter(|| {
                let service = Arc::clone(&service);
                let key = key.clone();
                let window = window.clone();
                async move {
                    service
                        .get_session(&key, Some(&window))
                        .await
                        .expect("get session")
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_append, bench_get_tail);
criterion_main!(benches);
