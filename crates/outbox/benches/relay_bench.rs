use std::sync::Arc;

use common::{AggregateId, IdempotencyKey};
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{AggregateKind, NewOutboxEvent};
use outbox::{InMemoryJobDispatcher, OutboxRelay, RelayConfig};
use saga_store::{InMemorySagaStore, OutboxStore};
use serde_json::json;

/// Fills a store with `n` pending rows spread over the aggregate kinds.
async fn populate(store: &InMemorySagaStore, n: usize) {
    let events = (0..n)
        .map(|i| {
            let kind = AggregateKind::ALL[i % AggregateKind::ALL.len()];
            let aggregate_id = AggregateId::new();
            let data = match kind {
                AggregateKind::Saga => {
                    json!({ "correlation_id": format!("bench-{i}"), "saga_id": aggregate_id })
                }
                AggregateKind::Order => json!({ "order_id": aggregate_id, "i": i }),
                _ => json!({ "i": i }),
            };
            NewOutboxEvent::new(
                kind.as_str(),
                aggregate_id,
                "BenchEvent",
                Some(data),
                IdempotencyKey::derive(["bench".to_string(), i.to_string()]),
            )
        })
        .collect();
    store.append(events).await.unwrap();
}

fn bench_poll_100(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("outbox/poll_batch_of_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemorySagaStore::new();
                populate(&store, 100).await;
                let relay = OutboxRelay::new(
                    store,
                    Arc::new(InMemoryJobDispatcher::new()),
                    RelayConfig::default(),
                );
                relay.poll_once().await.unwrap();
            });
        });
    });
}

criterion_group!(benches, bench_poll_100);
criterion_main!(benches);
