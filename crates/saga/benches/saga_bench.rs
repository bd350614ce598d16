use std::sync::Arc;

use common::{AggregateId, CorrelationId};
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{Money, OrderItem, UserId};
use saga::{
    Capabilities, InMemoryInventoryService, InMemoryNotificationService, InMemoryPaymentService,
    OrchestratorConfig, SagaOrchestrator, StartSagaRequest,
};
use saga_store::InMemorySagaStore;

fn orchestrator() -> SagaOrchestrator<InMemorySagaStore> {
    let capabilities = Capabilities::new(
        Arc::new(InMemoryInventoryService::new()),
        Arc::new(InMemoryPaymentService::new()),
        Arc::new(InMemoryNotificationService::new()),
    );
    SagaOrchestrator::new(
        InMemorySagaStore::new(),
        capabilities,
        OrchestratorConfig::default(),
    )
}

fn request() -> StartSagaRequest {
    StartSagaRequest {
        correlation_id: CorrelationId::generate(),
        order_id: AggregateId::new(),
        user_id: UserId::new(),
        items: vec![
            OrderItem::new("SKU-001", 2, Money::from_cents(1000)),
            OrderItem::new("SKU-002", 1, Money::from_cents(2500)),
        ],
    }
}

fn bench_happy_path(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let orchestrator = orchestrator();

    c.bench_function("saga/happy_path_six_steps", |b| {
        b.to_async(&rt).iter(|| async {
            let saga = orchestrator.start_saga(request()).await.unwrap();
            orchestrator
                .execute_saga(saga.correlation_id())
                .await
                .unwrap();
        });
    });
}

fn bench_start_only(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let orchestrator = orchestrator();

    c.bench_function("saga/start", |b| {
        b.to_async(&rt).iter(|| async {
            orchestrator.start_saga(request()).await.unwrap();
        });
    });
}

criterion_group!(benches, bench_happy_path, bench_start_only);
criterion_main!(benches);
