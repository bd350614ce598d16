//! HTTP API server and background workers for the order saga engine.
//!
//! Wires the saga orchestrator, the outbox relay and the saga job consumer
//! together, and exposes a thin REST surface to start, inspect and cancel
//! sagas, with structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod jobs;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    Capabilities, InMemoryInventoryService, InMemoryNotificationService, InMemoryPaymentService,
    SagaOrchestrator,
};
use saga_store::{OutboxStore, SagaStore};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;

/// Bound shared by every store the API can run on.
pub trait AppStore: SagaStore + OutboxStore + Clone + 'static {}

impl<S: SagaStore + OutboxStore + Clone + 'static> AppStore for S {}

/// The in-process capability clients the server runs against.
#[derive(Debug, Clone, Default)]
pub struct InMemoryServices {
    pub inventory: InMemoryInventoryService,
    pub payment: InMemoryPaymentService,
    pub notification: InMemoryNotificationService,
}

impl InMemoryServices {
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::new(
            Arc::new(self.inventory.clone()),
            Arc::new(self.payment.clone()),
            Arc::new(self.notification.clone()),
        )
    }
}

/// Shared application state accessible from all handlers.
pub struct AppState<S: AppStore> {
    pub orchestrator: Arc<SagaOrchestrator<S>>,
    pub store: S,
    pub services: InMemoryServices,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: AppStore>(state: Arc<AppState<S>>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/sagas", post(routes::sagas::start::<S>))
        .route("/sagas/{correlation_id}", get(routes::sagas::get::<S>))
        .route(
            "/sagas/{correlation_id}/cancel",
            post(routes::sagas::cancel::<S>),
        )
        .route(
            "/circuit-breakers",
            get(routes::circuit_breakers::list::<S>),
        )
        .route("/outbox/parked", get(routes::outbox::parked::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates the default application state: in-memory capability clients and
/// an orchestrator tuned by `config`.
pub fn create_default_state<S: AppStore>(store: S, config: &Config) -> Arc<AppState<S>> {
    let services = InMemoryServices::default();
    let orchestrator = SagaOrchestrator::new(
        store.clone(),
        services.capabilities(),
        config.orchestrator_config(),
    );

    Arc::new(AppState {
        orchestrator: Arc::new(orchestrator),
        store,
        services,
    })
}
