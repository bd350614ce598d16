//! API server entry point.

use std::sync::Arc;

use api::AppStore;
use api::config::{Config, LogFormat};
use metrics_exporter_prometheus::PrometheusHandle;
use outbox::{InMemoryJobDispatcher, OutboxRelay, SAGA_QUEUE};
use saga::{RecoverySweeper, SagaWorkerPool};
use saga_store::{InMemorySagaStore, PostgresSagaStore};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = Config::from_env();
    init_tracing(&config);

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("failed to install Prometheus recorder: {e}"))?;

    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await?;
            let store = PostgresSagaStore::new(pool);
            store.run_migrations().await?;
            tracing::info!("using postgres saga store");
            run(store, config, metrics_handle).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set, saga state lives in memory only");
            run(InMemorySagaStore::new(), config, metrics_handle).await
        }
    }
}

/// Starts the background workers and serves HTTP until a shutdown signal.
async fn run<S: AppStore>(
    store: S,
    config: Config,
    metrics_handle: PrometheusHandle,
) -> Result<(), BoxError> {
    let state = api::create_default_state(store.clone(), &config);

    // Saga jobs stay in this process: the relay enqueues, the consumer runs them.
    let dispatcher = InMemoryJobDispatcher::new();
    let saga_jobs = dispatcher.subscribe(SAGA_QUEUE).await;
    let relay = OutboxRelay::new(store, Arc::new(dispatcher), config.relay_config());
    let sweeper = RecoverySweeper::new(state.orchestrator.clone());
    let pool = SagaWorkerPool::new(state.orchestrator.clone(), config.saga_worker_concurrency);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = JoinSet::new();

    let relay_shutdown = shutdown_rx.clone();
    workers.spawn(async move { relay.run(relay_shutdown).await });

    let sweep_shutdown = shutdown_rx.clone();
    let sweep_interval = config.recovery_sweep_interval;
    workers.spawn(async move { sweeper.run(sweep_interval, sweep_shutdown).await });

    workers.spawn(api::jobs::consume_saga_jobs(saga_jobs, pool, shutdown_rx));

    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Stop the workers even if the server failed.
    let _ = shutdown_tx.send(true);
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            tracing::error!(error = %err, "background worker panicked");
        }
    }

    served?;
    tracing::info!("server shut down gracefully");
    Ok(())
}
