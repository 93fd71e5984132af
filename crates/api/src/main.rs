//! API server entry point.

use std::sync::Arc;

use api::AppState;
use api::config::{Config, LogFormat};
use metrics_exporter_prometheus::PrometheusHandle;
use redemption_store::{OutboxRelay, PostgresRedemptionStore, RedemptionStore, TracingPublisher};
use saga::{BalanceLedger, PostgresBalanceLedger};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

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
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Resumes interrupted sagas, starts the outbox relay and serves HTTP until
/// a shutdown signal arrives.
async fn serve<S, L>(
    config: &Config,
    state: Arc<AppState<S, L>>,
    store: S,
    metrics_handle: PrometheusHandle,
) where
    S: RedemptionStore + Clone + 'static,
    L: BalanceLedger + 'static,
{
    let coordinator = state.coordinator.clone();
    tokio::spawn(async move {
        match coordinator.resume_in_flight().await {
            Ok(resumed) => tracing::info!(count = resumed.len(), "in-flight redemptions resumed"),
            Err(e) => tracing::error!(error = %e, "failed to resume in-flight redemptions"),
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay = OutboxRelay::new(store, TracingPublisher)
        .with_batch_size(config.outbox_batch_size)
        .with_poll_interval(config.outbox_poll_interval);
    let relay_task = tokio::spawn(async move { relay.run(shutdown_rx).await });

    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    let _ = shutdown_tx.send(true);
    if let Err(e) = relay_task.await {
        tracing::warn!(error = %e, "outbox relay task ended abnormally");
    }
}

#[tokio::main]
async fn main() {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env().expect("invalid configuration");
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Build stores and serve
    let saga_config = config.saga_config();
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(url)
                .await
                .expect("failed to connect to database");
            let store = PostgresRedemptionStore::new(pool.clone());
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL stores");

            let ledger = PostgresBalanceLedger::new(pool);
            let state = api::create_state(store.clone(), ledger, saga_config);
            serve(&config, state, store, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory stores with demo balances");
            let (state, store, _ledger) = api::create_in_memory_state(saga_config);
            serve(&config, state, store, metrics_handle).await;
        }
    }

    tracing::info!("server shut down gracefully");
}
