//! API server entry point.

use std::sync::Arc;

use api::config::Config;
use router::ROLE_ADMIN;
use saga_log::{InMemorySagaLog, PostgresSagaLog, SagaLog};
use tokio::signal;
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

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Open the saga log
    let log: Arc<dyn SagaLog> = match &config.database_url {
        Some(url) => {
            tracing::info!("using PostgreSQL saga log");
            Arc::new(
                PostgresSagaLog::connect(url)
                    .await
                    .expect("failed to open PostgreSQL saga log"),
            )
        }
        None => {
            tracing::warn!("DATABASE_URL not set, sagas will not survive a restart");
            Arc::new(InMemorySagaLog::new())
        }
    };

    // 4. Build application state
    let state = api::create_default_state(&config, log);
    if let Some(admin) = &config.admin {
        match state
            .services
            .users
            .create_user(&admin.username, &admin.password, &[ROLE_ADMIN])
        {
            Ok(user_id) => tracing::info!(%user_id, username = %admin.username, "admin account created"),
            Err(e) => tracing::warn!(error = %e, "admin account not created"),
        }
    }

    // 5. Resume sagas interrupted by the previous shutdown
    let report = state
        .coordinator
        .recover()
        .await
        .expect("saga recovery failed");
    for (saga_id, error) in &report.errors {
        tracing::warn!(%saga_id, %error, "saga left for the next recovery");
    }

    // 6. Build the application
    let app = api::create_app(state, metrics_handle);

    // 7. Start server
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("server shut down gracefully");
}
