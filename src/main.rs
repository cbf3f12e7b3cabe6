use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use agent_gateway::api;
use agent_gateway::config::{Config, DriverKind};
use agent_gateway::driver::{Driver, KubernetesDriver, LocalProcessDriver};
use agent_gateway::session::{SessionManager, manager::run_reaper};
use agent_gateway::share::{MemoryShareStore, ShareStore};
use agent_gateway::store::AppState;
use agent_gateway::webhook::store::{ConfigMapWebhookStore, MemoryWebhookStore, WebhookStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("GATEWAY_LOG").unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().json())
        .init();

    let config = Arc::new(Config::load());

    let (driver, webhooks): (Driver, Arc<dyn WebhookStore>) = match config.driver {
        DriverKind::LocalProcess => (
            Driver::LocalProcess(LocalProcessDriver::new(config.clone())),
            Arc::new(MemoryWebhookStore::new()),
        ),
        DriverKind::Kubernetes => {
            let client = kube::Client::try_default().await?;
            (
                Driver::Kubernetes(KubernetesDriver::new(client.clone(), config.clone())),
                Arc::new(ConfigMapWebhookStore::new(client, config.namespace.clone())),
            )
        }
    };

    let sessions = Arc::new(SessionManager::new(config.clone(), Arc::new(driver)));
    match sessions.resync().await {
        Ok(count) => tracing::info!(count, "session index rebuilt from driver"),
        Err(e) => tracing::warn!(error = %e, "session discovery failed, starting empty"),
    }

    let shares: Arc<dyn ShareStore> = Arc::new(MemoryShareStore::new());
    let state = AppState::new(config.clone(), sessions.clone(), webhooks, shares);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    tokio::spawn(run_reaper(sessions, shutdown_rx));

    let app = api::router(state);

    let addr: SocketAddr = config.listen.parse()?;
    tracing::info!(%addr, driver = ?config.driver, "starting agent gateway");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(());
    tracing::info!("agent gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
