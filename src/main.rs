use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;

use meetup_chat_service::config::Settings;
use meetup_chat_service::server::{create_app, AppState};
use meetup_chat_service::shutdown::GracefulShutdown;
use meetup_chat_service::tasks::HeartbeatTask;
use meetup_chat_service::telemetry::init_telemetry;
use meetup_chat_service::websocket::ChatGateway;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Logging and tracing; the guard flushes spans on drop
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!("Configuration loaded");

    let state = AppState::new(settings.clone()).await?;
    tracing::info!(backend = state.store.backend_name(), "Application state initialized");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Start heartbeat task in background
    let heartbeat_task = HeartbeatTask::new(
        settings.websocket.clone(),
        state.gateway.clone(),
        state.db_circuit_breaker.clone(),
        shutdown_tx.subscribe(),
    );
    let heartbeat_handle = tokio::spawn(async move {
        heartbeat_task.run().await;
    });

    let gateway = state.gateway.clone();
    let app = create_app(state);

    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler(gateway, shutdown_tx))
        .await?;

    tracing::info!("Waiting for background tasks to finish...");
    let _ = heartbeat_handle.await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal_handler(gateway: Arc<ChatGateway>, shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let reason = tokio::select! {
        _ = ctrl_c => "interrupt",
        _ = terminate => "terminate",
    };
    tracing::info!(signal = reason, "Initiating graceful shutdown");

    let result = GracefulShutdown::new(gateway, shutdown_tx)
        .execute("Server restarting")
        .await;
    tracing::info!(
        clients_notified = result.clients_notified,
        connections_closed = result.connections_closed,
        duration_ms = result.duration.as_millis() as u64,
        "Clients drained"
    );
}
