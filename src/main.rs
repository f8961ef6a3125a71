use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;

use ara_broker_core::broker::Broker;
use ara_broker_core::config::Settings;
use ara_broker_core::delivery::TaskScheduler;
use ara_broker_core::observe::{SharedObserver, TelemetryObserver};
use ara_broker_core::server::{create_app, AppState};
use ara_broker_core::store::{create_durable_store, MessageStore};
use ara_broker_core::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Arc::new(Settings::new()?);
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!("Configuration loaded");

    let observer: SharedObserver = Arc::new(TelemetryObserver::new());
    let durable_store = create_durable_store(&settings).await?;
    let store = Arc::new(MessageStore::new(durable_store, observer.clone()));
    let scheduler = Arc::new(TaskScheduler::new(&settings.delivery));
    let broker = Arc::new(Broker::new(
        store,
        scheduler,
        observer,
        &settings.broker,
        &settings.delivery,
    ));

    for queue_name in &settings.broker.durable_queues {
        broker.declare_queue(queue_name, true, false).await?;
    }
    let report = broker.recover().await?;
    tracing::info!(
        queues = broker.queue_count(),
        in_doubt = report.in_doubt,
        "Broker started"
    );

    let state = AppState::new(broker.clone());
    let app = create_app(state);

    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Admin server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    broker.shutdown().await;
    tracing::info!("Broker shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
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

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
