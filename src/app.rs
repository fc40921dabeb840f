use crate::config::Config;
use crate::model::MockModel;
use crate::orchestrator::{ControlSignal, StreamOrchestrator, StreamSettings};
use crate::server::{HttpServer, SharedState};
use crate::store::SqliteStore;
use crate::telemetry::Metrics;

use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

const CONTROL_CHANNEL_CAPACITY: usize = 64;

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let store = match SqliteStore::connect(&config.database).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("Failed to open database: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let metrics = Arc::new(Metrics::new()?);
    let orchestrator = StreamOrchestrator::new(
        store.clone(),
        store.clone(),
        Arc::new(MockModel::default()),
        StreamSettings::from_config(&config),
        metrics.clone(),
    );

    let (control_tx, _) = broadcast::channel(CONTROL_CHANNEL_CAPACITY);
    let state = SharedState {
        store,
        orchestrator,
        camera_config: config.camera.clone(),
        control: control_tx.clone(),
        metrics,
    };

    let server = HttpServer::new(state, &config.server).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = control_tx.send(ControlSignal::Shutdown);
    let _ = shutdown_tx.send(());
    let _ = server_handle.await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
