use crate::classifier::HttpClassifier;
use crate::config::Config;
use crate::coordinator::DetectionCoordinator;
use crate::events::EventBus;
use crate::frame::StreamMode;
use crate::frame_source::HttpFrameSource;
use crate::handoff::{CaptureHandoffService, FileHandoffSink};
use crate::scheduler::{FrameSources, StreamScheduler};
use crate::server::{HttpServer, SharedState};
use crate::settings::{MonitorSettings, SettingsHandle};
use crate::telemetry::Metrics;

use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let metrics = match Metrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => {
            tracing::error!("Failed to initialize metrics: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let client = reqwest::Client::builder().build()?;
    let settings = SettingsHandle::new(MonitorSettings::from_config(
        &config.monitoring,
        &config.classifier,
    ));
    if let Err(e) = settings.snapshot().validate() {
        tracing::error!("Invalid monitoring configuration: {}", e);
        return Err(Box::new(e));
    }

    let events = EventBus::new();
    let classifier = Arc::new(HttpClassifier::new(
        client.clone(),
        settings.clone(),
        &config.classifier,
    ));
    let handoff = Arc::new(CaptureHandoffService::new(
        Box::new(FileHandoffSink::new(config.handoff.path.clone())),
        config.handoff.jpeg_quality,
    ));
    let coordinator = Arc::new(DetectionCoordinator::new(
        classifier,
        handoff,
        settings,
        events.clone(),
        metrics.clone(),
    ));

    let sources = FrameSources {
        live: Arc::new(HttpFrameSource::new(
            client.clone(),
            StreamMode::Live,
            &config.frame_source,
            &config.monitoring,
        )),
        simulated: Arc::new(HttpFrameSource::new(
            client,
            StreamMode::Simulated,
            &config.frame_source,
            &config.monitoring,
        )),
    };
    let scheduler = Arc::new(StreamScheduler::new(
        sources,
        coordinator.clone(),
        config.monitoring.clone(),
        events.clone(),
        metrics.clone(),
    ));

    let state = SharedState {
        scheduler: scheduler.clone(),
        coordinator,
        events,
        metrics,
    };
    let server = HttpServer::new(state, &config.server).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_shutdown_rx = shutdown_tx.subscribe();

    let server_handle = server.run(server_shutdown_rx).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    scheduler.stop().await;
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
