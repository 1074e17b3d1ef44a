use crate::config::MonitoringConfig;
use crate::coordinator::DetectionCoordinator;
use crate::events::{EventBus, MonitorEvent};
use crate::frame::{SessionStatus, StreamMode};
use crate::frame_source::{FrameSource, FrameSourceError};
use crate::settings::SettingsHandle;
use crate::telemetry::Metrics;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{sleep, timeout, Duration},
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("A session is already {0:?}")]
    AlreadyRunning(SessionStatus),
    #[error("Connectivity check failed: {0}")]
    Connectivity(#[from] FrameSourceError),
}

#[derive(Clone)]
pub struct FrameSources {
    pub live: Arc<dyn FrameSource>,
    pub simulated: Arc<dyn FrameSource>,
}

impl FrameSources {
    fn for_mode(&self, mode: StreamMode) -> Arc<dyn FrameSource> {
        match mode {
            StreamMode::Live => self.live.clone(),
            StreamMode::Simulated => self.simulated.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StreamSession {
    pub mode: StreamMode,
    pub status: SessionStatus,
    pub cadence_ms: u64,
}

#[derive(Default)]
struct Lifecycle {
    cancel_token: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

pub struct StreamScheduler {
    sources: FrameSources,
    coordinator: Arc<DetectionCoordinator>,
    settings: SettingsHandle,
    monitoring: MonitoringConfig,
    events: EventBus,
    metrics: Arc<Metrics>,
    session: RwLock<(StreamMode, SessionStatus)>,
    lifecycle: Mutex<Lifecycle>,
}

impl StreamScheduler {
    pub fn new(
        sources: FrameSources,
        coordinator: Arc<DetectionCoordinator>,
        monitoring: MonitoringConfig,
        events: EventBus,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            sources,
            settings: coordinator.settings().clone(),
            coordinator,
            session: RwLock::new((monitoring.mode, SessionStatus::Disconnected)),
            monitoring,
            events,
            metrics,
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn session(&self) -> StreamSession {
        let (mode, status) = *self.session.read();
        StreamSession {
            mode,
            status,
            cadence_ms: self.settings.cadence_ms(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.session.read().1
    }

    fn transition(&self, status: SessionStatus) {
        let previous = {
            let mut session = self.session.write();
            std::mem::replace(&mut session.1, status)
        };
        if previous != status {
            tracing::info!("Stream session {:?} -> {:?}", previous, status);
            self.events
                .publish(MonitorEvent::SessionStatusChanged { status });
        }
    }

    /// Probes the source for `mode`, then refreshes immediately and keeps
    /// refreshing every cadence interval until `stop`.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>, mode: StreamMode) -> Result<(), SchedulerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let status = self.status();
        if matches!(status, SessionStatus::Connecting | SessionStatus::Streaming) {
            return Err(SchedulerError::AlreadyRunning(status));
        }

        self.session.write().0 = mode;
        self.transition(SessionStatus::Connecting);

        let source = self.sources.for_mode(mode);
        let probe_timeout_ms = self.monitoring.get_probe_timeout_ms(mode);
        let probe = match timeout(Duration::from_millis(probe_timeout_ms), source.probe()).await {
            Ok(result) => result,
            Err(_) => Err(FrameSourceError::ProbeTimeout(probe_timeout_ms)),
        };

        if let Err(e) = probe {
            tracing::error!("Could not reach {} frame source: {}", mode.as_str(), e);
            self.transition(SessionStatus::Disconnected);
            self.events.publish(MonitorEvent::ConnectivityFailed {
                message: e.to_string(),
            });
            return Err(SchedulerError::Connectivity(e));
        }

        self.coordinator.activate(mode);
        self.transition(SessionStatus::Streaming);
        self.refresh(source.as_ref(), mode).await;

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(self.clone().run(source, mode, cancel_token.clone()));
        lifecycle.cancel_token = Some(cancel_token);
        lifecycle.handle = Some(handle);

        Ok(())
    }

    /// Cancels the cadence timer and forgets the alert and evaluated frames.
    /// Classifications already in flight finish but their results are
    /// dropped. Safe to call repeatedly.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.status() == SessionStatus::Stopped {
            return;
        }

        if let Some(token) = lifecycle.cancel_token.take() {
            token.cancel();
        }
        if let Some(handle) = lifecycle.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!("Cadence task failed to join: {:?}", e);
            }
        }

        self.coordinator.deactivate().await;
        self.transition(SessionStatus::Stopped);
    }

    async fn run(
        self: Arc<Self>,
        source: Arc<dyn FrameSource>,
        mode: StreamMode,
        cancel_token: CancellationToken,
    ) {
        loop {
            let cadence = Duration::from_millis(self.settings.cadence_ms());
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                _ = sleep(cadence) => {}
            }
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                _ = self.refresh(source.as_ref(), mode) => {}
            }
        }
        tracing::info!("Cadence timer cancelled");
    }

    /// A failed refresh keeps the previous frame and alert; the next tick
    /// simply tries again.
    async fn refresh(&self, source: &dyn FrameSource, mode: StreamMode) {
        match source.fetch_next_frame().await {
            Ok(frame) => {
                let identity = frame.identity().clone();
                tracing::debug!("Frame {} is now current", identity);
                self.metrics.record_frame_refreshed(mode.as_str());
                self.coordinator.on_frame_ready(frame);
                self.events.publish(MonitorEvent::FrameRefreshed { identity });
            }
            Err(e) => {
                tracing::warn!("Frame refresh failed, keeping previous frame: {}", e);
                self.metrics.record_frame_fetch_failure(mode.as_str());
                self.events.publish(MonitorEvent::FrameFetchFailed {
                    message: e.to_string(),
                });
            }
        }
    }
}
