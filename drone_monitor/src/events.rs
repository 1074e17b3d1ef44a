use crate::detection::{AttemptStatus, CaptureTrigger, DiseaseClass};
use crate::frame::{FrameIdentity, SessionStatus};
use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

/// User-facing notifications. Connectivity and capture failures are always
/// published; transient failures are published as notices.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    SessionStatusChanged {
        status: SessionStatus,
    },
    ConnectivityFailed {
        message: String,
    },
    FrameRefreshed {
        identity: FrameIdentity,
    },
    FrameFetchFailed {
        message: String,
    },
    DetectionCompleted {
        identity: FrameIdentity,
        status: AttemptStatus,
    },
    AlertRaised {
        disease_class: DiseaseClass,
        confidence_percent: f32,
    },
    AlertCleared,
    ClassificationFailed {
        message: String,
    },
    CaptureHandedOff {
        trigger: CaptureTrigger,
        disease_class: DiseaseClass,
    },
    CaptureFailed {
        message: String,
    },
}

impl MonitorEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MonitorEvent::SessionStatusChanged { .. } => "session_status_changed",
            MonitorEvent::ConnectivityFailed { .. } => "connectivity_failed",
            MonitorEvent::FrameRefreshed { .. } => "frame_refreshed",
            MonitorEvent::FrameFetchFailed { .. } => "frame_fetch_failed",
            MonitorEvent::DetectionCompleted { .. } => "detection_completed",
            MonitorEvent::AlertRaised { .. } => "alert_raised",
            MonitorEvent::AlertCleared => "alert_cleared",
            MonitorEvent::ClassificationFailed { .. } => "classification_failed",
            MonitorEvent::CaptureHandedOff { .. } => "capture_handed_off",
            MonitorEvent::CaptureFailed { .. } => "capture_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: MonitorEvent) {
        tracing::debug!("Publishing monitor event {}", event.name());
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
