use crate::classifier::{ClassificationError, ClassifierClient};
use crate::detection::{
    AttemptStatus, CaptureTrigger, DetectionAttempt, DetectionResult, Verdict,
};
use crate::events::{EventBus, MonitorEvent};
use crate::fallback::{self, FallbackStrategy};
use crate::frame::{FrameIdentity, FrameRef, StreamMode};
use crate::handoff::{CaptureError, CaptureHandoffService};
use crate::identity::FrameIdentityTracker;
use crate::settings::{MonitorSettings, SettingsError, SettingsHandle, SettingsUpdate};
use crate::telemetry::Metrics;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManualCaptureError {
    #[error("No stream session is running")]
    NotStreaming,
    #[error("No frame is displayed yet")]
    NoFrame,
    #[error("A classification is already in progress")]
    Busy,
    #[error("The stream session ended before the classification finished")]
    SessionEnded,
    #[error(transparent)]
    Classification(#[from] ClassificationError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("Manual capture task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

struct ActiveSession {
    generation: u64,
    mode: StreamMode,
    fallback: Arc<dyn FallbackStrategy>,
    frames_seen: u64,
}

#[derive(Default)]
struct CoordinatorState {
    session: Option<ActiveSession>,
    next_generation: u64,
    tracker: FrameIdentityTracker,
    /// Single-flight flag: the frame whose classification is outstanding.
    pending: Option<FrameIdentity>,
    current: Option<FrameRef>,
    alert: Option<DetectionResult>,
    last_attempt: Option<DetectionAttempt>,
}

impl CoordinatorState {
    fn is_current(&self, identity: &FrameIdentity) -> bool {
        self.current
            .as_ref()
            .is_some_and(|frame| frame.identity() == identity)
    }

    fn clear_alert(&mut self) -> bool {
        self.alert.take().is_some()
    }
}

/// Everything one classification needs once the lock is released.
struct Attempt {
    frame: FrameRef,
    generation: u64,
    fallback: Arc<dyn FallbackStrategy>,
    frame_index: u64,
}

/// What a finished attempt turned into after recovery.
struct Completion {
    status: AttemptStatus,
    effective: Option<DetectionResult>,
    error: Option<ClassificationError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorSnapshot {
    pub current_frame: Option<FrameIdentity>,
    pub pending: Option<FrameIdentity>,
    pub last_attempt: Option<DetectionAttempt>,
    pub alert: Option<DetectionResult>,
}

pub struct DetectionCoordinator {
    classifier: Arc<dyn ClassifierClient>,
    handoff: Arc<CaptureHandoffService>,
    settings: SettingsHandle,
    events: EventBus,
    metrics: Arc<Metrics>,
    state: Mutex<CoordinatorState>,
    /// Held across a handoff so `deactivate` cannot slip in between the
    /// session check and the delivery.
    handoff_gate: tokio::sync::Mutex<()>,
}

impl DetectionCoordinator {
    pub fn new(
        classifier: Arc<dyn ClassifierClient>,
        handoff: Arc<CaptureHandoffService>,
        settings: SettingsHandle,
        events: EventBus,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            classifier,
            handoff,
            settings,
            events,
            metrics,
            state: Mutex::new(CoordinatorState::default()),
            handoff_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    /// Starts accepting frames for a new session. Results of attempts begun
    /// under an earlier session are discarded when they land.
    pub fn activate(&self, mode: StreamMode) {
        let mut state = self.state.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        state.session = Some(ActiveSession {
            generation,
            mode,
            fallback: fallback::for_mode(mode),
            frames_seen: 0,
        });
        state.tracker.reset();
        state.current = None;
        state.alert = None;
        state.last_attempt = None;
        tracing::info!("Detection active for {} session {}", mode.as_str(), generation);
    }

    /// Ends the session. Waits for a handoff already being delivered, so no
    /// record lands once this returns.
    pub async fn deactivate(&self) {
        let _delivering = self.handoff_gate.lock().await;
        let had_alert = {
            let mut state = self.state.lock();
            state.session = None;
            state.tracker.reset();
            state.current = None;
            state.clear_alert()
        };
        if had_alert {
            self.events.publish(MonitorEvent::AlertCleared);
        }
    }

    /// Installs `frame` as the displayed frame and classifies it if it has
    /// not been evaluated and no other classification is outstanding.
    pub fn on_frame_ready(self: &Arc<Self>, frame: FrameRef) {
        let had_alert = {
            let mut state = self.state.lock();
            if state.session.is_none() {
                tracing::debug!("Ignoring frame {} outside a session", frame.identity());
                return;
            }
            if state.is_current(frame.identity()) {
                false
            } else {
                if let Some(session) = state.session.as_mut() {
                    session.frames_seen += 1;
                }
                state.tracker.retain_only(frame.identity());
                state.current = Some(frame);
                state.clear_alert()
            }
        };
        if had_alert {
            self.events.publish(MonitorEvent::AlertCleared);
        }
        self.try_begin();
    }

    pub fn alert(&self) -> Option<DetectionResult> {
        self.state.lock().alert.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let state = self.state.lock();
        CoordinatorSnapshot {
            current_frame: state.current.as_ref().map(|f| f.identity().clone()),
            pending: state.pending.clone(),
            last_attempt: state.last_attempt.clone(),
            alert: state.alert.clone(),
        }
    }

    /// Applies a runtime settings change. Turning detection off forgets
    /// which frames were evaluated; turning it on evaluates the current
    /// frame.
    pub fn apply_settings(
        self: &Arc<Self>,
        update: SettingsUpdate,
    ) -> Result<MonitorSettings, SettingsError> {
        let was_enabled = self.settings.detection_enabled();
        let settings = self.settings.apply(update)?;
        match (was_enabled, settings.detection_enabled) {
            (true, false) => {
                self.state.lock().tracker.reset();
                tracing::info!("Detection disabled");
            }
            (false, true) => {
                tracing::info!("Detection enabled");
                self.try_begin();
            }
            _ => {}
        }
        Ok(settings)
    }

    fn try_begin(self: &Arc<Self>) {
        if !self.settings.detection_enabled() {
            return;
        }
        let attempt = {
            let mut state = self.state.lock();
            let Some(session) = state.session.as_ref() else {
                return;
            };
            let Some(frame) = state.current.clone() else {
                return;
            };
            if state.tracker.has_been_evaluated(frame.identity()) {
                tracing::debug!("Frame {} already evaluated", frame.identity());
                return;
            }
            if let Some(pending) = &state.pending {
                tracing::debug!(
                    "Skipping frame {} while {} is being classified",
                    frame.identity(),
                    pending
                );
                return;
            }
            let attempt = Attempt {
                generation: session.generation,
                fallback: session.fallback.clone(),
                frame_index: session.frames_seen.saturating_sub(1),
                frame,
            };
            state.pending = Some(attempt.frame.identity().clone());
            state.last_attempt = Some(DetectionAttempt::pending(attempt.frame.identity().clone()));
            attempt
        };

        tokio::spawn(self.clone().run_attempt(attempt));
    }

    async fn run_attempt(self: Arc<Self>, attempt: Attempt) {
        let identity = attempt.frame.identity().clone();
        tracing::debug!("Classifying frame {}", identity);

        let completion = self.classify(&attempt).await;
        let auto_capture = self.complete_auto(&attempt, &completion);

        if let Some(result) = auto_capture {
            match self.hand_off(&attempt, &result, CaptureTrigger::Auto).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!("Dropping auto-capture of {}: session ended", identity)
                }
                Err(e) => tracing::error!("Auto-capture failed: {}", e),
            }
        }

        self.events.publish(MonitorEvent::DetectionCompleted {
            identity,
            status: completion.status,
        });

        // The guard is free again; the frame now on display may still be new.
        self.try_begin();
    }

    async fn classify(&self, attempt: &Attempt) -> Completion {
        let started = Instant::now();
        let outcome = self
            .classifier
            .classify(attempt.frame.encoded().clone())
            .await;
        let elapsed = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                self.metrics.record_detection(AttemptStatus::Succeeded, elapsed);
                Completion {
                    status: AttemptStatus::Succeeded,
                    effective: Some(result),
                    error: None,
                }
            }
            Err(error) => {
                self.metrics.record_detection(AttemptStatus::Failed, elapsed);
                tracing::warn!(
                    "Classification of {} failed: {}",
                    attempt.frame.identity(),
                    error
                );
                Completion {
                    status: AttemptStatus::Failed,
                    effective: attempt.fallback.recover(&error, attempt.frame_index),
                    error: Some(error),
                }
            }
        }
    }

    /// Releases the guard and applies the threshold policy. Returns the
    /// result to hand off when auto-capture is due.
    fn complete_auto(&self, attempt: &Attempt, completion: &Completion) -> Option<DetectionResult> {
        let identity = attempt.frame.identity();
        let mut notices = Vec::new();

        let auto_capture = {
            let mut state = self.state.lock();
            self.release(&mut state, identity, completion);

            let same_session = state
                .session
                .as_ref()
                .is_some_and(|s| s.generation == attempt.generation);
            if !same_session {
                tracing::info!("Discarding result for {}: session ended", identity);
                return None;
            }
            state.tracker.mark_evaluated(identity);

            if !state.is_current(identity) {
                tracing::debug!("Discarding result for {}: frame superseded", identity);
                return None;
            }

            match (&completion.effective, &completion.error) {
                (Some(result), _) => {
                    match self.settings.threshold_policy().evaluate(result) {
                        Verdict::Alert { auto_capture } => {
                            state.alert = Some(result.clone());
                            notices.push(MonitorEvent::AlertRaised {
                                disease_class: result.disease_class.clone(),
                                confidence_percent: result.confidence_percent,
                            });
                            self.metrics.record_alert(result.disease_class.as_str());
                            tracing::info!(
                                "Alert raised for {}: {} ({:.1}%)",
                                identity,
                                result.disease_class,
                                result.confidence_percent
                            );
                            auto_capture.then(|| result.clone())
                        }
                        Verdict::Clear => {
                            if state.clear_alert() {
                                notices.push(MonitorEvent::AlertCleared);
                            }
                            None
                        }
                    }
                }
                (None, Some(error)) => {
                    notices.push(MonitorEvent::ClassificationFailed {
                        message: error.to_string(),
                    });
                    None
                }
                (None, None) => None,
            }
        };

        for notice in notices {
            self.events.publish(notice);
        }
        auto_capture
    }

    fn is_session(&self, generation: u64) -> bool {
        self.state
            .lock()
            .session
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }

    /// Delivers `result` for the attempt's frame unless its session has
    /// ended. Returns whether a record was handed off.
    async fn hand_off(
        &self,
        attempt: &Attempt,
        result: &DetectionResult,
        trigger: CaptureTrigger,
    ) -> Result<bool, CaptureError> {
        let _delivering = self.handoff_gate.lock().await;
        if !self.is_session(attempt.generation) {
            return Ok(false);
        }
        if let Err(e) = self.handoff.capture(&attempt.frame, result, trigger).await {
            self.events.publish(MonitorEvent::CaptureFailed {
                message: e.to_string(),
            });
            return Err(e);
        }
        self.metrics.record_capture(trigger);
        self.events.publish(MonitorEvent::CaptureHandedOff {
            trigger,
            disease_class: result.disease_class.clone(),
        });
        Ok(true)
    }

    fn release(
        &self,
        state: &mut CoordinatorState,
        identity: &FrameIdentity,
        completion: &Completion,
    ) {
        state.pending = None;
        state.last_attempt = Some(DetectionAttempt {
            frame_identity: identity.clone(),
            status: completion.status,
            result: completion.effective.clone(),
        });
    }

    /// User-invoked "capture now": classifies the displayed frame even if
    /// it was evaluated before, skips the thresholds, and hands off any
    /// result. Still refused while another classification is outstanding.
    pub async fn capture_now(self: &Arc<Self>) -> Result<DetectionResult, ManualCaptureError> {
        let attempt = {
            let mut state = self.state.lock();
            let Some(session) = state.session.as_ref() else {
                return Err(ManualCaptureError::NotStreaming);
            };
            let Some(frame) = state.current.clone() else {
                return Err(ManualCaptureError::NoFrame);
            };
            if state.pending.is_some() {
                return Err(ManualCaptureError::Busy);
            }
            let attempt = Attempt {
                generation: session.generation,
                fallback: session.fallback.clone(),
                frame_index: session.frames_seen.saturating_sub(1),
                frame,
            };
            state.pending = Some(attempt.frame.identity().clone());
            state.last_attempt = Some(DetectionAttempt::pending(attempt.frame.identity().clone()));
            attempt
        };

        // Runs detached so a caller that gives up waiting (a dropped HTTP
        // request) cannot strand the single-flight flag.
        match tokio::spawn(self.clone().run_manual(attempt)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Manual capture task failed: {}", e);
                self.state.lock().pending = None;
                Err(e.into())
            }
        }
    }

    async fn run_manual(
        self: Arc<Self>,
        attempt: Attempt,
    ) -> Result<DetectionResult, ManualCaptureError> {
        let outcome = self.capture_manual(&attempt).await;
        self.try_begin();
        outcome
    }

    async fn capture_manual(
        &self,
        attempt: &Attempt,
    ) -> Result<DetectionResult, ManualCaptureError> {
        let identity = attempt.frame.identity();
        let completion = self.classify(attempt).await;

        {
            let mut state = self.state.lock();
            self.release(&mut state, identity, &completion);
            let same_session = state
                .session
                .as_ref()
                .is_some_and(|s| s.generation == attempt.generation);
            if !same_session {
                return Err(ManualCaptureError::SessionEnded);
            }
            state.tracker.mark_evaluated(identity);
        }

        self.events.publish(MonitorEvent::DetectionCompleted {
            identity: identity.clone(),
            status: completion.status,
        });

        let result = match (completion.effective, completion.error) {
            (Some(result), _) => result,
            (None, Some(error)) => {
                self.events.publish(MonitorEvent::ClassificationFailed {
                    message: error.to_string(),
                });
                return Err(error.into());
            }
            (None, None) => return Err(ManualCaptureError::SessionEnded),
        };

        match self.hand_off(attempt, &result, CaptureTrigger::Manual).await {
            Ok(true) => Ok(result),
            Ok(false) => Err(ManualCaptureError::SessionEnded),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::handoff::{CaptureEvent, HandoffSink};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{broadcast, Semaphore};

    /// Replies from a script; when gated, each call waits for a permit.
    pub struct ScriptedClassifier {
        script: Mutex<VecDeque<Result<DetectionResult, ClassificationError>>>,
        gate: Option<Arc<Semaphore>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedClassifier {
        pub fn new(script: Vec<Result<DetectionResult, ClassificationError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                gate: None,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        pub fn gated(
            script: Vec<Result<DetectionResult, ClassificationError>>,
        ) -> (Self, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            let mut classifier = Self::new(script);
            classifier.gate = Some(gate.clone());
            (classifier, gate)
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ClassifierClient for ScriptedClassifier {
        async fn classify(&self, _image_data: Bytes) -> Result<DetectionResult, ClassificationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.script
                .lock()
                .pop_front()
                .unwrap_or(Err(ClassificationError::Decode("script exhausted".into())))
        }
    }

    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<(CaptureTrigger, String)>>,
    }

    #[async_trait]
    impl HandoffSink for Arc<RecordingSink> {
        async fn deliver(&self, event: CaptureEvent) -> Result<(), CaptureError> {
            self.events
                .lock()
                .push((event.trigger, event.result.disease_class.to_string()));
            Ok(())
        }
    }

    pub struct Harness {
        pub coordinator: Arc<DetectionCoordinator>,
        pub sink: Arc<RecordingSink>,
        pub events: broadcast::Receiver<MonitorEvent>,
    }

    pub fn harness(classifier: Arc<dyn ClassifierClient>) -> Harness {
        let sink = Arc::new(RecordingSink::default());
        let (coordinator, events) = coordinator_with_sink(classifier, Box::new(sink.clone()));
        Harness {
            coordinator,
            sink,
            events,
        }
    }

    pub fn coordinator_with_sink(
        classifier: Arc<dyn ClassifierClient>,
        sink: Box<dyn HandoffSink>,
    ) -> (Arc<DetectionCoordinator>, broadcast::Receiver<MonitorEvent>) {
        let bus = EventBus::new();
        let events = bus.subscribe();
        let coordinator = Arc::new(DetectionCoordinator::new(
            classifier,
            Arc::new(CaptureHandoffService::new(sink, 90)),
            SettingsHandle::new(MonitorSettings::default()),
            bus,
            Arc::new(Metrics::new().unwrap()),
        ));
        (coordinator, events)
    }

    pub async fn wait_for<F>(rx: &mut broadcast::Receiver<MonitorEvent>, mut matches: F) -> MonitorEvent
    where
        F: FnMut(&MonitorEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    pub fn is_completed(event: &MonitorEvent) -> bool {
        matches!(event, MonitorEvent::DetectionCompleted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::detection::test_support::result;
    use crate::frame::test_support::frame;
    use crate::handoff::{CaptureEvent, HandoffSink};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{Notify, Semaphore};

    #[tokio::test]
    async fn qualifying_detection_raises_alert_and_auto_captures() {
        let classifier = Arc::new(ScriptedClassifier::new(vec![Ok(result("Canker", 87.0))]));
        let mut h = harness(classifier.clone());
        h.coordinator.activate(StreamMode::Live);

        h.coordinator.on_frame_ready(frame("a"));
        wait_for(&mut h.events, is_completed).await;

        let alert = h.coordinator.alert().unwrap();
        assert_eq!(alert.confidence_percent, 87.0);
        assert_eq!(
            *h.sink.events.lock(),
            vec![(CaptureTrigger::Auto, "Canker".to_string())]
        );
        let snapshot = h.coordinator.snapshot();
        assert!(snapshot.pending.is_none());
        assert_eq!(
            snapshot.last_attempt.unwrap().status,
            AttemptStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn alert_below_auto_capture_threshold_does_not_hand_off() {
        let classifier = Arc::new(ScriptedClassifier::new(vec![Ok(result("Melanose", 75.0))]));
        let mut h = harness(classifier);
        h.coordinator.activate(StreamMode::Live);

        h.coordinator.on_frame_ready(frame("a"));
        wait_for(&mut h.events, is_completed).await;

        assert!(h.coordinator.alert().is_some());
        assert!(h.sink.events.lock().is_empty());
    }

    #[tokio::test]
    async fn healthy_frame_is_evaluated_once() {
        let classifier = Arc::new(ScriptedClassifier::new(vec![Ok(result("Healthy", 95.0))]));
        let mut h = harness(classifier.clone());
        h.coordinator.activate(StreamMode::Live);

        let a = frame("a");
        h.coordinator.on_frame_ready(a.clone());
        wait_for(&mut h.events, is_completed).await;

        h.coordinator.on_frame_ready(a);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(h.coordinator.alert().is_none());
        assert_eq!(classifier.calls(), 1);
        assert!(!h.coordinator.is_pending());
    }

    #[tokio::test]
    async fn frame_arriving_during_pending_waits_for_guard() {
        let (classifier, gate) = ScriptedClassifier::gated(vec![
            Ok(result("Canker", 60.0)),
            Ok(result("Greening", 90.0)),
        ]);
        let classifier = Arc::new(classifier);
        let mut h = harness(classifier.clone());
        h.coordinator.activate(StreamMode::Live);

        h.coordinator.on_frame_ready(frame("a"));
        h.coordinator.on_frame_ready(frame("b"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(classifier.calls(), 1);
        assert!(h.coordinator.is_pending());

        gate.add_permits(1);
        let first = wait_for(&mut h.events, is_completed).await;
        assert!(matches!(
            first,
            MonitorEvent::DetectionCompleted { ref identity, .. } if identity.as_str() == "a"
        ));
        // A's result is stale: B is on display.
        assert!(h.coordinator.alert().is_none());

        gate.add_permits(1);
        let second = wait_for(&mut h.events, is_completed).await;
        assert!(matches!(
            second,
            MonitorEvent::DetectionCompleted { ref identity, .. } if identity.as_str() == "b"
        ));
        assert_eq!(
            h.coordinator.alert().unwrap().disease_class.as_str(),
            "Greening"
        );
        assert_eq!(classifier.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn superseded_pending_frame_is_skipped_for_latest() {
        let (classifier, gate) = ScriptedClassifier::gated(vec![
            Ok(result("Canker", 90.0)),
            Ok(result("Melanose", 72.0)),
        ]);
        let classifier = Arc::new(classifier);
        let mut h = harness(classifier.clone());
        h.coordinator.activate(StreamMode::Live);

        h.coordinator.on_frame_ready(frame("a"));
        h.coordinator.on_frame_ready(frame("b"));
        h.coordinator.on_frame_ready(frame("c"));
        gate.add_permits(2);

        wait_for(&mut h.events, is_completed).await;
        let second = wait_for(&mut h.events, is_completed).await;

        assert!(matches!(
            second,
            MonitorEvent::DetectionCompleted { ref identity, .. } if identity.as_str() == "c"
        ));
        assert_eq!(classifier.calls(), 2);
        assert!(h.sink.events.lock().is_empty());
    }

    #[tokio::test]
    async fn live_failure_leaves_alert_untouched() {
        let classifier = Arc::new(ScriptedClassifier::new(vec![Err(
            ClassificationError::Status {
                status: 500,
                message: "model not loaded".into(),
            },
        )]));
        let mut h = harness(classifier.clone());
        h.coordinator.activate(StreamMode::Live);

        h.coordinator.on_frame_ready(frame("a"));
        wait_for(&mut h.events, |e| {
            matches!(e, MonitorEvent::ClassificationFailed { .. })
        })
        .await;
        wait_for(&mut h.events, is_completed).await;

        assert!(h.coordinator.alert().is_none());
        let attempt = h.coordinator.snapshot().last_attempt.unwrap();
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert!(attempt.result.is_none());

        // Failed is terminal for the frame.
        h.coordinator.on_frame_ready(frame("a"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(classifier.calls(), 1);
    }

    #[tokio::test]
    async fn simulated_failure_uses_placeholder_through_policy() {
        let classifier = Arc::new(ScriptedClassifier::new(vec![Err(
            ClassificationError::Decode("bad body".into()),
        )]));
        let mut h = harness(classifier);
        h.coordinator.activate(StreamMode::Simulated);

        h.coordinator.on_frame_ready(frame("a"));
        wait_for(&mut h.events, is_completed).await;

        let alert = h.coordinator.alert().unwrap();
        assert_eq!(alert.disease_class.as_str(), "Canker");
        assert_eq!(
            *h.sink.events.lock(),
            vec![(CaptureTrigger::Auto, "Canker".to_string())]
        );
        assert_eq!(
            h.coordinator.snapshot().last_attempt.unwrap().status,
            AttemptStatus::Failed
        );
    }

    #[tokio::test]
    async fn result_after_deactivate_is_discarded() {
        let (classifier, gate) = ScriptedClassifier::gated(vec![Ok(result("Canker", 99.0))]);
        let mut h = harness(Arc::new(classifier));
        h.coordinator.activate(StreamMode::Live);

        h.coordinator.on_frame_ready(frame("a"));
        h.coordinator.deactivate().await;
        gate.add_permits(1);
        wait_for(&mut h.events, is_completed).await;

        assert!(h.coordinator.alert().is_none());
        assert!(h.sink.events.lock().is_empty());
        assert!(!h.coordinator.is_pending());
    }

    #[tokio::test]
    async fn new_frame_clears_alert() {
        let (classifier, gate) = ScriptedClassifier::gated(vec![
            Ok(result("Canker", 75.0)),
            Ok(result("Canker", 75.0)),
        ]);
        let mut h = harness(Arc::new(classifier));
        h.coordinator.activate(StreamMode::Live);

        gate.add_permits(1);
        h.coordinator.on_frame_ready(frame("a"));
        wait_for(&mut h.events, is_completed).await;
        assert!(h.coordinator.alert().is_some());

        h.coordinator.on_frame_ready(frame("b"));
        assert!(h.coordinator.alert().is_none());
        wait_for(&mut h.events, |e| matches!(e, MonitorEvent::AlertCleared)).await;
        gate.add_permits(1);
    }

    #[tokio::test]
    async fn disabled_detection_ignores_frames() {
        let classifier = Arc::new(ScriptedClassifier::new(vec![Ok(result("Canker", 90.0))]));
        let mut h = harness(classifier.clone());
        h.coordinator.activate(StreamMode::Live);
        h.coordinator
            .apply_settings(SettingsUpdate {
                detection_enabled: Some(false),
                ..Default::default()
            })
            .unwrap();

        h.coordinator.on_frame_ready(frame("a"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(classifier.calls(), 0);

        h.coordinator
            .apply_settings(SettingsUpdate {
                detection_enabled: Some(true),
                ..Default::default()
            })
            .unwrap();
        wait_for(&mut h.events, is_completed).await;
        assert_eq!(classifier.calls(), 1);
    }

    #[tokio::test]
    async fn manual_capture_bypasses_dedup_and_threshold() {
        let classifier = Arc::new(ScriptedClassifier::new(vec![
            Ok(result("Healthy", 95.0)),
            Ok(result("Canker", 40.0)),
        ]));
        let mut h = harness(classifier.clone());
        h.coordinator.activate(StreamMode::Live);

        h.coordinator.on_frame_ready(frame("a"));
        wait_for(&mut h.events, is_completed).await;

        let result = h.coordinator.capture_now().await.unwrap();
        assert_eq!(result.confidence_percent, 40.0);
        assert_eq!(classifier.calls(), 2);
        assert!(h.coordinator.alert().is_none());
        assert_eq!(
            *h.sink.events.lock(),
            vec![(CaptureTrigger::Manual, "Canker".to_string())]
        );
    }

    #[tokio::test]
    async fn manual_capture_respects_single_flight() {
        let (classifier, gate) = ScriptedClassifier::gated(vec![Ok(result("Canker", 50.0))]);
        let h = harness(Arc::new(classifier));

        assert!(matches!(
            h.coordinator.capture_now().await,
            Err(ManualCaptureError::NotStreaming)
        ));
        h.coordinator.activate(StreamMode::Live);
        assert!(matches!(
            h.coordinator.capture_now().await,
            Err(ManualCaptureError::NoFrame)
        ));

        h.coordinator.on_frame_ready(frame("a"));
        assert!(matches!(
            h.coordinator.capture_now().await,
            Err(ManualCaptureError::Busy)
        ));
        gate.add_permits(1);
    }

    #[tokio::test]
    async fn abandoned_manual_capture_still_releases_guard() {
        let (classifier, gate) = ScriptedClassifier::gated(vec![
            Ok(result("Healthy", 95.0)),
            Ok(result("Canker", 50.0)),
            Ok(result("Greening", 90.0)),
        ]);
        let classifier = Arc::new(classifier);
        let mut h = harness(classifier.clone());
        h.coordinator.activate(StreamMode::Live);

        gate.add_permits(1);
        h.coordinator.on_frame_ready(frame("a"));
        wait_for(&mut h.events, is_completed).await;

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), h.coordinator.capture_now()).await;
        assert!(abandoned.is_err());

        gate.add_permits(1);
        wait_for(&mut h.events, |e| {
            matches!(e, MonitorEvent::CaptureHandedOff { .. })
        })
        .await;
        assert!(!h.coordinator.is_pending());

        gate.add_permits(1);
        h.coordinator.on_frame_ready(frame("b"));
        let next = wait_for(&mut h.events, is_completed).await;
        assert!(matches!(
            next,
            MonitorEvent::DetectionCompleted { ref identity, .. } if identity.as_str() == "b"
        ));
        assert_eq!(classifier.calls(), 3);
        assert_eq!(
            h.coordinator.alert().unwrap().disease_class.as_str(),
            "Greening"
        );
    }

    #[tokio::test]
    async fn failed_auto_capture_keeps_alert() {
        let classifier = Arc::new(ScriptedClassifier::new(vec![Ok(result("Canker", 90.0))]));
        let mut h = harness(classifier);
        h.coordinator.activate(StreamMode::Live);

        let truncated = FrameRef::new(
            FrameIdentity::new("truncated"),
            Bytes::from_static(b"\xff\xd8"),
            Utc::now(),
        );
        h.coordinator.on_frame_ready(truncated);
        wait_for(&mut h.events, |e| {
            matches!(e, MonitorEvent::CaptureFailed { .. })
        })
        .await;
        wait_for(&mut h.events, is_completed).await;

        assert!(h.sink.events.lock().is_empty());
        assert_eq!(h.coordinator.alert().unwrap().disease_class.as_str(), "Canker");
    }

    /// Signals when a delivery starts and holds it until released.
    struct StallingSink {
        entered: Arc<Notify>,
        release: Arc<Semaphore>,
        delivered: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl HandoffSink for StallingSink {
        async fn deliver(&self, _event: CaptureEvent) -> Result<(), CaptureError> {
            self.entered.notify_one();
            if let Ok(permit) = self.release.acquire().await {
                permit.forget();
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_waits_for_handoff_in_progress() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Semaphore::new(0));
        let delivered = Arc::new(AtomicUsize::new(0));
        let sink = StallingSink {
            entered: entered.clone(),
            release: release.clone(),
            delivered: delivered.clone(),
        };
        let classifier = Arc::new(ScriptedClassifier::new(vec![Ok(result("Canker", 90.0))]));
        let (coordinator, mut events) = coordinator_with_sink(classifier, Box::new(sink));
        coordinator.activate(StreamMode::Live);

        coordinator.on_frame_ready(frame("a"));
        entered.notified().await;

        let stopping = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.deactivate().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stopping.is_finished());

        release.add_permits(1);
        stopping.await.unwrap();
        wait_for(&mut events, is_completed).await;

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert!(coordinator.alert().is_none());
    }

    #[tokio::test]
    async fn handoff_queued_behind_stop_is_dropped() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Semaphore::new(0));
        let delivered = Arc::new(AtomicUsize::new(0));
        let sink = StallingSink {
            entered: entered.clone(),
            release: release.clone(),
            delivered: delivered.clone(),
        };
        let classifier = Arc::new(ScriptedClassifier::new(vec![
            Ok(result("Canker", 90.0)),
            Ok(result("Canker", 50.0)),
        ]));
        let (coordinator, _events) = coordinator_with_sink(classifier, Box::new(sink));
        coordinator.activate(StreamMode::Live);

        coordinator.on_frame_ready(frame("a"));
        entered.notified().await;
        let stopping = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.deactivate().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Session is still live until the auto delivery finishes, so the
        // manual request is accepted but waits behind the stop.
        let manual = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.capture_now().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        release.add_permits(1);
        stopping.await.unwrap();
        assert!(matches!(
            manual.await.unwrap(),
            Err(ManualCaptureError::SessionEnded)
        ));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }
}
