use crate::detection::{AttemptStatus, CaptureTrigger};
use opentelemetry::{
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    frames_refreshed: Counter<u64>,
    frame_fetch_failures: Counter<u64>,
    detections: Counter<u64>,
    alerts_raised: Counter<u64>,
    captures: Counter<u64>,
    classification_duration: Histogram<u64>,
    // Dropping the provider shuts the pipeline down.
    _provider: SdkMeterProvider,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| prometheus::Error::Msg(e.to_string()))?;

        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        let meter = provider.meter("drone_monitor");

        let frames_refreshed = meter
            .u64_counter("frames_refreshed_total")
            .with_description("Frames installed as current")
            .build();

        let frame_fetch_failures = meter
            .u64_counter("frame_fetch_failures_total")
            .with_description("Cadence ticks whose frame refresh failed")
            .build();

        let detections = meter
            .u64_counter("detections_total")
            .with_description("Completed classification attempts")
            .build();

        let alerts_raised = meter
            .u64_counter("alerts_raised_total")
            .with_description("Detections that passed the alert threshold")
            .build();

        let captures = meter
            .u64_counter("captures_total")
            .with_description("Frames handed off to the detail workflow")
            .build();

        let boundaries = generate_boundaries((50, 250, 1000, 5000, 30000));

        let classification_duration = meter
            .u64_histogram("classification_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of classifier calls in milliseconds")
            .build();

        Ok(Metrics {
            frames_refreshed,
            frame_fetch_failures,
            detections,
            alerts_raised,
            captures,
            classification_duration,
            _provider: provider,
            registry,
        })
    }

    pub fn record_frame_refreshed(&self, mode: &str) {
        self.frames_refreshed
            .add(1, &[KeyValue::new("mode", mode.to_string())]);
    }

    pub fn record_frame_fetch_failure(&self, mode: &str) {
        self.frame_fetch_failures
            .add(1, &[KeyValue::new("mode", mode.to_string())]);
    }

    pub fn record_detection(&self, status: AttemptStatus, duration_ms: u64) {
        let outcome = match status {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
        };
        let attributes = [KeyValue::new("outcome", outcome)];
        self.detections.add(1, &attributes);
        self.classification_duration.record(duration_ms, &attributes);
    }

    pub fn record_alert(&self, disease_class: &str) {
        self.alerts_raised
            .add(1, &[KeyValue::new("class", disease_class.to_string())]);
    }

    pub fn record_capture(&self, trigger: CaptureTrigger) {
        let trigger = match trigger {
            CaptureTrigger::Auto => "auto",
            CaptureTrigger::Manual => "manual",
        };
        self.captures.add(1, &[KeyValue::new("trigger", trigger)]);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 50;
    let middle_step: usize = 250;
    let end_step: usize = 1000;
    let tail_step: usize = 5000;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}
