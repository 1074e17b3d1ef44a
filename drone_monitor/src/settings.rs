use crate::config::{ClassifierConfig, MonitoringConfig};
use crate::detection::ThresholdPolicy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum SettingsError {
    #[error("cadence must be at least 1ms")]
    ZeroCadence,
    #[error("threshold {0} is outside 0..=100")]
    ThresholdOutOfRange(f32),
    #[error("alert threshold {alert} is above auto-capture threshold {auto_capture}")]
    ThresholdOrder { alert: f32, auto_capture: f32 },
    #[error("classifier base url must not be empty")]
    EmptyClassifierUrl,
}

/// Knobs that can change while a session runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorSettings {
    pub cadence_ms: u64,
    pub detection_enabled: bool,
    pub auto_capture_enabled: bool,
    pub alert_threshold: f32,
    pub auto_capture_threshold: f32,
    pub classifier_base_url: String,
}

impl MonitorSettings {
    pub fn from_config(monitoring: &MonitoringConfig, classifier: &ClassifierConfig) -> Self {
        Self {
            cadence_ms: monitoring.cadence_ms,
            detection_enabled: monitoring.detection_enabled,
            auto_capture_enabled: monitoring.auto_capture_enabled,
            alert_threshold: monitoring.alert_threshold,
            auto_capture_threshold: monitoring.auto_capture_threshold,
            classifier_base_url: classifier.base_url.clone(),
        }
    }

    pub fn threshold_policy(&self) -> ThresholdPolicy {
        ThresholdPolicy {
            alert_threshold: self.alert_threshold,
            auto_capture_threshold: self.auto_capture_threshold,
            auto_capture_enabled: self.auto_capture_enabled,
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.cadence_ms == 0 {
            return Err(SettingsError::ZeroCadence);
        }
        for threshold in [self.alert_threshold, self.auto_capture_threshold] {
            if !(0.0..=100.0).contains(&threshold) {
                return Err(SettingsError::ThresholdOutOfRange(threshold));
            }
        }
        if self.alert_threshold > self.auto_capture_threshold {
            return Err(SettingsError::ThresholdOrder {
                alert: self.alert_threshold,
                auto_capture: self.auto_capture_threshold,
            });
        }
        if self.classifier_base_url.trim().is_empty() {
            return Err(SettingsError::EmptyClassifierUrl);
        }
        Ok(())
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from_config(
            &MonitoringConfig::default(),
            &ClassifierConfig {
                base_url: "http://localhost:5000".into(),
                subject_id: None,
                timeout_ms: None,
            },
        )
    }
}

/// Partial update accepted by `PUT /settings`.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SettingsUpdate {
    pub cadence_ms: Option<u64>,
    pub detection_enabled: Option<bool>,
    pub auto_capture_enabled: Option<bool>,
    pub alert_threshold: Option<f32>,
    pub auto_capture_threshold: Option<f32>,
    pub classifier_base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<MonitorSettings>>,
}

impl SettingsHandle {
    pub fn new(settings: MonitorSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn snapshot(&self) -> MonitorSettings {
        self.inner.read().clone()
    }

    pub fn cadence_ms(&self) -> u64 {
        self.inner.read().cadence_ms
    }

    pub fn detection_enabled(&self) -> bool {
        self.inner.read().detection_enabled
    }

    pub fn classifier_base_url(&self) -> String {
        self.inner.read().classifier_base_url.clone()
    }

    pub fn threshold_policy(&self) -> ThresholdPolicy {
        self.inner.read().threshold_policy()
    }

    /// Applies every field of `update` or none of them.
    pub fn apply(&self, update: SettingsUpdate) -> Result<MonitorSettings, SettingsError> {
        let mut guard = self.inner.write();
        let mut next = guard.clone();
        if let Some(cadence_ms) = update.cadence_ms {
            next.cadence_ms = cadence_ms;
        }
        if let Some(enabled) = update.detection_enabled {
            next.detection_enabled = enabled;
        }
        if let Some(enabled) = update.auto_capture_enabled {
            next.auto_capture_enabled = enabled;
        }
        if let Some(threshold) = update.alert_threshold {
            next.alert_threshold = threshold;
        }
        if let Some(threshold) = update.auto_capture_threshold {
            next.auto_capture_threshold = threshold;
        }
        if let Some(url) = update.classifier_base_url {
            next.classifier_base_url = url;
        }
        next.validate()?;
        *guard = next.clone();
        Ok(next)
    }
}
