use crate::frame::FrameIdentity;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiseaseClass {
    Canker,
    Greening,
    Melanose,
    BlackSpot,
    Healthy,
    Other(String),
}

impl DiseaseClass {
    pub fn as_str(&self) -> &str {
        match self {
            DiseaseClass::Canker => "Canker",
            DiseaseClass::Greening => "Greening",
            DiseaseClass::Melanose => "Melanose",
            DiseaseClass::BlackSpot => "Black spot",
            DiseaseClass::Healthy => "Healthy",
            DiseaseClass::Other(label) => label,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, DiseaseClass::Healthy)
    }

    /// Display colour used by the dashboard for this class.
    pub fn color(&self) -> &'static str {
        match self {
            DiseaseClass::Canker => "#E74C3C",
            DiseaseClass::Greening => "#F39C12",
            DiseaseClass::Melanose => "#9B59B6",
            DiseaseClass::BlackSpot => "#34495E",
            DiseaseClass::Healthy => "#2ECC71",
            DiseaseClass::Other(_) => "#95A5A6",
        }
    }
}

impl From<&str> for DiseaseClass {
    fn from(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "canker" => DiseaseClass::Canker,
            "greening" => DiseaseClass::Greening,
            "melanose" => DiseaseClass::Melanose,
            "black spot" | "black_spot" | "blackspot" => DiseaseClass::BlackSpot,
            "healthy" | "sehat" => DiseaseClass::Healthy,
            _ => DiseaseClass::Other(label.trim().to_string()),
        }
    }
}

impl fmt::Display for DiseaseClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DiseaseClass {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DiseaseClass {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(DiseaseClass::from(label.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl TryFrom<&str> for Severity {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.trim().to_lowercase().as_str() {
            "low" | "rendah" => Ok(Self::Low),
            "medium" | "sedang" => Ok(Self::Medium),
            "high" | "tinggi" => Ok(Self::High),
            other => Err(format!("{} is not a known severity", other)),
        }
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Severity::try_from(s.as_str()).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    pub disease_class: DiseaseClass,
    pub disease: String,
    pub confidence_percent: f32,
    pub severity: Severity,
    pub description: String,
    pub symptoms: Vec<String>,
    pub treatment: Vec<String>,
    pub prevention: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionAttempt {
    pub frame_identity: FrameIdentity,
    pub status: AttemptStatus,
    pub result: Option<DetectionResult>,
}

impl DetectionAttempt {
    pub fn pending(frame_identity: FrameIdentity) -> Self {
        Self {
            frame_identity,
            status: AttemptStatus::Pending,
            result: None,
        }
    }
}

/// Whether a manual "capture now" or an automatic tick started an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureTrigger {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// No visible alert.
    Clear,
    Alert { auto_capture: bool },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdPolicy {
    pub alert_threshold: f32,
    pub auto_capture_threshold: f32,
    pub auto_capture_enabled: bool,
}

impl ThresholdPolicy {
    pub fn evaluate(&self, result: &DetectionResult) -> Verdict {
        if result.disease_class.is_healthy() || result.confidence_percent < self.alert_threshold {
            return Verdict::Clear;
        }
        Verdict::Alert {
            auto_capture: self.auto_capture_enabled
                && result.confidence_percent >= self.auto_capture_threshold,
        }
    }
}
