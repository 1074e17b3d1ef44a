use crate::classifier::ClassificationError;
use crate::detection::{DetectionResult, DiseaseClass, Severity};
use crate::frame::StreamMode;
use std::sync::Arc;

/// Decides what a failed classification turns into. The coordinator runs
/// whatever comes back through the normal threshold policy.
pub trait FallbackStrategy: Send + Sync + 'static {
    fn recover(&self, error: &ClassificationError, frame_index: u64) -> Option<DetectionResult>;
}

pub fn for_mode(mode: StreamMode) -> Arc<dyn FallbackStrategy> {
    match mode {
        StreamMode::Live => Arc::new(SurfaceError),
        StreamMode::Simulated => Arc::new(Placeholder::default()),
    }
}

/// Live feeds never invent results.
pub struct SurfaceError;

impl FallbackStrategy for SurfaceError {
    fn recover(&self, _error: &ClassificationError, _frame_index: u64) -> Option<DetectionResult> {
        None
    }
}

/// Rotates through a fixed list so the simulated dashboard keeps showing
/// alerts when no classifier is running.
pub struct Placeholder {
    results: Vec<DetectionResult>,
}

impl Default for Placeholder {
    fn default() -> Self {
        Self {
            results: vec![
                DetectionResult {
                    disease_class: DiseaseClass::Canker,
                    disease: "Citrus Canker".into(),
                    confidence_percent: 87.0,
                    severity: Severity::High,
                    description: "Bacterial disease causing lesions on leaves, fruit and twigs."
                        .into(),
                    symptoms: vec![
                        "Brown spots with a yellow halo".into(),
                        "Raised leaf surface".into(),
                    ],
                    treatment: vec![
                        "Prune infected parts".into(),
                        "Spray copper-based bactericide".into(),
                    ],
                    prevention: vec![
                        "Use certified seedlings".into(),
                        "Keep planting distance".into(),
                    ],
                },
                DetectionResult {
                    disease_class: DiseaseClass::Greening,
                    disease: "Citrus Greening (HLB)".into(),
                    confidence_percent: 92.0,
                    severity: Severity::High,
                    description: "Lethal bacterial disease spread by the citrus psyllid.".into(),
                    symptoms: vec![
                        "Blotchy yellowing of leaves".into(),
                        "Small, lopsided fruit".into(),
                    ],
                    treatment: vec![
                        "Remove infected trees".into(),
                        "Control the psyllid vector".into(),
                    ],
                    prevention: vec![
                        "Use disease-free seedlings".into(),
                        "Set yellow sticky traps".into(),
                    ],
                },
            ],
        }
    }
}

impl FallbackStrategy for Placeholder {
    fn recover(&self, error: &ClassificationError, frame_index: u64) -> Option<DetectionResult> {
        let index = (frame_index % self.results.len() as u64) as usize;
        let result = self.results[index].clone();
        tracing::warn!(
            "Classifier unavailable ({}), using placeholder {} for simulated frame",
            error,
            result.disease_class
        );
        Some(result)
    }
}
