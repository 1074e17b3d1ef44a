use crate::config::ClassifierConfig;
use crate::detection::{DetectionResult, DiseaseClass, Severity};
use crate::settings::SettingsHandle;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    multipart::{Form, Part},
    Client,
};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

const PREDICT_PATH: &str = "/api/predict";
const IMAGE_FIELD: &str = "image";
const IMAGE_FILE_NAME: &str = "drone_capture.jpg";

#[derive(Error, Debug)]
pub enum ClassificationError {
    #[error("Classifier request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Classifier returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Classifier response could not be parsed: {0}")]
    Decode(String),
    #[error("Frame has no image data")]
    EmptyImage,
}

#[async_trait]
pub trait ClassifierClient: Send + Sync + 'static {
    async fn classify(&self, image_data: Bytes) -> Result<DetectionResult, ClassificationError>;
}

pub struct HttpClassifier {
    client: Client,
    settings: SettingsHandle,
    subject_id: Option<String>,
    timeout: Option<Duration>,
}

impl HttpClassifier {
    pub fn new(client: Client, settings: SettingsHandle, config: &ClassifierConfig) -> Self {
        Self {
            client,
            settings,
            subject_id: config.subject_id.clone(),
            timeout: config.timeout_ms.map(Duration::from_millis),
        }
    }

    fn predict_url(&self) -> String {
        format!(
            "{}{}",
            self.settings.classifier_base_url().trim_end_matches('/'),
            PREDICT_PATH
        )
    }
}

#[async_trait]
impl ClassifierClient for HttpClassifier {
    #[instrument(skip(self, image_data), fields(bytes = image_data.len()))]
    async fn classify(&self, image_data: Bytes) -> Result<DetectionResult, ClassificationError> {
        if image_data.is_empty() {
            return Err(ClassificationError::EmptyImage);
        }

        let part = Part::bytes(image_data.to_vec())
            .file_name(IMAGE_FILE_NAME)
            .mime_str("image/jpeg")?;
        let mut form = Form::new().part(IMAGE_FIELD, part);
        if let Some(subject_id) = &self.subject_id {
            form = form.text("user_id", subject_id.clone());
        }

        let mut request = self.client.post(self.predict_url()).multipart(form);
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(ClassificationError::Status {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        parse_prediction(&body)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Confidence {
    Number(f64),
    Text(String),
}

impl Confidence {
    fn percent(&self) -> Result<f32, ClassificationError> {
        let value = match self {
            Confidence::Number(n) => *n,
            Confidence::Text(s) => s
                .trim()
                .trim_end_matches('%')
                .trim()
                .parse::<f64>()
                .map_err(|e| ClassificationError::Decode(format!("confidence {:?}: {}", s, e)))?,
        };
        if !value.is_finite() {
            return Err(ClassificationError::Decode(format!(
                "confidence {} is not finite",
                value
            )));
        }
        Ok(value.clamp(0.0, 100.0) as f32)
    }
}

#[derive(Deserialize)]
struct PredictionResponse {
    class: String,
    confidence: Confidence,
    disease_info: DiseaseInfo,
}

#[derive(Deserialize)]
struct DiseaseInfo {
    disease: String,
    severity: Severity,
    #[serde(default)]
    description: String,
    #[serde(default)]
    symptoms: Vec<String>,
    #[serde(default)]
    treatment: Vec<String>,
    #[serde(default)]
    prevention: Vec<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<ErrorBody>(body)
        .map(|e| e.error)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).chars().take(200).collect())
}

pub(crate) fn parse_prediction(body: &[u8]) -> Result<DetectionResult, ClassificationError> {
    let response: PredictionResponse =
        serde_json::from_slice(body).map_err(|e| ClassificationError::Decode(e.to_string()))?;
    let confidence_percent = response.confidence.percent()?;
    let info = response.disease_info;

    Ok(DetectionResult {
        disease_class: DiseaseClass::from(response.class.as_str()),
        disease: info.disease,
        confidence_percent,
        severity: info.severity,
        description: info.description,
        symptoms: info.symptoms,
        treatment: info.treatment,
        prevention: info.prevention,
    })
}
