use crate::detection::{CaptureTrigger, DetectionResult, Severity};
use crate::frame::{FrameIdentity, FrameRef};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::codecs::jpeg::JpegEncoder;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Frame {0} is not loaded or not decodable yet")]
    FrameNotReady(FrameIdentity),
    #[error("Failed to encode snapshot: {0}")]
    Encode(#[from] image::ImageError),
    #[error("Failed to write handoff record: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize handoff record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Snapshot task did not finish: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A rasterized frame plus the result that justified capturing it. Moved
/// into the sink and never kept here.
#[derive(Debug)]
pub struct CaptureEvent {
    pub frame_snapshot: Vec<u8>,
    pub result: DetectionResult,
    pub trigger: CaptureTrigger,
}

#[async_trait]
pub trait HandoffSink: Send + Sync + 'static {
    async fn deliver(&self, event: CaptureEvent) -> Result<(), CaptureError>;
}

pub struct CaptureHandoffService {
    sink: Box<dyn HandoffSink>,
    jpeg_quality: u8,
}

impl CaptureHandoffService {
    pub fn new(sink: Box<dyn HandoffSink>, jpeg_quality: u8) -> Self {
        Self {
            sink,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    #[instrument(skip(self, frame, result), fields(frame_id = %frame.identity()))]
    pub async fn capture(
        &self,
        frame: &FrameRef,
        result: &DetectionResult,
        trigger: CaptureTrigger,
    ) -> Result<(), CaptureError> {
        let snapshot_frame = frame.clone();
        let quality = self.jpeg_quality;
        let frame_snapshot =
            tokio::task::spawn_blocking(move || rasterize(&snapshot_frame, quality)).await??;
        let event = CaptureEvent {
            frame_snapshot,
            result: result.clone(),
            trigger,
        };
        self.sink.deliver(event).await?;
        tracing::info!(
            "Handed off {:?} capture of {} ({:.0}%)",
            trigger,
            result.disease_class,
            result.confidence_percent
        );
        Ok(())
    }
}

/// Decodes (or reuses the cached decode of) the frame and re-encodes it as
/// JPEG. CPU bound, so callers run it off the async workers.
fn rasterize(frame: &FrameRef, quality: u8) -> Result<Vec<u8>, CaptureError> {
    let pixels = frame
        .pixels()
        .ok_or_else(|| CaptureError::FrameNotReady(frame.identity().clone()))?;
    let rgb = pixels.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(&rgb)?;
    Ok(buf)
}

/// The record the disease detail page picks up, consumes and clears.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffRecord {
    pub image: String,
    pub result: HandoffResult,
    pub auto_captured: bool,
}

#[derive(Debug, Serialize)]
pub struct HandoffResult {
    pub disease: String,
    pub confidence: u32,
    pub severity: Severity,
    pub description: String,
    pub symptoms: Vec<String>,
    pub treatment: Vec<String>,
    pub prevention: Vec<String>,
    pub color: &'static str,
}

impl From<CaptureEvent> for HandoffRecord {
    fn from(event: CaptureEvent) -> Self {
        let CaptureEvent {
            frame_snapshot,
            result,
            trigger,
        } = event;
        Self {
            image: format!("data:image/jpeg;base64,{}", STANDARD.encode(frame_snapshot)),
            result: HandoffResult {
                color: result.disease_class.color(),
                disease: result.disease,
                confidence: result.confidence_percent.round() as u32,
                severity: result.severity,
                description: result.description,
                symptoms: result.symptoms,
                treatment: result.treatment,
                prevention: result.prevention,
            },
            auto_captured: trigger == CaptureTrigger::Auto,
        }
    }
}

/// Writes the handoff record to a single well-known file, replacing any
/// record the downstream page has not consumed yet.
pub struct FileHandoffSink {
    path: PathBuf,
}

impl FileHandoffSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl HandoffSink for FileHandoffSink {
    async fn deliver(&self, event: CaptureEvent) -> Result<(), CaptureError> {
        let record = HandoffRecord::from(event);
        let body = serde_json::to_vec(&record)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::test_support::result;
    use crate::frame::test_support::frame;
    use bytes::Bytes;
    use chrono::Utc;

    #[tokio::test]
    async fn writes_record_readable_by_detail_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handoff").join("drone_detection_result.json");
        let service = CaptureHandoffService::new(Box::new(FileHandoffSink::new(path.clone())), 95);

        service
            .capture(&frame("a"), &result("Canker", 87.4), CaptureTrigger::Auto)
            .await
            .unwrap();

        let raw = std::fs::read(&path).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["autoCaptured"], true);
        assert_eq!(json["result"]["confidence"], 87);
        assert_eq!(json["result"]["color"], "#E74C3C");
        assert_eq!(json["result"]["severity"], "high");
        let image = json["image"].as_str().unwrap();
        let encoded = image.strip_prefix("data:image/jpeg;base64,").unwrap();
        let jpeg = STANDARD.decode(encoded).unwrap();
        assert!(image::load_from_memory(&jpeg).is_ok());
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn undecodable_frame_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");
        let service = CaptureHandoffService::new(Box::new(FileHandoffSink::new(path.clone())), 95);
        let broken = FrameRef::new(FrameIdentity::new("half"), Bytes::from_static(b"\xff\xd8"), Utc::now());

        let err = service
            .capture(&broken, &result("Canker", 90.0), CaptureTrigger::Manual)
            .await
            .unwrap_err();

        assert!(matches!(err, CaptureError::FrameNotReady(_)));
        assert!(!path.exists());
    }

    #[test]
    fn manual_capture_is_not_auto() {
        let record = HandoffRecord::from(CaptureEvent {
            frame_snapshot: vec![1, 2, 3],
            result: result("Healthy", 99.0),
            trigger: CaptureTrigger::Manual,
        });
        assert!(!record.auto_captured);
        assert_eq!(record.result.color, "#2ECC71");
        assert_eq!(record.image, "data:image/jpeg;base64,AQID");
    }
}
