use crate::config::{FrameSourceConfig, MonitoringConfig};
use crate::frame::{FrameIdentity, FrameRef, StreamMode};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum FrameSourceError {
    #[error("Frame source did not answer within {0}ms")]
    ProbeTimeout(u64),
    #[error("Frame source unreachable: {0}")]
    Unreachable(String),
    #[error("Frame fetch failed: {0}")]
    FetchFailed(String),
}

#[async_trait]
pub trait FrameSource: Send + Sync + 'static {
    /// One bounded reachability check before a session starts streaming.
    async fn probe(&self) -> Result<(), FrameSourceError>;

    async fn fetch_next_frame(&self) -> Result<FrameRef, FrameSourceError>;
}

#[derive(Debug, Clone)]
enum Endpoint {
    /// Rotating dataset image, re-requested with a cache-busting parameter.
    Dataset { stream_url: String },
    /// ESP32-CAM: MJPEG stream for the probe, still capture per tick.
    Drone {
        stream_url: String,
        capture_url: String,
    },
}

pub struct HttpFrameSource {
    client: Client,
    endpoint: Endpoint,
    timeout: Duration,
    last_stamp_ms: AtomicI64,
}

impl HttpFrameSource {
    pub fn new(
        client: Client,
        mode: StreamMode,
        frame_source: &FrameSourceConfig,
        monitoring: &MonitoringConfig,
    ) -> Self {
        let endpoint = match mode {
            StreamMode::Simulated => Endpoint::Dataset {
                stream_url: frame_source.get_dataset_stream_url(),
            },
            StreamMode::Live => Endpoint::Drone {
                stream_url: frame_source.get_drone_stream_url(),
                capture_url: frame_source.get_drone_capture_url(),
            },
        };
        Self {
            client,
            endpoint,
            timeout: Duration::from_millis(monitoring.get_probe_timeout_ms(mode)),
            last_stamp_ms: AtomicI64::new(0),
        }
    }

    /// Wall-clock millis, bumped when two fetches land in the same
    /// millisecond so successive identities never collide.
    fn next_stamp_ms(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_stamp_ms.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self.last_stamp_ms.compare_exchange_weak(
                last,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }

    fn classify_send_error(&self, err: reqwest::Error) -> FrameSourceError {
        if err.is_timeout() {
            FrameSourceError::ProbeTimeout(self.timeout.as_millis() as u64)
        } else {
            FrameSourceError::Unreachable(err.to_string())
        }
    }
}

#[async_trait]
impl FrameSource for HttpFrameSource {
    #[instrument(skip(self))]
    async fn probe(&self) -> Result<(), FrameSourceError> {
        let url = match &self.endpoint {
            Endpoint::Dataset { stream_url } => format!("{}?t={}", stream_url, self.next_stamp_ms()),
            Endpoint::Drone { stream_url, .. } => stream_url.clone(),
        };

        // Headers are enough; the drone stream body never ends.
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.classify_send_error(e))?;

        if !response.status().is_success() {
            return Err(FrameSourceError::Unreachable(format!(
                "{} answered HTTP {}",
                url,
                response.status()
            )));
        }
        tracing::info!("Frame source {} is reachable", url);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fetch_next_frame(&self) -> Result<FrameRef, FrameSourceError> {
        let stamp = self.next_stamp_ms();
        let (url, identity) = match &self.endpoint {
            Endpoint::Dataset { stream_url } => {
                let url = format!("{}?t={}", stream_url, stamp);
                (url.clone(), FrameIdentity::new(url))
            }
            Endpoint::Drone { capture_url, .. } => (
                capture_url.clone(),
                FrameIdentity::new(format!("{}@{}", capture_url, stamp)),
            ),
        };

        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| FrameSourceError::FetchFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FrameSourceError::FetchFailed(format!(
                "{} answered HTTP {}",
                url, status
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FrameSourceError::FetchFailed(e.to_string()))?;
        if body.is_empty() {
            return Err(FrameSourceError::FetchFailed(format!(
                "{} returned an empty body",
                url
            )));
        }

        let captured_at = Utc
            .timestamp_millis_opt(stamp)
            .single()
            .unwrap_or_else(Utc::now);

        Ok(FrameRef::new(identity, body, captured_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(mode: StreamMode) -> HttpFrameSource {
        let frame_source = FrameSourceConfig {
            dataset_base_url: "http://127.0.0.1:5000".into(),
            drone_host: "192.168.4.1".into(),
        };
        HttpFrameSource::new(
            Client::new(),
            mode,
            &frame_source,
            &MonitoringConfig::default(),
        )
    }

    #[test]
    fn stamps_are_strictly_increasing() {
        let source = source(StreamMode::Simulated);
        let mut previous = source.next_stamp_ms();
        for _ in 0..1000 {
            let next = source.next_stamp_ms();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn timeout_follows_mode() {
        assert_eq!(source(StreamMode::Live).timeout, Duration::from_millis(3_000));
        assert_eq!(
            source(StreamMode::Simulated).timeout,
            Duration::from_millis(5_000)
        );
    }
}
