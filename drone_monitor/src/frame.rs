use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{Arc, OnceLock},
};

/// Where frames come from for the lifetime of a session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    Live,
    #[default]
    Simulated,
}

impl StreamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamMode::Live => "live",
            StreamMode::Simulated => "simulated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Streaming,
    Stopped,
}

/// Exact-match key of a fetched frame. Two fetches never share an identity,
/// even when the pixels happen to be the same.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct FrameIdentity(String);

impl FrameIdentity {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FrameIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fetched frame. The encoded bytes are kept as received; decoding into
/// pixels happens on first use and is cached across clones.
#[derive(Clone)]
pub struct FrameRef {
    identity: FrameIdentity,
    encoded: Bytes,
    captured_at: DateTime<Utc>,
    decoded: Arc<OnceLock<Option<Arc<DynamicImage>>>>,
}

impl FrameRef {
    pub fn new(identity: FrameIdentity, encoded: Bytes, captured_at: DateTime<Utc>) -> Self {
        Self {
            identity,
            encoded,
            captured_at,
            decoded: Arc::new(OnceLock::new()),
        }
    }

    pub fn identity(&self) -> &FrameIdentity {
        &self.identity
    }

    pub fn encoded(&self) -> &Bytes {
        &self.encoded
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Decoded pixels, or `None` while the payload is empty or undecodable.
    pub fn pixels(&self) -> Option<Arc<DynamicImage>> {
        self.decoded
            .get_or_init(|| {
                if self.encoded.is_empty() {
                    return None;
                }
                match image::load_from_memory(&self.encoded) {
                    Ok(img) => Some(Arc::new(img)),
                    Err(e) => {
                        tracing::debug!("Frame {} is not decodable: {}", self.identity, e);
                        None
                    }
                }
            })
            .clone()
    }
}

impl fmt::Debug for FrameRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRef")
            .field("identity", &self.identity)
            .field("bytes", &self.encoded.len())
            .field("captured_at", &self.captured_at)
            .finish()
    }
}
