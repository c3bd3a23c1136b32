//! Segmentation collaborator boundary.
//!
//! Background removal is delegated to an external service that turns an
//! encoded image into an encoded RGBA image with a subject mask in its
//! alpha channel. Calls go through a [`SegmentationPool`] that bounds how
//! many run at once and gives each one a deadline. Nothing is retried here.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use crate::error::{PixelsError, Result};

// ============================================================================
// SETTINGS
// ============================================================================

/// Alpha matting options, forwarded untouched to the collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlphaMatting {
    pub enabled: bool,
    pub foreground_threshold: u8,
    pub background_threshold: u8,
    pub erode_size: u32,
}

impl Default for AlphaMatting {
    fn default() -> Self {
        Self {
            enabled: false,
            foreground_threshold: 240,
            background_threshold: 10,
            erode_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationSettings {
    /// Base URL of a rembg-compatible server, e.g. `http://127.0.0.1:7000`
    pub endpoint: Option<String>,
    /// Deadline for one segmentation call, queueing included (default: 60)
    pub timeout_secs: u64,
    /// Segmentation calls allowed in flight at once (default: 2)
    pub max_concurrent: usize,
}

impl Default for SegmentationSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 60,
            max_concurrent: 2,
        }
    }
}

impl SegmentationSettings {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(PixelsError::InvalidParameter(
                "segmentation timeout must be at least one second".to_string(),
            ));
        }
        if self.max_concurrent == 0 {
            return Err(PixelsError::InvalidParameter(
                "max_concurrent segmentations must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ============================================================================
// COLLABORATOR
// ============================================================================

/// Something that cuts the subject out of an encoded image
pub trait Segmenter: Send + Sync {
    /// Returns an encoded RGBA image whose alpha marks the subject
    fn segment(&self, image: Vec<u8>, matting: AlphaMatting) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// Placeholder used when no segmentation service is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct Unavailable;

impl Segmenter for Unavailable {
    async fn segment(&self, _image: Vec<u8>, _matting: AlphaMatting) -> Result<Vec<u8>> {
        Err(PixelsError::SegmentationFailure(
            "no segmentation service configured".to_string(),
        ))
    }
}

/// Client for a rembg-style HTTP server (`POST /api/remove`)
#[derive(Debug, Clone)]
pub struct HttpSegmenter {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSegmenter {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/');
        if base_url.is_empty() {
            return Err(PixelsError::InvalidParameter(
                "segmentation endpoint is empty".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| PixelsError::InvalidParameter(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/remove", base_url),
        })
    }

    pub fn from_settings(settings: &SegmentationSettings) -> Result<Self> {
        match settings.endpoint.as_deref() {
            Some(url) => Self::new(url),
            None => Err(PixelsError::InvalidParameter(
                "segmentation endpoint is not set".to_string(),
            )),
        }
    }

    fn query(matting: &AlphaMatting) -> Vec<(&'static str, String)> {
        let mut query = vec![("a", matting.enabled.to_string())];
        if matting.enabled {
            query.push(("af", matting.foreground_threshold.to_string()));
            query.push(("ab", matting.background_threshold.to_string()));
            query.push(("ae", matting.erode_size.to_string()));
        }
        query
    }
}

impl Segmenter for HttpSegmenter {
    async fn segment(&self, image: Vec<u8>, matting: AlphaMatting) -> Result<Vec<u8>> {
        let part = reqwest::multipart::Part::bytes(image).file_name("image");
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&self.endpoint)
            .query(&Self::query(&matting))
            .multipart(form)
            .send()
            .await
            .map_err(|e| PixelsError::SegmentationFailure(format!("request to {} failed: {}", self.endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PixelsError::SegmentationFailure(format!(
                "server returned {}: {}",
                status,
                body.trim()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PixelsError::SegmentationFailure(format!("failed to read response: {}", e)))?;
        Ok(bytes.to_vec())
    }
}

// ============================================================================
// POOL
// ============================================================================

/// Bounded, deadline-enforcing front for a [`Segmenter`]
pub struct SegmentationPool<S> {
    segmenter: S,
    permits: Semaphore,
    timeout: Duration,
}

impl<S: Segmenter> SegmentationPool<S> {
    pub fn new(segmenter: S, max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            segmenter,
            permits: Semaphore::new(max_concurrent.max(1)),
            timeout,
        }
    }

    pub fn segmenter(&self) -> &S {
        &self.segmenter
    }

    /// Segment `image`, failing with [`PixelsError::SegmentationTimeout`]
    /// when waiting for a slot plus the call itself exceed the deadline.
    pub async fn segment(&self, image: Vec<u8>, matting: AlphaMatting) -> Result<Vec<u8>> {
        let call = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| PixelsError::SegmentationFailure("segmentation pool closed".to_string()))?;
            debug!(bytes = image.len(), alpha_matting = matting.enabled, "segmenting");
            self.segmenter.segment(image, matting).await
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout = ?self.timeout, "segmentation timed out");
                Err(PixelsError::SegmentationTimeout(self.timeout))
            }
        }
    }
}
