//! Side-channel fetch of flagged audio clips.
//!
//! Alerts only carry an [`AudioClipRef`]; the clip itself is downloaded on
//! demand from the relay's HTTP endpoint.

use bytes::Bytes;
use reqwest::StatusCode;
use tracing::debug;

use crate::config::RelayConfig;
use crate::models::alert::AudioClipRef;
use crate::{AppError, Result};

/// HTTP client for the relay's `/audio/{filename}` route.
#[derive(Debug, Clone)]
pub struct EvidenceClient {
    http: reqwest::Client,
    base_url: String,
}

impl EvidenceClient {
    /// Client for the side channel at `base_url` (e.g. `http://127.0.0.1:7401`).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    /// Client for the relay described by `config`, reached on its bind host.
    #[must_use]
    pub fn for_relay(config: &RelayConfig) -> Self {
        Self::new(format!(
            "http://{}:{}",
            config.bind_addr.ip(),
            config.http_port
        ))
    }

    /// Side-channel base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Download the clip behind `clip`.
    ///
    /// # Errors
    ///
    /// - [`AppError::Protocol`]: the file name is not a bare name, or the
    ///   relay answered `400`.
    /// - [`AppError::NotFound`]: the relay has no such clip.
    /// - [`AppError::Channel`]: the request failed or returned another status.
    pub async fn fetch(&self, clip: &AudioClipRef) -> Result<Bytes> {
        if !AudioClipRef::is_safe_filename(&clip.filename) {
            return Err(AppError::Protocol(format!(
                "refusing unsafe clip name {:?}",
                clip.filename
            )));
        }

        let url = clip.url(&self.base_url);
        debug!(url, "fetching audio evidence");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| AppError::Channel(format!("GET {url} failed: {e}")))?;

        match resp.status() {
            StatusCode::OK => resp
                .bytes()
                .await
                .map_err(|e| AppError::Channel(format!("reading {url} failed: {e}"))),
            StatusCode::NOT_FOUND => Err(AppError::NotFound(format!("audio clip {}", clip.filename))),
            StatusCode::BAD_REQUEST => Err(AppError::Protocol(format!(
                "relay rejected clip name {}",
                clip.filename
            ))),
            other => Err(AppError::Channel(format!("GET {url} returned {other}"))),
        }
    }
}
