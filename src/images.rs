//! Remote image fetching and recompression

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::{CacheError, Result};

const USER_AGENT: &str = "PackCache/1.0";

/// HTTP client for card images with a per-fetch timeout
#[derive(Clone)]
pub struct ImageFetcher {
    client: reqwest::Client,
}

impl ImageFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    /// Download raw image bytes
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        log::debug!("Fetching image from URL: {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_transport_error(url, e))?;

        if !response.status().is_success() {
            log::debug!("Image fetch {} returned {}", url, response.status());
            return Err(CacheError::HttpStatus(response.status()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_transport_error(url, e))?;
        if bytes.is_empty() {
            return Err(CacheError::FetchFailed {
                url: url.to_string(),
                reason: "empty response body".to_string(),
            });
        }
        Ok(bytes.to_vec())
    }

    /// Fetch and recompress in one step; decoding runs on the blocking pool
    pub async fn fetch_compressed(&self, url: &str, config: &EngineConfig) -> Result<Vec<u8>> {
        let raw = self.fetch(url).await?;
        let (max_w, max_h, quality) = (
            config.max_image_width,
            config.max_image_height,
            config.jpeg_quality,
        );
        let compressed = tokio::task::spawn_blocking(move || {
            compress_card_image(&raw, max_w, max_h, quality)
        })
        .await??;
        Ok(compressed)
    }
}

fn classify_transport_error(url: &str, error: reqwest::Error) -> CacheError {
    if error.is_timeout() {
        CacheError::FetchTimeout(url.to_string())
    } else {
        CacheError::Network(error)
    }
}

/// Decode any supported format, shrink to fit `max_width` x `max_height`
/// (aspect ratio kept, never upscaled) and re-encode as JPEG.
pub fn compress_card_image(
    bytes: &[u8],
    max_width: u32,
    max_height: u32,
    quality: u8,
) -> Result<Vec<u8>> {
    let img = image::load_from_memory(bytes)?;

    let img = if img.width() > max_width || img.height() > max_height {
        img.resize(max_width, max_height, FilterType::Triangle)
    } else {
        img
    };

    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode_image(&rgb)?;

    log::debug!(
        "Recompressed image {} -> {} bytes ({}x{})",
        bytes.len(),
        out.len(),
        rgb.width(),
        rgb.height()
    );
    Ok(out)
}
