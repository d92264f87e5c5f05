//! Engine configuration constants

use std::time::Duration;

/// Working-set ceiling: records allowed in the mirror and durable store at once
pub const DEFAULT_CAP: usize = 32;
/// Cards dealt per pack
pub const DEFAULT_PACK_SIZE: usize = 8;
/// Unshown count at or below which a background refill starts
pub const DEFAULT_REFILL_THRESHOLD: usize = 16;
/// Concurrent fetches per acquisition wave
pub const DEFAULT_WAVE_WIDTH: usize = 4;
/// Per-fetch timeout for remote images
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Byte quota of the file-backed fast tier
pub const DEFAULT_MIRROR_QUOTA_BYTES: u64 = 4 * 1024 * 1024;

/// Recompressed images must fit inside this box
pub const DEFAULT_MAX_IMAGE_WIDTH: u32 = 480;
pub const DEFAULT_MAX_IMAGE_HEIGHT: u32 = 680;
pub const DEFAULT_JPEG_QUALITY: u8 = 75;

/// Usage ratio above which `status()` logs an advisory warning
pub const USAGE_WARNING_RATIO: f64 = 0.8;

/// Tunables shared by the pipeline, tracker and pack generator
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub cap: usize,
    pub pack_size: usize,
    pub refill_threshold: usize,
    pub wave_width: usize,
    pub fetch_timeout: Duration,
    pub max_image_width: u32,
    pub max_image_height: u32,
    pub jpeg_quality: u8,
    pub mirror_quota_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cap: DEFAULT_CAP,
            pack_size: DEFAULT_PACK_SIZE,
            refill_threshold: DEFAULT_REFILL_THRESHOLD,
            wave_width: DEFAULT_WAVE_WIDTH,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            max_image_width: DEFAULT_MAX_IMAGE_WIDTH,
            max_image_height: DEFAULT_MAX_IMAGE_HEIGHT,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            mirror_quota_bytes: DEFAULT_MIRROR_QUOTA_BYTES,
        }
    }
}

impl EngineConfig {
    /// Clamp values that would stall the engine (zero pack size, zero wave width)
    pub fn sanitized(mut self) -> Self {
        if self.pack_size == 0 {
            log::warn!("Pack size 0 is not usable, falling back to {}", DEFAULT_PACK_SIZE);
            self.pack_size = DEFAULT_PACK_SIZE;
        }
        if self.wave_width == 0 {
            log::warn!("Wave width 0 is not usable, falling back to 1");
            self.wave_width = 1;
        }
        if self.cap < self.pack_size {
            log::warn!(
                "Working-set ceiling {} is below pack size {}, raising it",
                self.cap,
                self.pack_size
            );
            self.cap = self.pack_size;
        }
        self
    }
}
