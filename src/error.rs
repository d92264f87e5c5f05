//! Error types for pack_cache

use thiserror::Error;

/// Unified error type for cache and pack operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// No storage tier accepted a probe round-trip
    #[error("No storage tier available: {0}")]
    StorageUnavailable(String),
    /// A tier rejected a write because it is full
    #[error("Storage quota exceeded while writing {key} ({bytes} bytes)")]
    QuotaExceeded { key: String, bytes: usize },
    /// Remote image fetch did not complete within the per-fetch timeout
    #[error("Timed out fetching image from: {0}")]
    FetchTimeout(String),
    /// Remote image fetch returned nothing usable
    #[error("Failed to fetch image from {url}: {reason}")]
    FetchFailed { url: String, reason: String },
    /// HTTP error status code
    #[error("HTTP error: {0}")]
    HttpStatus(reqwest::StatusCode),
    /// HTTP request failed (network error, connection refused, etc.)
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    /// A batch write was rolled back as a whole
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),
    /// An acquisition run produced no records at all
    #[error("No cards acquired ({attempted} candidates attempted)")]
    NothingAcquired { attempted: usize },
    /// No cached card with this id
    #[error("Card not found: {0}")]
    CardNotFound(String),
    /// Pack spec weights or size are unusable
    #[error("Invalid pack spec: {0}")]
    InvalidPackSpec(String),
    /// Failed to parse or serialize JSON
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Image decoding or encoding failed
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    /// Manifest could not be read
    #[error("Manifest error: {0}")]
    Csv(#[from] csv::Error),
    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Blocking task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    /// A shared lock was poisoned by a panicking holder
    #[error("Lock poisoned: {0}")]
    Poisoned(&'static str),
}

impl CacheError {
    /// True for the quota condition that drives progressive eviction
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, CacheError::QuotaExceeded { .. })
    }
}

/// Result alias for pack_cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Lock a mutex, turning poisoning into an error instead of a panic
pub(crate) fn lock<'a, T>(
    mutex: &'a std::sync::Mutex<T>,
    what: &'static str,
) -> Result<std::sync::MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| CacheError::Poisoned(what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_exceeded_is_detected() {
        let err = CacheError::QuotaExceeded {
            key: "pack_cache.session".to_string(),
            bytes: 1024,
        };
        assert!(err.is_quota_exceeded());
        assert!(!CacheError::TransactionAborted("x".to_string()).is_quota_exceeded());
    }

    #[test]
    fn display_messages() {
        let err = CacheError::NothingAcquired { attempted: 8 };
        assert_eq!(err.to_string(), "No cards acquired (8 candidates attempted)");

        let err = CacheError::FetchTimeout("https://example.com/a.png".to_string());
        assert!(err.to_string().contains("https://example.com/a.png"));
    }
}
