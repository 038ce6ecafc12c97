//! Configuration for the chunk cache and its row-range service
//!
//! Values come from the environment, falling back to the defaults below.

use gridstream_common::{GridError, Result};
use std::time::Duration;

/// Rows per cached chunk.
pub const DEFAULT_CHUNK_SIZE: u64 = 2000;

/// Upper bound on resident chunks.
pub const DEFAULT_MAX_CACHED_CHUNKS: usize = 20;

/// Milliseconds of idle time one extra access is worth when scoring eviction candidates.
pub const DEFAULT_FREQUENCY_WEIGHT_MS: u64 = 2000;

/// Default row-range server when not specified via environment variable.
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8000";

/// Default timeout for row-range requests in seconds.
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 300;

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub chunk_size: u64,
    pub max_cached_chunks: usize,
    pub frequency_weight_ms: u64,
    /// Base URL of the row-range service
    pub server_url: String,
    pub api_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_cached_chunks: DEFAULT_MAX_CACHED_CHUNKS,
            frequency_weight_ms: DEFAULT_FREQUENCY_WEIGHT_MS,
            server_url: DEFAULT_SERVER_URL.to_string(),
            api_timeout_secs: DEFAULT_API_TIMEOUT_SECS,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl CacheConfig {
    /// Load configuration from environment and defaults
    ///
    /// Environment variables:
    /// - `GRIDSTREAM_CHUNK_SIZE`
    /// - `GRIDSTREAM_MAX_CACHED_CHUNKS`
    /// - `GRIDSTREAM_FREQUENCY_WEIGHT_MS`
    /// - `GRIDSTREAM_SERVER_URL`
    /// - `GRIDSTREAM_API_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self> {
        let config = Self {
            chunk_size: env_or("GRIDSTREAM_CHUNK_SIZE", DEFAULT_CHUNK_SIZE),
            max_cached_chunks: env_or("GRIDSTREAM_MAX_CACHED_CHUNKS", DEFAULT_MAX_CACHED_CHUNKS),
            frequency_weight_ms: env_or(
                "GRIDSTREAM_FREQUENCY_WEIGHT_MS",
                DEFAULT_FREQUENCY_WEIGHT_MS,
            ),
            server_url: std::env::var("GRIDSTREAM_SERVER_URL")
                .unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string()),
            api_timeout_secs: env_or("GRIDSTREAM_API_TIMEOUT_SECS", DEFAULT_API_TIMEOUT_SECS),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(GridError::config("chunk_size must be greater than 0"));
        }

        if self.max_cached_chunks == 0 {
            return Err(GridError::config("max_cached_chunks must be greater than 0"));
        }

        if !self.server_url.starts_with("http://") && !self.server_url.starts_with("https://") {
            return Err(GridError::config(format!(
                "server_url must be an http(s) URL, got {}",
                self.server_url
            )));
        }

        Ok(())
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size, 2000);
        assert_eq!(config.max_cached_chunks, 20);
        assert_eq!(config.api_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let zero_chunks = CacheConfig {
            max_cached_chunks: 0,
            ..CacheConfig::default()
        };
        assert!(matches!(zero_chunks.validate(), Err(GridError::Config(_))));

        let bad_url = CacheConfig {
            server_url: "localhost:8000".to_string(),
            ..CacheConfig::default()
        };
        assert!(bad_url.validate().is_err());
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("GRIDSTREAM_CHUNK_SIZE", "100");
        std::env::set_var("GRIDSTREAM_SERVER_URL", "https://rows.example.org");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.chunk_size, 100);
        assert_eq!(config.server_url, "https://rows.example.org");
        assert_eq!(config.max_cached_chunks, DEFAULT_MAX_CACHED_CHUNKS);

        std::env::remove_var("GRIDSTREAM_CHUNK_SIZE");
        std::env::remove_var("GRIDSTREAM_SERVER_URL");
    }
}
