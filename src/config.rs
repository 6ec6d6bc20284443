//! Configuration for the pipeline stages
//!
//! Plain structs with serde derives and explicit defaults. Every stage takes
//! its config by value at construction time; nothing is re-read afterwards.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Retry behavior shared by the auth driver and the transmitters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// How many times to try again in case of a failure
    pub max_retries: u32,
    /// Initial delay between successive retries in seconds
    pub initial_retry_delay_s: f64,
    /// Maximum delay between successive retries in seconds
    pub max_retry_delay_s: f64,
    /// Response status codes for which a retry attempt must be made
    pub retry_status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_retry_delay_s: 1.0,
            max_retry_delay_s: 60.0,
            retry_status_codes: vec![429, 500, 503],
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry_nr` (0-based):
    /// `min(initial * 2^retry_nr, max)`
    pub fn backoff(&self, retry_nr: u32) -> Duration {
        let delay = self.initial_retry_delay_s * 2f64.powi(retry_nr as i32);
        Duration::from_secs_f64(delay.min(self.max_retry_delay_s).max(0.0))
    }

    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_status_codes.contains(&status)
    }
}

/// Configuration for the namespace-keyed point buffer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Maximum time points linger in a buffer before being flushed, in seconds
    pub linger_time_s: f64,
    /// Maximum size of a single outgoing telemessage payload in bytes
    pub max_batch_bytes: usize,
    /// Maximum combined size of all buffers before everything is flushed
    pub max_total_buffer_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            linger_time_s: 1.0,
            max_batch_bytes: 10_000_000,
            max_total_buffer_bytes: 100_000_000,
        }
    }
}

/// Configuration for the point-duplicate filter
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Maximum time a field value is remembered, based on when it was last
    /// submitted to the filter (unrelated to the point's own timestamp)
    pub max_entry_age_s: u64,
    /// Maximum number of remembered entries per series
    pub max_series_entry_count: usize,
    /// Maximum number of remembered entries in total
    pub max_entry_count: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            max_entry_age_s: 2 * 24 * 3600,
            max_series_entry_count: 1_000,
            max_entry_count: 10_000_000,
        }
    }
}

/// Configuration for the direct (unbuffered) point writer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectWriterConfig {
    /// Maximum size of a single outgoing telemessage payload in bytes
    pub max_batch_bytes: usize,
}

impl Default for DirectWriterConfig {
    fn default() -> Self {
        Self {
            max_batch_bytes: 10_000_000,
        }
    }
}

/// Configuration for the gzip compression stage
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GzipConfig {
    /// Compression level in the range 0-9
    pub compress_level: u32,
}

impl Default for GzipConfig {
    fn default() -> Self {
        Self { compress_level: 9 }
    }
}

/// Configuration for the background and direct telemessage transmitters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransmitterConfig {
    /// The url the telemessages are posted to
    pub url: String,
    /// Fixed query parameters included in every request
    pub params: Vec<(String, String)>,
    /// Request timeout in seconds
    pub timeout_s: f64,
    /// Retry behavior for failed transmissions
    pub retry: RetryPolicy,
    /// Folder for crash-survival snapshots of pending messages; None disables
    pub snapshot_folder: Option<PathBuf>,
    /// Messages younger than this are not snapshotted periodically, in seconds
    pub min_snapshot_age_s: f64,
    /// Interval between periodic snapshot passes, in seconds
    pub snapshot_period_s: f64,
    /// Maximum number of pending messages kept in the retry heap; None is
    /// unbounded. Enforced lazily by truncating the heap's backing array.
    pub max_heap_size: Option<usize>,
}

impl TransmitterConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            params: Vec::new(),
            timeout_s: 60.0,
            retry: RetryPolicy::default(),
            snapshot_folder: None,
            min_snapshot_age_s: 60.0,
            snapshot_period_s: 3600.0,
            max_heap_size: None,
        }
    }
}

/// Configuration for the authentication driver
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    /// Base url of the authentication endpoints
    pub auth_url: String,
    /// Base url prepended to relative API paths
    pub api_url: String,
    /// Request timeout in seconds
    pub timeout_s: f64,
    /// Retry behavior for authenticated API calls
    pub retry: RetryPolicy,
}

impl AuthConfig {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        auth_url: impl Into<String>,
        api_url: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            auth_url: auth_url.into(),
            api_url: api_url.into(),
            timeout_s: 60.0,
            retry: RetryPolicy::default(),
        }
    }
}
