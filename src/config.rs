use serde::Deserialize;
use std::time::Duration;

use crate::services::RetryPolicy;

/// Application configuration loaded from environment variables
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Attempts per optimistic write (and consecutive reconnects per subscription)
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    /// First backoff delay in milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: bool,

    /// Snapshots buffered per subscriber before the pump waits
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer: usize,

    /// Default size of the top rated listing
    #[serde(default = "default_top_rated_limit")]
    pub top_rated_limit: usize,

    /// Change events buffered by the in-memory store before slow feeds lag
    #[serde(default = "default_change_feed_capacity")]
    pub change_feed_capacity: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    10
}

fn default_retry_max_delay_ms() -> u64 {
    500
}

fn default_retry_jitter() -> bool {
    true
}

fn default_subscription_buffer() -> usize {
    16
}

fn default_top_rated_limit() -> usize {
    10
}

fn default_change_feed_capacity() -> usize {
    256
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        envy::from_env::<Config>().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))
    }

    /// Retry policy shared by the coordinator and subscription reconnects
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backoff_multiplier: 2.0,
            jitter: self.retry_jitter,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
