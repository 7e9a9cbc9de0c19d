//! Protocol configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Transaction layer configuration
    pub transaction: TransactionConfig,
    /// Retry manager configuration
    pub retry: RetryConfig,
    /// Cache lifetimes
    pub cache: CacheConfig,
    /// Record sent messages for retry correlation
    #[serde(default = "default_true")]
    pub enable_recent_message_cache: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transaction: TransactionConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            enable_recent_message_cache: true,
        }
    }
}

impl ClientConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        self.transaction.validate()?;
        self.retry.validate()?;
        self.cache.validate()?;
        Ok(())
    }
}

/// Transaction commit configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Commit attempts before giving up
    pub max_commit_retries: u32,
    /// Delay between commit attempts (milliseconds)
    pub delay_between_tries_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_commit_retries: 10,
            delay_between_tries_ms: 3000,
        }
    }
}

impl TransactionConfig {
    /// Delay between commit attempts
    pub fn delay_between_tries(&self) -> Duration {
        Duration::from_millis(self.delay_between_tries_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_commit_retries == 0 {
            return Err("max_commit_retries must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Message retry configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Resend attempts per message before giving up
    pub max_msg_retry_count: u32,
    /// Recently sent messages kept for retry correlation
    pub recent_messages_capacity: usize,
    /// Minimum time between session recreations for one address (seconds)
    pub recreate_session_timeout_secs: u64,
    /// Lifetime of a retry counter (seconds)
    pub retry_counter_ttl_secs: u64,
    /// Delay before falling back to a phone resend request (milliseconds)
    pub phone_request_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_msg_retry_count: 5,
            recent_messages_capacity: 512,
            recreate_session_timeout_secs: 3600, // 1 hour
            retry_counter_ttl_secs: 15 * 60,
            phone_request_delay_ms: 3000,
        }
    }
}

impl RetryConfig {
    /// Session recreation cool-down
    pub fn recreate_session_timeout(&self) -> Duration {
        Duration::from_secs(self.recreate_session_timeout_secs)
    }

    /// Retry counter lifetime
    pub fn retry_counter_ttl(&self) -> Duration {
        Duration::from_secs(self.retry_counter_ttl_secs)
    }

    /// Phone request delay
    pub fn phone_request_delay(&self) -> Duration {
        Duration::from_millis(self.phone_request_delay_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.recent_messages_capacity == 0 {
            return Err("recent_messages_capacity must be greater than 0".to_string());
        }
        if self.max_msg_retry_count == 0 {
            return Err("max_msg_retry_count must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Cache lifetimes
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Signal key store cache (seconds)
    pub signal_store_ttl_secs: u64,
    /// User device list cache (seconds)
    pub user_devices_ttl_secs: u64,
    /// Session presence cache (seconds)
    pub peer_sessions_ttl_secs: u64,
    /// Identity mapping cache (seconds)
    pub lid_mapping_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            signal_store_ttl_secs: 5 * 60,
            user_devices_ttl_secs: 5 * 60,
            peer_sessions_ttl_secs: 5 * 60,
            lid_mapping_ttl_secs: 7 * 24 * 3600, // 7 days
        }
    }
}

impl CacheConfig {
    /// Signal key store cache lifetime
    pub fn signal_store_ttl(&self) -> Duration {
        Duration::from_secs(self.signal_store_ttl_secs)
    }

    /// User device list cache lifetime
    pub fn user_devices_ttl(&self) -> Duration {
        Duration::from_secs(self.user_devices_ttl_secs)
    }

    /// Session presence cache lifetime
    pub fn peer_sessions_ttl(&self) -> Duration {
        Duration::from_secs(self.peer_sessions_ttl_secs)
    }

    /// Identity mapping cache lifetime
    pub fn lid_mapping_ttl(&self) -> Duration {
        Duration::from_secs(self.lid_mapping_ttl_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.lid_mapping_ttl_secs == 0 {
            return Err("lid_mapping_ttl_secs must be greater than 0".to_string());
        }
        Ok(())
    }
}
