//! Message retry bookkeeping
//!
//! Tracks recently sent messages so a retry request from a recipient can be
//! answered, throttles session recreation per address, counts resend attempts
//! per message and schedules the phone resend fallback.

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use tessera_core::{Jid, Message, TtlCache};

use crate::config::RetryConfig;

/// A sent message kept for retry correlation
#[derive(Clone, Debug)]
pub struct RecentMessage {
    /// Message as sent
    pub message: Message,
    /// Send time
    pub timestamp: DateTime<Utc>,
}

/// Outcome of [`MessageRetryManager::should_recreate_session`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecreateDecision {
    /// Rebuild the session
    pub recreate: bool,
    /// Why, empty when not rebuilding
    pub reason: &'static str,
}

/// Retry counters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RetryStatistics {
    /// Resend attempts
    pub total_retries: u64,
    /// Messages that went through after retrying
    pub successful_retries: u64,
    /// Messages given up on
    pub failed_retries: u64,
    /// Media re-upload requests
    pub media_retries: u64,
    /// Sessions rebuilt
    pub session_recreations: u64,
    /// Phone resend requests fired
    pub phone_requests: u64,
}

type PendingRequests = HashMap<String, (u64, JoinHandle<()>)>;

/// Recent-message cache, retry counters and session recreation throttling
pub struct MessageRetryManager {
    config: RetryConfig,
    recent_messages: Mutex<LruCache<String, RecentMessage>>,
    session_recreate_history: Mutex<TtlCache<String, Instant>>,
    retry_counters: Mutex<TtlCache<String, u32>>,
    pending_phone_requests: Arc<Mutex<PendingRequests>>,
    next_request: AtomicU64,
    statistics: Arc<Mutex<RetryStatistics>>,
}

impl MessageRetryManager {
    /// Create with the given limits
    pub fn new(config: RetryConfig) -> Self {
        let capacity = NonZeroUsize::new(config.recent_messages_capacity).unwrap_or(NonZeroUsize::MIN);
        let history_ttl = config.recreate_session_timeout() * 2;
        let counter_ttl = config.retry_counter_ttl();
        Self {
            recent_messages: Mutex::new(LruCache::new(capacity)),
            session_recreate_history: Mutex::new(TtlCache::new(history_ttl)),
            retry_counters: Mutex::new(TtlCache::new(counter_ttl).update_age_on_get(true)),
            pending_phone_requests: Arc::new(Mutex::new(HashMap::new())),
            next_request: AtomicU64::new(0),
            statistics: Arc::new(Mutex::new(RetryStatistics::default())),
            config,
        }
    }

    fn message_key(to: &Jid, id: &str) -> String {
        format!("{}:{}", to, id)
    }

    /// Remember a sent message. The least recently used entry is evicted when full.
    pub fn add_recent_message(&self, to: &Jid, id: &str, message: Message) {
        let record = RecentMessage {
            message,
            timestamp: Utc::now(),
        };
        self.recent_messages.lock().put(Self::message_key(to, id), record);
        debug!("Added message to retry cache: {}/{}", to, id);
    }

    /// A remembered message
    pub fn get_recent_message(&self, to: &Jid, id: &str) -> Option<RecentMessage> {
        self.recent_messages.lock().get(&Self::message_key(to, id)).cloned()
    }

    /// Decide whether to rebuild the session with `jid`.
    ///
    /// Always rebuilds without a session. With one, rebuilds only from the
    /// second retry on and at most once per cool-down.
    pub fn should_recreate_session(&self, jid: &Jid, retry_count: u32, has_session: bool) -> RecreateDecision {
        let key = jid.to_string();
        let now = Instant::now();

        if !has_session {
            self.session_recreate_history.lock().insert(key, now);
            self.statistics.lock().session_recreations += 1;
            return RecreateDecision {
                recreate: true,
                reason: "we dont have a Signal session with them",
            };
        }

        if retry_count < 2 {
            return RecreateDecision {
                recreate: false,
                reason: "",
            };
        }

        let mut history = self.session_recreate_history.lock();
        let cooled_down = match history.get(&key) {
            None => true,
            Some(prev) => now.duration_since(*prev) > self.config.recreate_session_timeout(),
        };
        if cooled_down {
            history.insert(key, now);
            self.statistics.lock().session_recreations += 1;
            return RecreateDecision {
                recreate: true,
                reason: "retry count > 1 and over an hour since last recreation",
            };
        }

        RecreateDecision {
            recreate: false,
            reason: "",
        }
    }

    /// Count one more resend of `message_id`, returning the new count
    pub fn increment_retry_count(&self, message_id: &str) -> u32 {
        let mut counters = self.retry_counters.lock();
        let count = counters.get(message_id).copied().unwrap_or(0) + 1;
        counters.insert(message_id.to_string(), count);
        self.statistics.lock().total_retries += 1;
        count
    }

    /// Resends of `message_id` so far
    pub fn get_retry_count(&self, message_id: &str) -> u32 {
        self.retry_counters.lock().get(message_id).copied().unwrap_or(0)
    }

    /// Retry limit reached
    pub fn has_exceeded_max_retries(&self, message_id: &str) -> bool {
        self.get_retry_count(message_id) >= self.config.max_msg_retry_count
    }

    /// The message went through; drop its counter and pending phone request
    pub fn mark_retry_success(&self, message_id: &str) {
        self.statistics.lock().successful_retries += 1;
        self.retry_counters.lock().remove(message_id);
        self.cancel_pending_phone_request(message_id);
    }

    /// Give up on the message
    pub fn mark_retry_failed(&self, message_id: &str) {
        self.statistics.lock().failed_retries += 1;
        self.retry_counters.lock().remove(message_id);
    }

    /// Count a media re-upload request
    pub fn record_media_retry(&self) {
        self.statistics.lock().media_retries += 1;
    }

    /// Run `callback` after the configured delay unless cancelled first.
    /// Replaces any request already pending for `message_id`.
    pub fn schedule_phone_request<F>(&self, message_id: &str, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_phone_request_after(message_id, self.config.phone_request_delay(), callback);
    }

    /// [`schedule_phone_request`](Self::schedule_phone_request) with an explicit delay
    pub fn schedule_phone_request_after<F>(&self, message_id: &str, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Held across spawn so the task cannot observe the map before its entry exists
        let mut pending = self.pending_phone_requests.lock();
        if let Some((_, previous)) = pending.remove(message_id) {
            previous.abort();
            debug!("Cancelled pending phone request for message {}", message_id);
        }

        let generation = self.next_request.fetch_add(1, Ordering::Relaxed);
        let requests = self.pending_phone_requests.clone();
        let statistics = self.statistics.clone();
        let id = message_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut requests = requests.lock();
                match requests.get(&id) {
                    Some((current, _)) if *current == generation => {
                        requests.remove(&id);
                    }
                    _ => return,
                }
            }
            statistics.lock().phone_requests += 1;
            callback();
        });
        pending.insert(message_id.to_string(), (generation, handle));
        debug!(
            "Scheduled phone request for message {} with {}ms delay",
            message_id,
            delay.as_millis()
        );
    }

    /// Cancel the pending phone request for `message_id`, if any
    pub fn cancel_pending_phone_request(&self, message_id: &str) {
        if let Some((_, handle)) = self.pending_phone_requests.lock().remove(message_id) {
            handle.abort();
            debug!("Cancelled pending phone request for message {}", message_id);
        }
    }

    /// A phone request is pending for `message_id`
    pub fn has_pending_phone_request(&self, message_id: &str) -> bool {
        self.pending_phone_requests.lock().contains_key(message_id)
    }

    /// Snapshot of the counters
    pub fn statistics(&self) -> RetryStatistics {
        self.statistics.lock().clone()
    }
}

impl Drop for MessageRetryManager {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.pending_phone_requests.lock().drain() {
            handle.abort();
        }
    }
}
