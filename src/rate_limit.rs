use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;

/// Per-identity conversion quota over two sliding windows. State lives in
/// memory only; the service is stateless aside from transient files.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
    per_minute: usize,
    per_hour: usize,
}

/// Seconds the caller should wait before trying again.
pub type RetryAfterSeconds = u64;

impl RateLimiter {
    pub fn new(per_minute: usize, per_hour: usize) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            per_minute,
            per_hour,
        }
    }

    /// Registers one conversion attempt for `identity`, or reports how long
    /// until the tightest exceeded window reopens.
    pub async fn register(&self, identity: &str) -> Result<(), RetryAfterSeconds> {
        self.register_at(identity, Utc::now()).await
    }

    async fn register_at(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RetryAfterSeconds> {
        let hour_start = now - ChronoDuration::hours(1);
        let minute_start = now - ChronoDuration::minutes(1);

        let mut windows = self.windows.lock().await;
        let entries = windows.entry(identity.to_string()).or_default();
        entries.sort();
        entries.retain(|timestamp| *timestamp > hour_start);

        let in_minute = entries
            .iter()
            .filter(|timestamp| **timestamp > minute_start)
            .count();

        if in_minute >= self.per_minute {
            let oldest_in_minute = entries
                .iter()
                .find(|timestamp| **timestamp > minute_start)
                .copied()
                .unwrap_or(now);
            let reopens = oldest_in_minute + ChronoDuration::minutes(1);
            return Err((reopens - now).num_seconds().max(1) as u64);
        }

        if entries.len() >= self.per_hour {
            let reopens = entries.first().copied().unwrap_or(now) + ChronoDuration::hours(1);
            return Err((reopens - now).num_seconds().max(1) as u64);
        }

        entries.push(now);
        Ok(())
    }
}
