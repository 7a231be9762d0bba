use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Longest lifetime an entry can have; longer TTLs mean "until cleared".
pub const MAX_LIFETIME: Duration = Duration::from_secs(86_400 * 365 * 30);

fn expiry(now: Instant, ttl: Duration) -> Instant {
    now + ttl.min(MAX_LIFETIME)
}

/// A cached value together with its lifetime bookkeeping.
///
/// Expiry and staleness decisions use the monotonic `fetched_at`/`expires_at`
/// pair; `cached_at` is wall-clock time kept for display and persistence.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub data: V,
    pub cached_at: DateTime<Utc>,
    pub fetched_at: Instant,
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    pub fn new(key: impl Into<String>, data: V, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            key: key.into(),
            data,
            cached_at: Utc::now(),
            fetched_at: now,
            expires_at: expiry(now, ttl),
        }
    }

    /// Rebuild an entry loaded from the session mirror with its remaining lifetime.
    pub(crate) fn restored(
        key: String,
        data: V,
        cached_at: DateTime<Utc>,
        remaining: Duration,
    ) -> Self {
        let now = Instant::now();
        let age = (Utc::now() - cached_at).to_std().unwrap_or_default();
        Self {
            key,
            data,
            cached_at,
            fetched_at: now.checked_sub(age).unwrap_or(now),
            expires_at: expiry(now, remaining),
        }
    }

    /// Whether `other` is the same write of this key, not a later or earlier one.
    pub(crate) fn is_same_write(&self, other: &CacheEntry<V>) -> bool {
        self.key == other.key
            && self.fetched_at == other.fetched_at
            && self.cached_at == other.cached_at
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.fetched_at)
    }

    /// An entry at or past its expiry is treated as absent.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    pub fn is_stale(&self, now: Instant, stale_after: Option<Duration>) -> bool {
        match stale_after {
            Some(stale) => now.saturating_duration_since(self.fetched_at) >= stale,
            None => false,
        }
    }

    /// Time left before the entry expires, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn expires_at_wall(&self) -> DateTime<Utc> {
        let remaining = chrono::Duration::from_std(self.remaining()).unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() + remaining
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.cached_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}
