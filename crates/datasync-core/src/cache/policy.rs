use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default hard lifetime for cached data.
/// Five minutes keeps feature screens snappy without serving day-old data.
pub const DEFAULT_TTL_MS: u64 = 5 * 60 * 1000;

/// Default age after which data is served but refreshed in the background.
pub const DEFAULT_STALE_MS: u64 = 60 * 1000;

/// Freshness rules attached to a single fetch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub stale: Option<Duration>,
    pub revalidate_on_interval: bool,
}

impl CachePolicy {
    /// Policy with a hard lifetime and no staleness window.
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            stale: None,
            revalidate_on_interval: false,
        }
    }

    /// Serve instantly but refresh in the background once older than `stale`.
    /// Clamped to the TTL.
    pub fn stale_after(mut self, stale: Duration) -> Self {
        self.stale = Some(stale.min(self.ttl));
        self
    }

    pub fn revalidate_on_interval(mut self, enabled: bool) -> Self {
        self.revalidate_on_interval = enabled;
        self
    }

    /// Cadence of proactive refetches for subscribed keys.
    pub fn revalidate_interval(&self) -> Duration {
        self.stale.unwrap_or(self.ttl)
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy::ttl(Duration::from_millis(DEFAULT_TTL_MS))
            .stale_after(Duration::from_millis(DEFAULT_STALE_MS))
    }
}

/// What a failed background refresh does to the stale entry it was refreshing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevalidationFailure {
    /// Keep serving the stale value until its TTL runs out.
    #[default]
    KeepStale,
    /// Drop the entry so the next read has to fetch.
    Evict,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_is_clamped_to_ttl() {
        let policy = CachePolicy::ttl(Duration::from_secs(10)).stale_after(Duration::from_secs(60));
        assert_eq!(policy.stale, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_revalidate_interval_falls_back_to_ttl() {
        let policy = CachePolicy::ttl(Duration::from_secs(10)).revalidate_on_interval(true);
        assert_eq!(policy.revalidate_interval(), Duration::from_secs(10));
        let policy = policy.stale_after(Duration::from_secs(4));
        assert_eq!(policy.revalidate_interval(), Duration::from_secs(4));
    }

    #[test]
    fn test_revalidation_failure_serde() {
        let parsed: RevalidationFailure = serde_json::from_str("\"evict\"").unwrap();
        assert_eq!(parsed, RevalidationFailure::Evict);
        assert_eq!(
            serde_json::to_string(&RevalidationFailure::KeepStale).unwrap(),
            "\"keep_stale\""
        );
    }
}
