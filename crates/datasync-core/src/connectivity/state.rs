use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marker recorded when the network itself is unreachable.
pub const ERROR_OFFLINE: &str = "offline";

/// Marker recorded when a health check times out or fails at the network level.
pub const ERROR_TIMEOUT: &str = "timeout";

/// Backend reported itself degraded.
pub const ERROR_DEGRADED: &str = "degraded";

/// Backend reported itself down.
pub const ERROR_BACKEND_DOWN: &str = "backend_down";

/// Health endpoint answered 2xx without a recognizable status.
pub const ERROR_INVALID_PAYLOAD: &str = "invalid_payload";

/// Observed availability of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum BackendStatus {
    /// No health check has resolved yet.
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Down,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::Unknown => "unknown",
            BackendStatus::Healthy => "healthy",
            BackendStatus::Degraded => "degraded",
            BackendStatus::Down => "down",
        }
    }
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide belief about network and backend reachability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct ConnectivityState {
    pub is_online: bool,
    pub backend_status: BackendStatus,
    #[cfg_attr(feature = "ts", ts(type = "string | null"))]
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub last_backend_error: Option<String>,
    pub monitor_active: bool,
    pub page_visible: bool,
    /// Delay of the currently armed poll timer; `None` while paused or stopped.
    pub scheduled_delay_ms: Option<u64>,
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self {
            is_online: true,
            backend_status: BackendStatus::Unknown,
            last_health_check_at: None,
            last_backend_error: None,
            monitor_active: false,
            page_visible: true,
            scheduled_delay_ms: None,
        }
    }
}

impl ConnectivityState {
    /// Network-level offline always wins over whatever the backend last said.
    pub(crate) fn apply_offline(&mut self) {
        self.is_online = false;
        self.backend_status = BackendStatus::Down;
        self.last_backend_error = Some(ERROR_OFFLINE.to_string());
    }

    /// Whether speculative network calls should be skipped right now.
    pub fn should_skip_network(&self) -> bool {
        !self.is_online || self.backend_status == BackendStatus::Down
    }
}
