//! Network and backend reachability tracking.
//!
//! The `ConnectivityMonitor` classifies health checks into a `BackendStatus`,
//! lets network-level offline override everything, and runs a single
//! adaptive polling loop: 15s between checks while the backend is down,
//! 30s otherwise, paused while the page is hidden.

pub mod monitor;
pub mod probe;
pub mod state;

pub use monitor::{
    ConnectivityMonitor, MonitorConfig, MonitorHandle, RuntimeSignal, SignalHub,
    DEFAULT_POLL_DOWN_MS, DEFAULT_POLL_HEALTHY_MS,
};
pub use probe::{
    Classification, HealthPayload, HealthProbe, HttpHealthProbe, ProbeOutcome,
    DEFAULT_HEALTH_TIMEOUT_MS,
};
pub use state::{BackendStatus, ConnectivityState};
