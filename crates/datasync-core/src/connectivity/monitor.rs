use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::probe::{HealthProbe, HttpHealthProbe, ProbeOutcome, DEFAULT_HEALTH_TIMEOUT_MS};
use super::state::{BackendStatus, ConnectivityState};
use crate::config::SyncConfig;

// ============================================================================
// Constants
// ============================================================================

/// Poll cadence while the backend is reachable (or degraded).
pub const DEFAULT_POLL_HEALTHY_MS: u64 = 30_000;

/// Poll cadence while the backend is down, so recovery is noticed sooner.
pub const DEFAULT_POLL_DOWN_MS: u64 = 15_000;

/// Lower bound on the poll delay so a zero interval from config cannot spin the probe.
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Buffer size for the runtime signal channel.
const SIGNAL_BUFFER_SIZE: usize = 32;

// ============================================================================
// Runtime signals
// ============================================================================

/// Events from the host runtime that should trigger an immediate re-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeSignal {
    Online,
    Offline,
    Focus,
    Visibility(bool),
}

/// Fan-out point for runtime signals. The host publishes, the monitor loop listens.
#[derive(Debug, Clone)]
pub struct SignalHub {
    tx: broadcast::Sender<RuntimeSignal>,
}

impl SignalHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SIGNAL_BUFFER_SIZE);
        Self { tx }
    }

    pub fn publish(&self, signal: RuntimeSignal) {
        if self.tx.send(signal).is_err() {
            debug!(?signal, "No listeners for runtime signal");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeSignal> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub poll_healthy: Duration,
    pub poll_down: Duration,
    /// Upper bound on a single health check, whatever the probe does.
    pub health_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_healthy: Duration::from_millis(DEFAULT_POLL_HEALTHY_MS),
            poll_down: Duration::from_millis(DEFAULT_POLL_DOWN_MS),
            health_timeout: Duration::from_millis(DEFAULT_HEALTH_TIMEOUT_MS),
        }
    }
}

impl From<&SyncConfig> for MonitorConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            poll_healthy: Duration::from_millis(config.poll_healthy_ms),
            poll_down: Duration::from_millis(config.poll_down_ms),
            health_timeout: Duration::from_millis(config.health_timeout_ms),
        }
    }
}

// ============================================================================
// Monitor
// ============================================================================

struct ActiveLoop {
    id: u64,
    task: JoinHandle<()>,
}

struct Inner {
    probe: Arc<dyn HealthProbe>,
    config: MonitorConfig,
    signals: SignalHub,
    state: watch::Sender<ConnectivityState>,
    active: Mutex<Option<ActiveLoop>>,
    next_loop_id: AtomicU64,
}

/// Handle to a running monitor loop.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    id: u64,
    monitor: Weak<Inner>,
}

impl MonitorHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop the loop this handle refers to. No-op if it already stopped.
    pub fn stop(&self) {
        if let Some(monitor) = upgrade(&self.monitor) {
            monitor.stop_loop(Some(self.id));
        }
    }

    pub fn is_active(&self) -> bool {
        upgrade(&self.monitor)
            .map(|m| {
                let active = m.lock_active();
                active.as_ref().is_some_and(|l| l.id == self.id)
            })
            .unwrap_or(false)
    }
}

/// Tracks network and backend reachability and runs the adaptive health-check loop.
///
/// Clone is cheap; clones share state and the single loop.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

fn upgrade(weak: &Weak<Inner>) -> Option<ConnectivityMonitor> {
    weak.upgrade().map(|inner| ConnectivityMonitor { inner })
}

impl ConnectivityMonitor {
    pub fn new(probe: Arc<dyn HealthProbe>, config: MonitorConfig) -> Self {
        let (state, _) = watch::channel(ConnectivityState::default());
        Self {
            inner: Arc::new(Inner {
                probe,
                config,
                signals: SignalHub::new(),
                state,
                active: Mutex::new(None),
                next_loop_id: AtomicU64::new(0),
            }),
        }
    }

    /// Build a monitor that probes the configured health URL over HTTP.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let probe = HttpHealthProbe::new(
            config.health_url.clone(),
            Duration::from_millis(config.health_timeout_ms),
        )?;
        Ok(Self::new(Arc::new(probe), MonitorConfig::from(config)))
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveLoop>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ===== State access =====

    pub fn state(&self) -> ConnectivityState {
        self.inner.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.state.subscribe()
    }

    pub fn signals(&self) -> &SignalHub {
        &self.inner.signals
    }

    pub fn should_skip_network(&self) -> bool {
        self.inner.state.borrow().should_skip_network()
    }

    /// Delay before the next poll, derived from the current status.
    pub fn next_poll_delay(&self) -> Duration {
        let delay = match self.inner.state.borrow().backend_status {
            BackendStatus::Down => self.inner.config.poll_down,
            _ => self.inner.config.poll_healthy,
        };
        delay.max(MIN_POLL_INTERVAL)
    }

    fn update(&self, f: impl FnOnce(&mut ConnectivityState)) -> ConnectivityState {
        let mut transition = None;
        self.inner.state.send_if_modified(|state| {
            let before = state.clone();
            f(state);
            if before.backend_status != state.backend_status {
                transition = Some((before.backend_status, state.backend_status));
            }
            *state != before
        });

        let current = self.state();
        if let Some((from, to)) = transition {
            let error = current.last_backend_error.as_deref().unwrap_or("");
            if to == BackendStatus::Down {
                warn!(from = %from, to = %to, error, "Backend status changed");
            } else {
                info!(from = %from, to = %to, error, "Backend status changed");
            }
        }
        current
    }

    // ===== Health checks =====

    /// Probe the backend once and record the result. Returns whether it is healthy.
    ///
    /// Never fails: timeouts and network errors resolve to `down`.
    pub async fn check_backend_health(&self, reason: &str) -> bool {
        let online = self.inner.state.borrow().is_online;
        if !online {
            debug!(reason, "Offline, skipping health check");
            self.update(ConnectivityState::apply_offline);
            return false;
        }

        debug!(reason, "Checking backend health");
        let outcome =
            match tokio::time::timeout(self.inner.config.health_timeout, self.inner.probe.probe())
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => ProbeOutcome::Timeout,
            };
        if let ProbeOutcome::Network(ref e) = outcome {
            debug!(reason, error = %e, "Health check failed at the network level");
        }

        let classification = outcome.classify();
        let checked_at = Utc::now();
        let state = self.update(|s| {
            s.last_health_check_at = Some(checked_at);
            if s.is_online {
                s.backend_status = classification.status;
                s.last_backend_error = classification.error;
            } else {
                // Connectivity dropped while the probe was pending.
                s.apply_offline();
            }
        });
        state.backend_status == BackendStatus::Healthy
    }

    /// Report network reachability. Offline takes effect immediately.
    pub fn set_online(&self, online: bool) {
        if online {
            // Status stays as it was until the next check resolves.
            self.update(|s| s.is_online = true);
            self.inner.signals.publish(RuntimeSignal::Online);
        } else {
            self.update(ConnectivityState::apply_offline);
            self.inner.signals.publish(RuntimeSignal::Offline);
        }
    }

    /// Report page visibility. Polling pauses while hidden.
    pub fn set_visible(&self, visible: bool) {
        self.update(|s| s.page_visible = visible);
        self.inner.signals.publish(RuntimeSignal::Visibility(visible));
    }

    async fn handle_signal(&self, signal: RuntimeSignal) {
        debug!(?signal, "Runtime signal received");
        match signal {
            RuntimeSignal::Online => {
                self.update(|s| s.is_online = true);
                self.check_backend_health("online").await;
            }
            RuntimeSignal::Offline => {
                self.update(ConnectivityState::apply_offline);
            }
            RuntimeSignal::Focus => {
                self.check_backend_health("focus").await;
            }
            RuntimeSignal::Visibility(true) => {
                self.update(|s| s.page_visible = true);
                self.check_backend_health("visible").await;
            }
            RuntimeSignal::Visibility(false) => {
                self.update(|s| s.page_visible = false);
            }
        }
    }

    // ===== Loop lifecycle =====

    /// Start the polling loop, or return the handle of the one already running.
    pub fn start_monitoring(&self) -> MonitorHandle {
        let mut active = self.lock_active();
        if let Some(existing) = active.as_ref() {
            if !existing.task.is_finished() {
                debug!(loop_id = existing.id, "Connectivity monitor already running");
                return MonitorHandle {
                    id: existing.id,
                    monitor: Arc::downgrade(&self.inner),
                };
            }
        }

        let id = self.inner.next_loop_id.fetch_add(1, Ordering::Relaxed) + 1;
        // Subscribe before spawning so no signal published after this call is missed.
        let signals = self.inner.signals.subscribe();
        self.update(|s| s.monitor_active = true);
        let task = tokio::spawn(run_loop(Arc::downgrade(&self.inner), signals, id));
        *active = Some(ActiveLoop { id, task });

        info!(loop_id = id, "Connectivity monitor started");
        MonitorHandle {
            id,
            monitor: Arc::downgrade(&self.inner),
        }
    }

    /// Stop the polling loop and drop its signal listener and timer. Safe when inactive.
    pub fn stop_monitoring(&self) {
        self.stop_loop(None);
    }

    pub fn is_monitoring(&self) -> bool {
        self.lock_active()
            .as_ref()
            .is_some_and(|l| !l.task.is_finished())
    }

    fn stop_loop(&self, expected: Option<u64>) {
        let stopped = {
            let mut active = self.lock_active();
            let matches = active
                .as_ref()
                .is_some_and(|l| expected.map_or(true, |id| id == l.id));
            if matches {
                active.take()
            } else {
                None
            }
        };

        if let Some(stopped) = stopped {
            stopped.task.abort();
            self.update(|s| {
                s.monitor_active = false;
                s.scheduled_delay_ms = None;
            });
            info!(loop_id = stopped.id, "Connectivity monitor stopped");
        }
    }

    fn loop_exited(&self, id: u64) {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|l| l.id == id) {
            active.take();
            drop(active);
            self.update(|s| {
                s.monitor_active = false;
                s.scheduled_delay_ms = None;
            });
        }
    }

    /// Stop the loop and forget everything learned about the backend.
    pub fn reset(&self) {
        self.stop_loop(None);
        self.update(|s| {
            let online = s.is_online;
            let visible = s.page_visible;
            *s = ConnectivityState {
                is_online: online,
                page_visible: visible,
                ..ConnectivityState::default()
            };
            if !online {
                s.apply_offline();
            }
        });
        info!("Connectivity monitor reset");
    }
}

async fn run_loop(
    monitor: Weak<Inner>,
    mut signals: broadcast::Receiver<RuntimeSignal>,
    loop_id: u64,
) {
    let mut states = match upgrade(&monitor) {
        Some(m) => {
            m.check_backend_health("start").await;
            m.subscribe()
        }
        None => return,
    };

    loop {
        // Re-read the status every round so transitions change the very next wait.
        let (delay, status) = {
            let Some(m) = upgrade(&monitor) else { break };
            let state = m.state();
            let delay = state.page_visible.then(|| m.next_poll_delay());
            m.update(|s| s.scheduled_delay_ms = delay.map(|d| d.as_millis() as u64));
            match delay {
                Some(d) => debug!(loop_id, delay_ms = d.as_millis() as u64, "Next health check scheduled"),
                None => debug!(loop_id, "Page hidden, polling paused"),
            }
            (delay, state.backend_status)
        };

        let timer = async move {
            match delay {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = timer => {
                let Some(m) = upgrade(&monitor) else { break };
                m.check_backend_health("interval").await;
            }
            signal = signals.recv() => {
                let Some(m) = upgrade(&monitor) else { break };
                match signal {
                    Ok(signal) => m.handle_signal(signal).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(loop_id, skipped, "Missed runtime signals, re-checking");
                        m.check_backend_health("lagged").await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            changed = status_changed(&mut states, status) => {
                if !changed {
                    break;
                }
                debug!(loop_id, "Backend status changed outside the loop, rescheduling");
            }
        }
    }

    if let Some(m) = upgrade(&monitor) {
        m.loop_exited(loop_id);
    }
    debug!(loop_id, "Connectivity monitor loop exited");
}

/// Resolves once the backend status differs from `from`; false if the monitor is gone.
async fn status_changed(
    states: &mut watch::Receiver<ConnectivityState>,
    from: BackendStatus,
) -> bool {
    states.wait_for(|s| s.backend_status != from).await.is_ok()
}

// ============================================================================
// Tests
// ============================================================================
