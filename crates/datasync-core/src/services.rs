//! Wiring of the cache store and connectivity monitor for one signed-in session.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use crate::cache::{CacheMirror, CacheStore};
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, MonitorHandle};
use crate::error::CacheError;

/// The cache and monitor a host application shares with its feature stores.
///
/// A failed background refresh asks the monitor for an immediate health
/// check, so stale-but-unreachable data shows up as connectivity status.
pub struct SyncServices<V> {
    cache: CacheStore<V>,
    monitor: ConnectivityMonitor,
}

impl<V> Clone for SyncServices<V> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            monitor: self.monitor.clone(),
        }
    }
}

impl<V> SyncServices<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        config: &SyncConfig,
        monitor: ConnectivityMonitor,
        mirror: Option<Arc<dyn CacheMirror<V>>>,
    ) -> Self {
        let hook_monitor = monitor.clone();
        let mut builder = CacheStore::builder()
            .default_policy(config.default_policy())
            .revalidation_failure(config.revalidation_failure)
            .on_revalidation_failure(move |err| {
                debug!(key = err.key(), "Revalidation failed, re-checking backend health");
                let monitor = hook_monitor.clone();
                tokio::spawn(async move {
                    monitor.check_backend_health("revalidation_failed").await;
                });
            });
        if let Some(mirror) = mirror {
            builder = builder.mirror(mirror);
        }

        Self {
            cache: builder.build(),
            monitor,
        }
    }

    pub fn cache(&self) -> &CacheStore<V> {
        &self.cache
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    /// Warm the cache from the session mirror and start health monitoring.
    pub fn sign_in(&self) -> MonitorHandle {
        let restored = self.cache.hydrate();
        info!(restored, "Sync services started");
        self.monitor.start_monitoring()
    }

    /// Drop every cached value and connectivity belief so nothing leaks into the next session.
    pub fn sign_out(&self) {
        self.cache.dispose();
        self.monitor.reset();
        info!("Sync services stopped");
    }

    /// Speculative read under the configured default policy: serves cached data,
    /// but only goes to the network when the backend is believed reachable.
    /// Returns `None` when the fetch was skipped.
    pub async fn prefetch<F, Fut>(&self, key: &str, fetcher: F) -> Result<Option<V>, CacheError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        if let Some(data) = self.cache.get_cached(key) {
            if !self.monitor.should_skip_network() {
                // Still refreshes stale data in the background.
                self.cache.get_or_fetch_default(key, fetcher).await?;
            }
            return Ok(Some(data));
        }

        if self.monitor.should_skip_network() {
            debug!(key = %key, "Backend unreachable, skipping prefetch");
            return Ok(None);
        }
        let fetched = self.cache.get_or_fetch_default(key, fetcher).await?;
        Ok(Some(fetched.data))
    }
}

impl<V> SyncServices<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Build the services described by `config`: HTTP health probe and a session mirror.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let monitor = ConnectivityMonitor::from_config(config)?;
        let mirror: Arc<dyn CacheMirror<V>> = Arc::new(config.session_mirror()?);
        Ok(Self::new(config, monitor, Some(mirror)))
    }
}
