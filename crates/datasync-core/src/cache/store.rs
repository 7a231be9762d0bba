use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::entry::CacheEntry;
use super::mirror::CacheMirror;
use super::policy::{CachePolicy, RevalidationFailure};
use crate::error::CacheError;

// ============================================================================
// Constants
// ============================================================================

/// Lower bound for interval revalidation so a tiny staleness window cannot spin.
const MIN_REVALIDATE_INTERVAL: Duration = Duration::from_secs(1);

type Fetcher<V> = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<V>> + Send + Sync>;
type PendingFetch<V> = Shared<BoxFuture<'static, Result<V, CacheError>>>;
type Listener<V> = Arc<dyn Fn(&V) + Send + Sync>;
type FailureHook = Arc<dyn Fn(&CacheError) + Send + Sync>;

// ============================================================================
// Public handles
// ============================================================================

/// Result of [`CacheStore::get_or_fetch`].
pub struct Fetched<V> {
    /// The value served to the caller right now.
    pub data: V,
    /// Present when `data` came from a stale entry and a background refresh is running.
    pub revalidation: Option<Revalidation<V>>,
}

impl<V: fmt::Debug> fmt::Debug for Fetched<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetched")
            .field("data", &self.data)
            .field("revalidating", &self.revalidation.is_some())
            .finish()
    }
}

/// The single background refresh shared by every reader of a stale key.
///
/// Awaiting it is optional; the refresh completes and updates the cache either way.
pub struct Revalidation<V>(PendingFetch<V>);

impl<V> Clone for Revalidation<V> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<V: Clone> Future for Revalidation<V> {
    type Output = Result<V, CacheError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

/// Listener registration returned by [`CacheStore::subscribe_key`].
///
/// Dropping the handle keeps the listener registered; call `unsubscribe`.
pub struct Subscription {
    key: String,
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Remove this listener. Safe to call more than once.
    pub fn unsubscribe(&self) {
        let cancel = self
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}

// ============================================================================
// Store internals
// ============================================================================

struct InFlight<V> {
    id: u64,
    pending: PendingFetch<V>,
}

struct State<V> {
    entries: HashMap<String, CacheEntry<V>>,
    in_flight: HashMap<String, InFlight<V>>,
    listeners: HashMap<String, Vec<(u64, Listener<V>)>>,
    interval_tasks: HashMap<String, JoinHandle<()>>,
    next_id: u64,
}

impl<V> State<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            in_flight: HashMap::new(),
            listeners: HashMap::new(),
            interval_tasks: HashMap::new(),
            next_id: 0,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Returns the entry for `key` if it is still valid, evicting it otherwise.
    fn valid_entry(&mut self, key: &str, now: Instant) -> Option<&CacheEntry<V>> {
        let expired = self.entries.get(key)?.is_expired(now);
        if expired {
            debug!(key = %key, "Evicting expired entry");
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key)
    }

    fn listeners_for(&self, key: &str) -> Vec<Listener<V>> {
        self.listeners
            .get(key)
            .map(|l| l.iter().map(|(_, f)| Arc::clone(f)).collect())
            .unwrap_or_default()
    }

    fn listener_count(&self, key: &str) -> usize {
        self.listeners.get(key).map(Vec::len).unwrap_or(0)
    }
}

struct Inner<V> {
    state: Mutex<State<V>>,
    default_policy: CachePolicy,
    revalidation_failure: RevalidationFailure,
    mirror: Option<Arc<dyn CacheMirror<V>>>,
    on_revalidation_failure: Option<FailureHook>,
}

impl<V> Inner<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, State<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the outstanding fetch for `key` or start one.
    ///
    /// Must be called with the state lock held: the registry lookup and the
    /// insert happen without a suspension point in between.
    fn join_or_start(
        self: &Arc<Self>,
        state: &mut State<V>,
        key: &str,
        fetcher: Fetcher<V>,
        policy: CachePolicy,
    ) -> PendingFetch<V> {
        if let Some(in_flight) = state.in_flight.get(key) {
            debug!(key = %key, "Joining in-flight fetch");
            return in_flight.pending.clone();
        }

        let id = state.next_id();
        debug!(key = %key, fetch_id = id, "Starting fetch");

        // Spawned so that callers going away never cancel the fetch.
        let task = tokio::spawn(Arc::clone(self).run_fetch(key.to_string(), fetcher, policy, id));
        let task_key = key.to_string();
        let pending = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(key = %task_key, error = %e, "Fetch task did not complete");
                    Err(CacheError::Aborted { key: task_key })
                }
            }
        }
        .boxed()
        .shared();

        state.in_flight.insert(
            key.to_string(),
            InFlight {
                id,
                pending: pending.clone(),
            },
        );
        pending
    }

    async fn run_fetch(
        self: Arc<Self>,
        key: String,
        fetcher: Fetcher<V>,
        policy: CachePolicy,
        id: u64,
    ) -> Result<V, CacheError> {
        let result = fetcher().await;

        let mut state = self.lock();
        let registered = state.in_flight.get(&key).map(|f| f.id) == Some(id);
        if registered {
            state.in_flight.remove(&key);
        }

        match result {
            Ok(data) => {
                if !registered {
                    debug!(key = %key, fetch_id = id, "Cache cleared during fetch, discarding result");
                    return Err(CacheError::Cleared { key });
                }

                let entry = CacheEntry::new(key.clone(), data.clone(), policy.ttl);
                state.entries.insert(key.clone(), entry.clone());
                let listeners = state.listeners_for(&key);
                drop(state);

                self.mirror_save(&entry);
                debug!(key = %key, subscribers = listeners.len(), "Fetch complete");
                for listener in listeners {
                    listener(&data);
                }
                Ok(data)
            }
            Err(e) => {
                let err = CacheError::fetch(&key, e);
                let now = Instant::now();
                let had_valid_entry = state.valid_entry(&key, now).is_some();

                if had_valid_entry {
                    let evict = self.revalidation_failure == RevalidationFailure::Evict;
                    if evict {
                        state.entries.remove(&key);
                    }
                    drop(state);

                    warn!(key = %key, error = %err, evict, "Background revalidation failed");
                    if evict {
                        self.mirror_remove(&key);
                    }
                    if let Some(hook) = &self.on_revalidation_failure {
                        hook(&err);
                    }
                } else {
                    drop(state);
                    warn!(key = %key, error = %err, "Fetch failed");
                }
                Err(err)
            }
        }
    }

    fn ensure_interval(
        self: &Arc<Self>,
        state: &mut State<V>,
        key: &str,
        fetcher: Fetcher<V>,
        policy: CachePolicy,
    ) {
        if let Some(task) = state.interval_tasks.get(key) {
            if !task.is_finished() {
                return;
            }
        }

        let period = policy.revalidate_interval().max(MIN_REVALIDATE_INTERVAL);
        let weak: Weak<Self> = Arc::downgrade(self);
        let task_key = key.to_string();
        debug!(key = %key, period_ms = period.as_millis() as u64, "Starting interval revalidation");

        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let Some(inner) = weak.upgrade() else { break };

                let pending = {
                    let mut state = inner.lock();
                    if state.listener_count(&task_key) == 0 {
                        debug!(key = %task_key, "No subscribers left, stopping interval revalidation");
                        state.interval_tasks.remove(&task_key);
                        break;
                    }
                    inner.join_or_start(&mut state, &task_key, Arc::clone(&fetcher), policy)
                };

                if let Err(e) = pending.await {
                    debug!(key = %task_key, error = %e, "Interval revalidation failed");
                }
            }
        });
        state.interval_tasks.insert(key.to_string(), task);
    }

    /// Mirror `entry`, then undo the write if the entry was cleared, invalidated
    /// or replaced while the file was being written.
    ///
    /// Must be called without the state lock held.
    fn mirror_save(&self, entry: &CacheEntry<V>) {
        let Some(mirror) = &self.mirror else { return };
        if let Err(e) = mirror.save(entry) {
            debug!(key = %entry.key, error = %e, "Failed to mirror cache entry");
            return;
        }

        let current = self
            .lock()
            .entries
            .get(&entry.key)
            .is_some_and(|e| e.is_same_write(entry));
        if !current {
            debug!(key = %entry.key, "Entry changed during mirror write, removing copy");
            self.mirror_remove(&entry.key);
        }
    }

    fn mirror_remove(&self, key: &str) {
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.remove(key) {
                debug!(key = %key, error = %e, "Failed to remove mirrored entry");
            }
        }
    }
}

fn box_fetcher<V, F, Fut>(fetcher: F) -> Fetcher<V>
where
    V: 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
{
    Arc::new(move || fetcher().boxed())
}

// ============================================================================
// CacheStore
// ============================================================================

/// Builder for a [`CacheStore`].
pub struct CacheStoreBuilder<V> {
    default_policy: CachePolicy,
    revalidation_failure: RevalidationFailure,
    mirror: Option<Arc<dyn CacheMirror<V>>>,
    on_revalidation_failure: Option<FailureHook>,
}

impl<V> CacheStoreBuilder<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn default_policy(mut self, policy: CachePolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn revalidation_failure(mut self, policy: RevalidationFailure) -> Self {
        self.revalidation_failure = policy;
        self
    }

    pub fn mirror(mut self, mirror: Arc<dyn CacheMirror<V>>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Called whenever a background refresh of a still-valid entry fails.
    pub fn on_revalidation_failure(
        mut self,
        hook: impl Fn(&CacheError) + Send + Sync + 'static,
    ) -> Self {
        self.on_revalidation_failure = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> CacheStore<V> {
        CacheStore {
            inner: Arc::new(Inner {
                state: Mutex::new(State::new()),
                default_policy: self.default_policy,
                revalidation_failure: self.revalidation_failure,
                mirror: self.mirror,
                on_revalidation_failure: self.on_revalidation_failure,
            }),
        }
    }
}

/// Keyed TTL cache with coalesced stale-while-revalidate fetching.
///
/// Clone is cheap and every clone shares the same entries, in-flight
/// registry and subscribers.
pub struct CacheStore<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for CacheStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Default for CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::builder().build()
    }
}

impl<V> CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> CacheStoreBuilder<V> {
        CacheStoreBuilder {
            default_policy: CachePolicy::default(),
            revalidation_failure: RevalidationFailure::default(),
            mirror: None,
            on_revalidation_failure: None,
        }
    }

    pub fn default_policy(&self) -> CachePolicy {
        self.inner.default_policy
    }

    // ===== Reads and writes =====

    /// Synchronous read. Expired entries are evicted and reported as absent.
    pub fn get_cached(&self, key: &str) -> Option<V> {
        let mut state = self.inner.lock();
        state
            .valid_entry(key, Instant::now())
            .map(|entry| entry.data.clone())
    }

    /// Unconditional write, replacing any existing entry.
    pub fn set_cache(&self, key: &str, data: V, ttl: Duration) {
        let entry = CacheEntry::new(key, data, ttl);
        self.inner.lock().entries.insert(key.to_string(), entry.clone());
        self.inner.mirror_save(&entry);
    }

    /// Serve from cache when possible, fetching at most once per key.
    ///
    /// A valid entry is returned immediately. If it is older than the policy's
    /// staleness window, the background refresh for the key is started (or
    /// joined) and handed back as `revalidation`. Without a valid entry the
    /// caller waits on the key's single in-flight fetch.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        policy: CachePolicy,
    ) -> Result<Fetched<V>, CacheError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let fetcher = box_fetcher(fetcher);

        let pending = {
            let mut state = self.inner.lock();
            let now = Instant::now();

            if policy.revalidate_on_interval {
                self.inner
                    .ensure_interval(&mut state, key, Arc::clone(&fetcher), policy);
            }

            let cached = state
                .valid_entry(key, now)
                .map(|entry| (entry.data.clone(), entry.is_stale(now, policy.stale)));

            match cached {
                Some((data, false)) => {
                    return Ok(Fetched {
                        data,
                        revalidation: None,
                    });
                }
                Some((data, true)) => {
                    debug!(key = %key, "Serving stale entry, revalidating");
                    let pending = self.inner.join_or_start(&mut state, key, fetcher, policy);
                    return Ok(Fetched {
                        data,
                        revalidation: Some(Revalidation(pending)),
                    });
                }
                None => self.inner.join_or_start(&mut state, key, fetcher, policy),
            }
        };

        let data = pending.await?;
        Ok(Fetched {
            data,
            revalidation: None,
        })
    }

    /// [`get_or_fetch`](Self::get_or_fetch) under the store's default policy.
    pub async fn get_or_fetch_default<F, Fut>(
        &self,
        key: &str,
        fetcher: F,
    ) -> Result<Fetched<V>, CacheError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        self.get_or_fetch(key, fetcher, self.inner.default_policy).await
    }

    /// Refetch regardless of any valid entry. Joins an outstanding fetch for the key.
    pub async fn fetch_and_cache<F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        policy: CachePolicy,
    ) -> Result<V, CacheError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let fetcher = box_fetcher(fetcher);
        let pending = {
            let mut state = self.inner.lock();
            if policy.revalidate_on_interval {
                self.inner
                    .ensure_interval(&mut state, key, Arc::clone(&fetcher), policy);
            }
            self.inner.join_or_start(&mut state, key, fetcher, policy)
        };
        pending.await
    }

    // ===== Subscriptions =====

    /// Invoke `callback` with the fresh value after every successful fetch of `key`,
    /// whoever triggered it.
    pub fn subscribe_key(
        &self,
        key: &str,
        callback: impl Fn(&V) + Send + Sync + 'static,
    ) -> Subscription {
        let id = {
            let mut state = self.inner.lock();
            let id = state.next_id();
            let listener: Listener<V> = Arc::new(callback);
            state
                .listeners
                .entry(key.to_string())
                .or_default()
                .push((id, listener));
            id
        };

        let weak = Arc::downgrade(&self.inner);
        let cancel_key = key.to_string();
        let cancel: Box<dyn FnOnce() + Send> = Box::new(move || {
            let Some(inner) = weak.upgrade() else { return };
            let mut state = inner.lock();
            if let Some(listeners) = state.listeners.get_mut(&cancel_key) {
                listeners.retain(|(listener_id, _)| *listener_id != id);
                if listeners.is_empty() {
                    state.listeners.remove(&cancel_key);
                }
            }
        });

        Subscription {
            key: key.to_string(),
            cancel: Mutex::new(Some(cancel)),
        }
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.inner.lock().listener_count(key)
    }

    // ===== Invalidation =====

    /// Drop the entry for `key` without notifying subscribers.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.inner.lock().entries.remove(key).is_some();
        self.inner.mirror_remove(key);
        removed
    }

    /// Drop every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let removed = {
            let mut state = self.inner.lock();
            let before = state.entries.len();
            state.entries.retain(|key, _| !key.starts_with(prefix));
            before - state.entries.len()
        };
        if let Some(mirror) = &self.inner.mirror {
            if let Err(e) = mirror.remove_prefix(prefix) {
                debug!(prefix = %prefix, error = %e, "Failed to remove mirrored entries");
            }
        }
        debug!(prefix = %prefix, removed, "Invalidated prefix");
        removed
    }

    /// Empty the cache, the in-flight registry and every subscription.
    ///
    /// Fetches already running complete but their results are discarded.
    pub fn clear_all(&self) {
        {
            let mut state = self.inner.lock();
            state.entries.clear();
            state.in_flight.clear();
            state.listeners.clear();
            for (_, task) in state.interval_tasks.drain() {
                task.abort();
            }
        }
        if let Some(mirror) = &self.inner.mirror {
            if let Err(e) = mirror.clear() {
                warn!(error = %e, "Failed to clear session mirror");
            }
        }
    }

    /// Lifecycle teardown on sign-out or shutdown.
    pub fn dispose(&self) {
        self.clear_all();
        info!("Cache store disposed");
    }

    // ===== Warm start =====

    /// Load unexpired entries from the session mirror. In-memory entries win.
    pub fn hydrate(&self) -> usize {
        let Some(mirror) = &self.inner.mirror else {
            return 0;
        };
        let loaded = match mirror.load_all() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Failed to load session mirror");
                return 0;
            }
        };

        let mut state = self.inner.lock();
        let mut restored = 0;
        for entry in loaded {
            if !state.entries.contains_key(&entry.key) {
                state.entries.insert(entry.key.clone(), entry);
                restored += 1;
            }
        }
        info!(restored, "Hydrated cache from session mirror");
        restored
    }

    // ===== Introspection =====

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.lock().in_flight.contains_key(key)
    }

    /// Age of the entry for `key` as a short human-readable string.
    pub fn age_display(&self, key: &str) -> Option<String> {
        self.inner.lock().entries.get(key).map(CacheEntry::age_display)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::join_all;

    const TTL: Duration = Duration::from_secs(60);
    const STALE: Duration = Duration::from_secs(10);

    fn policy() -> CachePolicy {
        CachePolicy::ttl(TTL).stale_after(STALE)
    }

    /// Fetcher that counts calls and returns `value-<n>` after a short delay.
    fn counting_fetcher(
        calls: Arc<AtomicUsize>,
    ) -> impl Fn() -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync + 'static {
        move || {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(format!("value-{}", n))
            }
            .boxed()
        }
    }

    fn failing_fetcher(
        calls: Arc<AtomicUsize>,
    ) -> impl Fn() -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync + 'static {
        move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(anyhow::anyhow!("backend unavailable"))
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reads_coalesce_into_one_fetch() {
        let store: CacheStore<String> = CacheStore::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let reads = (0..8).map(|_| {
            let store = store.clone();
            let fetcher = counting_fetcher(Arc::clone(&calls));
            async move { store.get_or_fetch("stats:1", fetcher, policy()).await }
        });
        let results = join_all(reads).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            let fetched = result.unwrap();
            assert_eq!(fetched.data, "value-1");
            assert!(fetched.revalidation.is_none());
        }
        assert!(!store.is_in_flight("stats:1"));
        assert_eq!(store.get_cached("stats:1").as_deref(), Some("value-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_boundary() {
        let store: CacheStore<u32> = CacheStore::new();
        store.set_cache("k", 7, Duration::from_millis(1000));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(store.get_cached("k"), Some(7));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(store.get_cached("k"), None);
        assert!(store.is_empty(), "expired entry should be evicted on read");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_ttl_never_expires() {
        let store: CacheStore<u32> = CacheStore::new();
        store.set_cache("k", 1, Duration::MAX);
        tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
        assert_eq!(store.get_cached("k"), Some(1));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let fetched = store
            .get_or_fetch(
                "forever",
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, anyhow::Error>(2) }
                },
                CachePolicy::ttl(Duration::MAX),
            )
            .await
            .unwrap();
        assert_eq!(fetched.data, 2);
        assert_eq!(store.get_cached("forever"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_fetch_default_uses_store_policy() {
        let store: CacheStore<String> = CacheStore::builder()
            .default_policy(CachePolicy::ttl(Duration::from_secs(5)))
            .build();
        let calls = Arc::new(AtomicUsize::new(0));
        store
            .get_or_fetch_default("k", counting_fetcher(Arc::clone(&calls)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.get_cached("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_entry_triggers_no_fetch() {
        let store: CacheStore<String> = CacheStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        store
            .get_or_fetch("k", counting_fetcher(Arc::clone(&calls)), policy())
            .await
            .unwrap();

        tokio::time::advance(STALE - Duration::from_millis(1)).await;
        let fetched = store
            .get_or_fetch("k", counting_fetcher(Arc::clone(&calls)), policy())
            .await
            .unwrap();

        assert_eq!(fetched.data, "value-1");
        assert!(fetched.revalidation.is_none());
        assert!(!store.is_in_flight("k"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_reads_serve_old_value_and_revalidate_once() {
        let store: CacheStore<String> = CacheStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        store
            .get_or_fetch("k", counting_fetcher(Arc::clone(&calls)), policy())
            .await
            .unwrap();

        tokio::time::advance(STALE + Duration::from_millis(1)).await;

        let mut revalidations = Vec::new();
        for _ in 0..5 {
            let fetched = store
                .get_or_fetch("k", counting_fetcher(Arc::clone(&calls)), policy())
                .await
                .unwrap();
            assert_eq!(fetched.data, "value-1");
            revalidations.push(fetched.revalidation.expect("stale read should revalidate"));
        }

        for result in join_all(revalidations).await {
            assert_eq!(result.unwrap(), "value-2");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.get_cached("k").as_deref(), Some("value-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_receive_fetches_triggered_elsewhere() {
        let store: CacheStore<String> = CacheStore::new();
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen_a);
        let _a = store.subscribe_key("k", move |v: &String| sink.lock().unwrap().push(v.clone()));
        let sink = Arc::clone(&seen_b);
        let _b = store.subscribe_key("k", move |v: &String| sink.lock().unwrap().push(v.clone()));

        let calls = Arc::new(AtomicUsize::new(0));
        let fetched = store
            .get_or_fetch("k", counting_fetcher(calls), policy())
            .await
            .unwrap();

        assert_eq!(fetched.data, "value-1");
        assert_eq!(*seen_a.lock().unwrap(), vec!["value-1".to_string()]);
        assert_eq!(*seen_b.lock().unwrap(), vec!["value-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_revalidation_reaches_independent_subscribers() {
        let store: CacheStore<String> = CacheStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        store
            .get_or_fetch("k", counting_fetcher(Arc::clone(&calls)), policy())
            .await
            .unwrap();

        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen_a);
        let _a = store.subscribe_key("k", move |v: &String| sink.lock().unwrap().push(v.clone()));
        let sink = Arc::clone(&seen_b);
        let _b = store.subscribe_key("k", move |v: &String| sink.lock().unwrap().push(v.clone()));

        tokio::time::advance(STALE + Duration::from_millis(1)).await;
        let fetched = store
            .get_or_fetch("k", counting_fetcher(Arc::clone(&calls)), policy())
            .await
            .unwrap();
        assert_eq!(fetched.data, "value-1");
        assert_eq!(fetched.revalidation.unwrap().await.unwrap(), "value-2");

        assert_eq!(*seen_a.lock().unwrap(), vec!["value-2".to_string()]);
        assert_eq!(*seen_b.lock().unwrap(), vec!["value-2".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_is_idempotent_and_removes_one_listener() {
        let store: CacheStore<String> = CacheStore::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let first = store.subscribe_key("k", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&hits);
        let _second = store.subscribe_key("k", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(store.subscriber_count("k"), 2);

        first.unsubscribe();
        first.unsubscribe();
        assert_eq!(store.subscriber_count("k"), 1);

        let calls = Arc::new(AtomicUsize::new(0));
        store
            .fetch_and_cache("k", counting_fetcher(calls), policy())
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_reaches_every_waiter_and_writes_nothing() {
        let store: CacheStore<String> = CacheStore::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let reads = (0..3).map(|_| {
            let store = store.clone();
            let fetcher = failing_fetcher(Arc::clone(&calls));
            async move { store.get_or_fetch("k", fetcher, policy()).await }
        });
        for result in join_all(reads).await {
            match result {
                Err(CacheError::Fetch { key, .. }) => assert_eq!(key, "k"),
                other => panic!("expected fetch error, got {:?}", other.map(|f| f.data)),
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!store.is_in_flight("k"));
        assert_eq!(store.get_cached("k"), None);

        // No retry at this layer: the next call fetches again.
        let _ = store
            .get_or_fetch("k", failing_fetcher(Arc::clone(&calls)), policy())
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_revalidation_keeps_stale_value() {
        let failures = Arc::new(AtomicUsize::new(0));
        let hook_count = Arc::clone(&failures);
        let store: CacheStore<String> = CacheStore::builder()
            .on_revalidation_failure(move |_| {
                hook_count.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        store.set_cache("k", "old".to_string(), TTL);
        tokio::time::advance(STALE + Duration::from_millis(1)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let fetched = store
            .get_or_fetch("k", failing_fetcher(calls), policy())
            .await
            .unwrap();
        assert_eq!(fetched.data, "old");
        assert!(fetched.revalidation.unwrap().await.is_err());

        assert_eq!(store.get_cached("k").as_deref(), Some("old"));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_revalidation_evicts_when_configured() {
        let store: CacheStore<String> = CacheStore::builder()
            .revalidation_failure(RevalidationFailure::Evict)
            .build();
        store.set_cache("k", "old".to_string(), TTL);
        tokio::time::advance(STALE + Duration::from_millis(1)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let fetched = store
            .get_or_fetch("k", failing_fetcher(calls), policy())
            .await
            .unwrap();
        assert_eq!(fetched.data, "old");
        let _ = fetched.revalidation.unwrap().await;

        assert_eq!(store.get_cached("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_completes_after_caller_drops() {
        let store: CacheStore<String> = CacheStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));

        let sink = Arc::clone(&seen);
        let _sub = store.subscribe_key("k", move |v: &String| *sink.lock().unwrap() = Some(v.clone()));

        {
            let fut = store.get_or_fetch("k", counting_fetcher(Arc::clone(&calls)), policy());
            // Poll once so the fetch is registered, then drop the caller.
            let _ = tokio::time::timeout(Duration::from_millis(1), fut).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.get_cached("k").as_deref(), Some("value-1"));
        assert_eq!(seen.lock().unwrap().as_deref(), Some("value-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_and_cache_bypasses_valid_entry() {
        let store: CacheStore<String> = CacheStore::new();
        store.set_cache("k", "cached".to_string(), TTL);

        let calls = Arc::new(AtomicUsize::new(0));
        let fresh = store
            .fetch_and_cache("k", counting_fetcher(Arc::clone(&calls)), policy())
            .await
            .unwrap();

        assert_eq!(fresh, "value-1");
        assert_eq!(store.get_cached("k").as_deref(), Some("value-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_prefix() {
        let store: CacheStore<u32> = CacheStore::new();
        store.set_cache("stats:1", 1, TTL);
        store.set_cache("stats:2", 2, TTL);
        store.set_cache("profile:1", 3, TTL);

        assert!(store.invalidate("profile:1"));
        assert!(!store.invalidate("profile:1"));
        assert_eq!(store.get_cached("profile:1"), None);

        assert_eq!(store.invalidate_prefix("stats:"), 2);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_does_not_notify() {
        let store: CacheStore<u32> = CacheStore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _sub = store.subscribe_key("k", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        store.set_cache("k", 1, TTL);
        store.invalidate("k");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all_discards_in_flight_results() {
        let store: CacheStore<String> = CacheStore::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let pending = {
            let store = store.clone();
            let fetcher = counting_fetcher(Arc::clone(&calls));
            tokio::spawn(async move { store.get_or_fetch("k", fetcher, policy()).await })
        };
        tokio::task::yield_now().await;
        assert!(store.is_in_flight("k"));

        store.clear_all();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(CacheError::Cleared { .. })));
        assert_eq!(store.get_cached("k"), None);
    }

    /// Mirror that clears its own store in the middle of a write, like a
    /// sign-out racing a fetch that just completed.
    struct ClearingMirror {
        store: Mutex<Option<CacheStore<String>>>,
        saved: Mutex<HashMap<String, String>>,
    }

    impl CacheMirror<String> for ClearingMirror {
        fn save(&self, entry: &CacheEntry<String>) -> anyhow::Result<()> {
            let store = self.store.lock().unwrap().take();
            if let Some(store) = store {
                store.clear_all();
            }
            self.saved
                .lock()
                .unwrap()
                .insert(entry.key.clone(), entry.data.clone());
            Ok(())
        }

        fn remove(&self, key: &str) -> anyhow::Result<()> {
            self.saved.lock().unwrap().remove(key);
            Ok(())
        }

        fn remove_prefix(&self, prefix: &str) -> anyhow::Result<usize> {
            let mut saved = self.saved.lock().unwrap();
            let before = saved.len();
            saved.retain(|key, _| !key.starts_with(prefix));
            Ok(before - saved.len())
        }

        fn clear(&self) -> anyhow::Result<()> {
            self.saved.lock().unwrap().clear();
            Ok(())
        }

        fn load_all(&self) -> anyhow::Result<Vec<CacheEntry<String>>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_during_mirror_write_leaves_no_copy() {
        let mirror = Arc::new(ClearingMirror {
            store: Mutex::new(None),
            saved: Mutex::new(HashMap::new()),
        });
        let store: CacheStore<String> = CacheStore::builder().mirror(mirror.clone()).build();
        *mirror.store.lock().unwrap() = Some(store.clone());

        let calls = Arc::new(AtomicUsize::new(0));
        store
            .get_or_fetch("stats:1", counting_fetcher(calls), policy())
            .await
            .unwrap();

        assert!(store.is_empty());
        assert!(mirror.saved.lock().unwrap().is_empty());

        // Later writes mirror normally.
        store.set_cache("stats:2", "next".to_string(), TTL);
        assert_eq!(
            mirror.saved.lock().unwrap().get("stats:2").map(String::as_str),
            Some("next")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_revalidation_runs_while_subscribed() {
        let store: CacheStore<String> = CacheStore::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let sub = store.subscribe_key("k", |_| {});

        let interval_policy = CachePolicy::ttl(TTL)
            .stale_after(Duration::from_secs(2))
            .revalidate_on_interval(true);
        store
            .get_or_fetch("k", counting_fetcher(Arc::clone(&calls)), interval_policy)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(6500)).await;
        let while_subscribed = calls.load(Ordering::SeqCst);
        assert!(while_subscribed >= 3, "expected interval refetches, got {}", while_subscribed);

        sub.unsubscribe();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let after_unsubscribe = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_unsubscribe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hydrate_restores_mirrored_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let mirror = Arc::new(
            crate::cache::SessionMirror::new(tmp.path().to_path_buf(), 1024 * 1024).unwrap(),
        );

        let first: CacheStore<String> = CacheStore::builder().mirror(mirror.clone()).build();
        first.set_cache("stats:1", "persisted".to_string(), TTL);

        let second: CacheStore<String> = CacheStore::builder().mirror(mirror).build();
        assert_eq!(second.hydrate(), 1);
        assert_eq!(second.get_cached("stats:1").as_deref(), Some("persisted"));

        second.clear_all();
        assert_eq!(second.hydrate(), 0);
    }
}
