// ── Query cache ──
//
// Keyed, TTL-based storage for server-derived payloads. One entry per
// structural key; concurrent writers race last-write-wins. Staleness is
// marked, never eagerly refetched here -- the service layer owns the
// fetchers and reacts to the invalidation channel.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
// Tokio's Instant so staleness and GC respect the paused test clock.
use tokio::time::Instant;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::backoff;
use crate::error::CoreError;

const INVALIDATION_CHANNEL_CAPACITY: usize = 64;

// ── QueryKey ─────────────────────────────────────────────────────────

/// Structural cache key: an ordered sequence of segments.
///
/// Two keys are equal iff their segment sequences are equal. Prefix
/// matching drives invalidation: invalidating `["notifications","list"]`
/// hits every per-page entry under it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

// ── CachePolicy ──────────────────────────────────────────────────────

/// Freshness and retry tuning for a [`QueryCache`].
#[derive(Debug, Clone)]
pub struct CachePolicy {
    /// Age past which an entry is stale and eligible for refetch.
    pub stale_after: Duration,
    /// Age past which an unobserved entry is purged by [`QueryCache::sweep`].
    pub gc_after: Duration,
    /// Total tries for one fetch (initial attempt included).
    pub retry_attempts: u32,
    /// Delay before the first retry; doubles per retry.
    pub retry_base_delay: Duration,
    /// Upper bound on the retry delay.
    pub retry_max_delay: Duration,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(20),
            gc_after: Duration::from_secs(300),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(10),
        }
    }
}

// ── Entry ────────────────────────────────────────────────────────────

struct Entry {
    value: Option<Arc<Value>>,
    fetched_at: Option<Instant>,
    /// Set by explicit invalidation, independent of age.
    invalidated: bool,
    last_touched: Instant,
    /// Observers receive the value on every write. `receiver_count()`
    /// doubles as the "is anyone watching" signal for GC and for
    /// active-refetch scheduling.
    watch_tx: watch::Sender<Option<Arc<Value>>>,
}

impl Entry {
    fn empty() -> Self {
        let (watch_tx, _) = watch::channel(None);
        Self {
            value: None,
            fetched_at: None,
            invalidated: false,
            last_touched: Instant::now(),
            watch_tx,
        }
    }

    fn is_fresh(&self, stale_after: Duration) -> bool {
        if self.invalidated {
            return false;
        }
        match (&self.value, self.fetched_at) {
            (Some(_), Some(at)) => at.elapsed() <= stale_after,
            _ => false,
        }
    }
}

// ── QueryCache ───────────────────────────────────────────────────────

type FetchResult = Result<Arc<Value>, String>;

/// Single source of truth for server-derived data, keyed by structural
/// key.
///
/// Thread-safe: entries live in a `DashMap`, the in-flight table behind
/// a plain mutex held only for map surgery. Concurrent
/// [`fetch_if_stale`](Self::fetch_if_stale) calls for one key share a
/// single fetcher invocation.
pub struct QueryCache {
    policy: CachePolicy,
    entries: DashMap<QueryKey, Entry>,
    inflight: Mutex<HashMap<QueryKey, broadcast::Sender<FetchResult>>>,
    /// Keys that went stale while observed, i.e. need an active refetch.
    invalidations: broadcast::Sender<QueryKey>,
}

impl QueryCache {
    pub fn new(policy: CachePolicy) -> Self {
        let (invalidations, _) = broadcast::channel(INVALIDATION_CHANNEL_CAPACITY);
        Self {
            policy,
            entries: DashMap::new(),
            inflight: Mutex::new(HashMap::new()),
            invalidations,
        }
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// The cached value, fresh or stale. Never triggers network activity.
    pub fn get(&self, key: &QueryKey) -> Option<Arc<Value>> {
        let mut entry = self.entries.get_mut(key)?;
        entry.last_touched = Instant::now();
        entry.value.clone()
    }

    /// The cached value only if it is fresh.
    pub fn get_fresh(&self, key: &QueryKey) -> Option<Arc<Value>> {
        let mut entry = self.entries.get_mut(key)?;
        if !entry.is_fresh(self.policy.stale_after) {
            return None;
        }
        entry.last_touched = Instant::now();
        entry.value.clone()
    }

    /// Watch a key's value. Creates an empty entry if absent; holding
    /// the receiver marks the entry as observed.
    pub fn observe(&self, key: &QueryKey) -> watch::Receiver<Option<Arc<Value>>> {
        self.entries
            .entry(key.clone())
            .or_insert_with(Entry::empty)
            .watch_tx
            .subscribe()
    }

    pub fn is_observed(&self, key: &QueryKey) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.watch_tx.receiver_count() > 0)
    }

    /// Refetch-needed signals for observed keys.
    pub fn invalidations(&self) -> broadcast::Receiver<QueryKey> {
        self.invalidations.subscribe()
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Store or replace a value unconditionally.
    ///
    /// Used for optimistic updates and for direct pushes (the server-sent
    /// count). Last write wins.
    pub fn set(&self, key: &QueryKey, value: Value) {
        self.set_arc(key, Arc::new(value));
    }

    fn set_arc(&self, key: &QueryKey, value: Arc<Value>) {
        let mut entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(Entry::empty);
        entry.value = Some(Arc::clone(&value));
        entry.fetched_at = Some(Instant::now());
        entry.invalidated = false;
        entry.last_touched = Instant::now();
        entry.watch_tx.send_replace(Some(value));
    }

    /// Mark every entry under `prefix` stale.
    ///
    /// Observed entries additionally get a refetch-needed signal on the
    /// invalidation channel; unobserved entries refetch lazily on their
    /// next read.
    pub fn invalidate(&self, prefix: &QueryKey) {
        let mut observed = Vec::new();

        for mut entry in self.entries.iter_mut() {
            if entry.key().starts_with(prefix) {
                entry.value_mut().invalidated = true;
                if entry.watch_tx.receiver_count() > 0 {
                    observed.push(entry.key().clone());
                }
            }
        }

        for key in observed {
            debug!(%key, "scheduling active refetch");
            let _ = self.invalidations.send(key);
        }
    }

    /// Purge unobserved entries untouched for longer than the GC
    /// threshold.
    pub fn sweep(&self) {
        let gc_after = self.policy.gc_after;
        self.entries.retain(|key, entry| {
            let keep = entry.watch_tx.receiver_count() > 0
                || entry.last_touched.elapsed() <= gc_after;
            if !keep {
                debug!(%key, "purging cache entry");
            }
            keep
        });
    }

    // ── Fetch-through ────────────────────────────────────────────────

    /// Return the fresh cached value, or fetch it.
    ///
    /// Concurrent calls for the same key while a fetch is in flight share
    /// the single in-flight result -- `fetcher` runs exactly once.
    /// Failures are retried with exponential backoff up to the policy's
    /// budget; once exhausted, the error surfaces and any stale value
    /// remains cached.
    pub async fn fetch_if_stale<F, Fut>(
        &self,
        key: &QueryKey,
        fetcher: F,
    ) -> Result<Arc<Value>, CoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, CoreError>>,
    {
        if let Some(value) = self.get_fresh(key) {
            return Ok(value);
        }

        // Join an in-flight fetch, or become the leader for this key.
        // The await must happen outside this block: holding the guard
        // (even notionally) across it would make the future non-`Send`.
        let joined_or_leader = {
            let mut inflight = self
                .inflight
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(tx) = inflight.get(key) {
                Err(tx.subscribe())
            } else {
                let (tx, _) = broadcast::channel(1);
                inflight.insert(key.clone(), tx.clone());
                Ok(tx)
            }
        };
        let leader_tx = match joined_or_leader {
            Err(mut rx) => {
                return match rx.recv().await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(message)) => Err(CoreError::FetchFailed { message }),
                    Err(_) => Err(CoreError::FetchFailed {
                        message: "in-flight fetch was dropped".into(),
                    }),
                };
            }
            Ok(tx) => tx,
        };

        // Followers joined through the map entry; this guard removes it
        // even if we are cancelled mid-fetch, so they see Closed instead
        // of hanging.
        let guard = InflightGuard { cache: self, key };

        let result = self.run_fetch(key, &fetcher).await;

        // Publish to the cache before retiring the in-flight entry, so a
        // caller arriving in between sees the fresh value rather than a
        // broadcast it already missed.
        match result {
            Ok(value) => {
                self.set_arc(key, Arc::clone(&value));
                drop(guard);
                let _ = leader_tx.send(Ok(Arc::clone(&value)));
                Ok(value)
            }
            Err(e) => {
                drop(guard);
                let _ = leader_tx.send(Err(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run_fetch<F, Fut>(&self, key: &QueryKey, fetcher: &F) -> Result<Arc<Value>, CoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value, CoreError>>,
    {
        let mut attempt: u32 = 0;

        loop {
            match fetcher().await {
                Ok(value) => return Ok(Arc::new(value)),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.policy.retry_attempts.max(1) {
                        warn!(%key, error = %e, attempt, "fetch retries exhausted");
                        return Err(e);
                    }

                    let delay = backoff::delay_for_attempt(
                        attempt - 1,
                        self.policy.retry_base_delay,
                        self.policy.retry_max_delay,
                    );
                    debug!(%key, error = %e, attempt, delay_ms = delay.as_millis() as u64, "fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

struct InflightGuard<'a> {
    cache: &'a QueryCache,
    key: &'a QueryKey,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.cache
            .inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(self.key);
    }
}

// ── Tests ────────────────────────────────────────────────────────────
