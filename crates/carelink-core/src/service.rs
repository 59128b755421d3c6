// ── Notification service ──
//
// The facade consumers talk to: cached reads, best-effort channel
// writes, and the two mutation flows. Single-writer discipline: only
// this service and the event channel ever write notification cache
// entries -- consumers read or call the mutations below.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use carelink_api::{ClientMessage, Notification, Page, PortalClient, ServerEvent, TokenProvider};

use crate::cache::{CachePolicy, QueryCache};
use crate::channel::{ChannelState, EventChannel};
use crate::config::ServiceConfig;
use crate::error::CoreError;
use crate::keys;
use crate::registry::{ListenerRegistry, Subscription};

/// Real-time notification service for one signed-in user.
///
/// Construct one per app (dependency-injected into the composition
/// root); every instance owns its own cache, channel, and listener set,
/// so independent instances never interfere.
#[derive(Clone)]
pub struct NotificationService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    config: ServiceConfig,
    tokens: Arc<dyn TokenProvider>,
    client: PortalClient,
    cache: Arc<QueryCache>,
    registry: Arc<ListenerRegistry>,
    channel: EventChannel,
    refetch_cancel: Mutex<CancellationToken>,
    refetch_task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationService {
    pub fn new(
        config: ServiceConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, CoreError> {
        let client = PortalClient::new(
            config.base_url.clone(),
            Arc::clone(&tokens),
            &config.transport,
        )?;

        let cache = Arc::new(QueryCache::new(CachePolicy {
            stale_after: config.stale_after,
            gc_after: config.gc_after,
            retry_attempts: config.fetch_retry_attempts,
            ..CachePolicy::default()
        }));
        let registry = Arc::new(ListenerRegistry::new());
        let channel = EventChannel::new(
            config.clone(),
            Arc::clone(&tokens),
            Arc::clone(&cache),
            Arc::clone(&registry),
        );

        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                tokens,
                client,
                cache,
                registry,
                channel,
                refetch_cancel: Mutex::new(CancellationToken::new()),
                refetch_task: Mutex::new(None),
            }),
        })
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start the live channel and the safety-net refetch task.
    ///
    /// Idempotent, and a no-op while no credential is available.
    pub fn init(&self) {
        if self.inner.tokens.token().is_none() {
            debug!("no credential available, init deferred");
            return;
        }

        self.inner.channel.init();

        let mut task = lock(&self.inner.refetch_task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        *lock(&self.inner.refetch_cancel) = cancel.clone();

        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(refetch_loop(inner, cancel)));
    }

    /// Tear everything down: channel, listeners, background refetch.
    pub async fn disconnect(&self) {
        lock(&self.inner.refetch_cancel).cancel();
        let handle = lock(&self.inner.refetch_task).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.inner.channel.disconnect().await;
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// The unread notification count, from cache when fresh.
    pub async fn unread_count(&self) -> Result<u64, CoreError> {
        let value = fetch_unread(&self.inner).await?;
        decode_count(&value)
    }

    /// The cached count, if any, without triggering network activity.
    pub fn cached_unread_count(&self) -> Option<u64> {
        let value = self.inner.cache.get(&keys::unread_count())?;
        decode_count(&value).ok()
    }

    /// Watch the unread-count cache entry. Holding the receiver marks
    /// the entry observed, which upgrades its invalidations from lazy
    /// to active refetch.
    pub fn observe_unread_count(&self) -> watch::Receiver<Option<Arc<Value>>> {
        self.inner.cache.observe(&keys::unread_count())
    }

    /// One page of the notification list, from cache when fresh.
    pub async fn list_notifications(
        &self,
        page: u32,
        per_page: u32,
    ) -> Result<Page<Notification>, CoreError> {
        let value = fetch_list(&self.inner, page, per_page).await?;
        serde_json::from_value((*value).clone()).map_err(|e| CoreError::BadPayload {
            message: e.to_string(),
        })
    }

    /// Watch one list page's cache entry. As with the count, holding
    /// the receiver upgrades the page's invalidations from lazy to
    /// active refetch.
    pub fn observe_notification_list(
        &self,
        page: u32,
        per_page: u32,
    ) -> watch::Receiver<Option<Arc<Value>>> {
        self.inner
            .cache
            .observe(&keys::notification_list_page(page, per_page))
    }

    // ── Mutations ────────────────────────────────────────────────────

    /// Mark one notification read: best-effort over the live channel,
    /// persisted via REST. Invalidates the count and list keys on
    /// success.
    pub async fn mark_as_read(&self, id: i64) -> Result<(), CoreError> {
        self.inner.channel.send(ClientMessage::MarkRead {
            notification_id: id,
        });

        self.inner.client.mark_read(id).await?;

        self.inner.cache.invalidate(&keys::unread_count());
        self.inner.cache.invalidate(&keys::notification_list());
        Ok(())
    }

    /// Mark everything read, optimistically.
    ///
    /// The cached count drops to zero before the server confirms; if the
    /// request fails, the previous value is restored and the error is
    /// returned for UI-level display.
    pub async fn mark_all_as_read(&self) -> Result<(), CoreError> {
        let key = keys::unread_count();
        let previous = self.inner.cache.get(&key);

        self.inner.cache.set(&key, serde_json::json!(0));
        self.inner.channel.send(ClientMessage::MarkAllRead);

        match self.inner.client.mark_all_read().await {
            Ok(()) => {
                self.inner.cache.invalidate(&keys::notification_list());
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "mark-all-read rejected, rolling back");
                match previous {
                    Some(value) => self.inner.cache.set(&key, (*value).clone()),
                    None => self.inner.cache.invalidate(&key),
                }
                Err(e.into())
            }
        }
    }

    // ── Channel passthrough ──────────────────────────────────────────

    /// Register a listener for raw inbound events.
    pub fn subscribe(
        &self,
        listener: impl Fn(&ServerEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.registry.subscribe(listener)
    }

    /// Transmit a message over the live channel, best-effort.
    pub fn send(&self, message: ClientMessage) {
        self.inner.channel.send(message);
    }

    pub fn channel_state(&self) -> ChannelState {
        self.inner.channel.state()
    }

    /// When the channel last saw an inbound event, if ever.
    pub fn last_event_at(&self) -> Option<tokio::time::Instant> {
        self.inner.channel.last_event_at()
    }

    pub fn watch_channel_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.channel.watch_state()
    }
}

// ── Background refetch ───────────────────────────────────────────────

/// Safety net against missed events: refetch the unread count on a
/// fixed interval regardless of transport mode, service active-refetch
/// signals from the cache, and sweep expired entries.
async fn refetch_loop(inner: Arc<ServiceInner>, cancel: CancellationToken) {
    let mut invalidations = inner.cache.invalidations();
    let mut interval = tokio::time::interval(inner.config.refetch_interval);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            signal = invalidations.recv() => {
                match signal {
                    Ok(key) if key == keys::unread_count() => {
                        debug!(%key, "active refetch");
                        if let Err(e) = fetch_unread(&inner).await {
                            warn!(error = %e, "active refetch failed");
                        }
                    }
                    Ok(key) => {
                        // Only observed keys are signalled; a key that
                        // is not a list page refetches lazily instead.
                        if let Some((page, per_page)) = keys::list_page_params(&key) {
                            debug!(%key, "active list refetch");
                            if let Err(e) = fetch_list(&inner, page, per_page).await {
                                warn!(error = %e, "active list refetch failed");
                            }
                        }
                    }
                    Err(_) => {}
                }
            }
            _ = interval.tick() => {
                debug!("periodic refetch tick");
                inner.cache.invalidate(&keys::unread_count());
                if let Err(e) = fetch_unread(&inner).await {
                    warn!(error = %e, "periodic refetch failed");
                }
                inner.cache.sweep();
            }
        }
    }

    debug!("refetch loop exiting");
}

async fn fetch_list(
    inner: &ServiceInner,
    page: u32,
    per_page: u32,
) -> Result<Arc<Value>, CoreError> {
    let client = &inner.client;
    inner
        .cache
        .fetch_if_stale(&keys::notification_list_page(page, per_page), || async move {
            let listing = client
                .list_notifications(page, per_page)
                .await
                .map_err(CoreError::from)?;
            serde_json::to_value(listing).map_err(|e| CoreError::BadPayload {
                message: e.to_string(),
            })
        })
        .await
}

async fn fetch_unread(inner: &ServiceInner) -> Result<Arc<Value>, CoreError> {
    let client = &inner.client;
    inner
        .cache
        .fetch_if_stale(&keys::unread_count(), || async move {
            let count = client.unread_count().await.map_err(CoreError::from)?;
            Ok(serde_json::json!(count))
        })
        .await
}

fn decode_count(value: &Value) -> Result<u64, CoreError> {
    value.as_u64().ok_or_else(|| CoreError::BadPayload {
        message: format!("expected unread count, got {value}"),
    })
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ── Tests ────────────────────────────────────────────────────────────
