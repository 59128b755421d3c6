// ── Event channel ──
//
// Owns the single live update channel: WebSocket primary, polling
// fallback. Exactly one of the two drives updates at any instant. Every
// parsed inbound event is applied to the cache *before* listener
// fan-out, so callbacks can read the cache and see the event reflected.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use carelink_api::ws::{self, WsConnection};
use carelink_api::{ClientMessage, ServerEvent, TokenProvider};

use crate::backoff;
use crate::cache::QueryCache;
use crate::config::ServiceConfig;
use crate::keys;
use crate::registry::ListenerRegistry;

const OUTBOUND_CHANNEL_CAPACITY: usize = 32;

// ── ChannelState ─────────────────────────────────────────────────────

/// Channel lifecycle state, observable by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// WebSocket attempts exhausted; fixed-interval polling drives
    /// updates until `disconnect()`.
    Polling,
}

// ── EventChannel ─────────────────────────────────────────────────────

/// Manager for the live update channel.
///
/// Cheaply cloneable via `Arc`. Construct one per service instance --
/// there is no process-wide singleton, so tests can run independent
/// channels side by side.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    config: ServiceConfig,
    tokens: Arc<dyn TokenProvider>,
    cache: Arc<QueryCache>,
    registry: Arc<ListenerRegistry>,
    state: watch::Sender<ChannelState>,
    last_event_at: watch::Sender<Option<Instant>>,
    outbound: Mutex<mpsc::Sender<ClientMessage>>,
    cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventChannel {
    pub fn new(
        config: ServiceConfig,
        tokens: Arc<dyn TokenProvider>,
        cache: Arc<QueryCache>,
        registry: Arc<ListenerRegistry>,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Idle);
        let (last_event_at, _) = watch::channel(None);
        // Placeholder sender; init() installs a live one.
        let (outbound, _) = mpsc::channel(1);

        Self {
            inner: Arc::new(ChannelInner {
                config,
                tokens,
                cache,
                registry,
                state,
                last_event_at,
                outbound: Mutex::new(outbound),
                cancel: Mutex::new(CancellationToken::new()),
                task: Mutex::new(None),
            }),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Activate the channel.
    ///
    /// No-op when no credential is available, and idempotent: calling
    /// again while the background task is alive has no further effect.
    /// May be called again after [`disconnect`](Self::disconnect).
    pub fn init(&self) {
        if self.inner.tokens.token().is_none() {
            debug!("channel init skipped: no credential available");
            return;
        }

        let mut task = lock(&self.inner.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("channel init skipped: already active");
            return;
        }

        let cancel = CancellationToken::new();
        *lock(&self.inner.cancel) = cancel.clone();

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        *lock(&self.inner.outbound) = outbound_tx;

        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(run_loop(inner, cancel, outbound_rx)));
    }

    /// Tear the channel down: stop the background task, clear the
    /// listener set, return to [`ChannelState::Idle`].
    ///
    /// No timer may fire and no listener may be invoked afterwards.
    pub async fn disconnect(&self) {
        lock(&self.inner.cancel).cancel();

        let handle = lock(&self.inner.task).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.inner.registry.clear();
        self.inner.state.send_replace(ChannelState::Idle);
        debug!("channel disconnected");
    }

    // ── Outbound ─────────────────────────────────────────────────────

    /// Transmit a message if currently connected; otherwise log and
    /// drop. Never errors, never queues across reconnects.
    pub fn send(&self, message: ClientMessage) {
        if *self.inner.state.borrow() != ChannelState::Connected {
            debug!(?message, "dropping outbound message: channel not connected");
            return;
        }

        let tx = lock(&self.inner.outbound).clone();
        if let Err(e) = tx.try_send(message) {
            debug!(error = %e, "dropping outbound message");
        }
    }

    // ── Observation ──────────────────────────────────────────────────

    pub fn state(&self) -> ChannelState {
        self.inner.state.borrow().clone()
    }

    /// Subscribe to channel state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// When the last inbound event arrived, if any.
    pub fn last_event_at(&self) -> Option<Instant> {
        *self.inner.last_event_at.borrow()
    }
}

impl ChannelInner {
    fn set_state(&self, next: ChannelState) {
        self.state.send_replace(next);
    }

    /// Apply one inbound event: cache side-effects first, then fan-out.
    fn apply_event(&self, event: ServerEvent) {
        match &event {
            ServerEvent::NewNotification { notification } => {
                debug!(id = notification.id, "new notification event");
                self.cache.invalidate(&keys::unread_count());
                self.cache.invalidate(&keys::notification_list());
            }
            ServerEvent::NotificationCount { count } => {
                // Authoritative push: write through, skip the refetch
                // round-trip entirely.
                debug!(count, "server pushed unread count");
                self.cache
                    .set(&keys::unread_count(), serde_json::json!(count));
            }
            ServerEvent::Other { kind, .. } => {
                debug!(kind, "unrecognized event type, fan-out only");
            }
        }

        self.last_event_at.send_replace(Some(Instant::now()));
        self.registry.dispatch(&event);
    }
}

// ── Background loop ──────────────────────────────────────────────────

/// Main loop: connect → pump → on failure, backoff → reconnect; after
/// the attempt cap, fall back to polling until cancelled.
async fn run_loop(
    inner: Arc<ChannelInner>,
    cancel: CancellationToken,
    mut outbound_rx: mpsc::Receiver<ClientMessage>,
) {
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let Some(token) = inner.tokens.token() else {
            info!("credential no longer available, stopping channel");
            break;
        };

        let url = match ws::events_url(&inner.config.base_url, &token) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "cannot derive channel URL, stopping");
                break;
            }
        };

        inner.set_state(ChannelState::Connecting);

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = WsConnection::connect(&url, inner.config.connect_timeout) => result,
        };

        let outcome = match connected {
            Ok(conn) => {
                attempt = 0;
                inner.set_state(ChannelState::Connected);
                conn.run(&mut outbound_rx, &cancel, |event| inner.apply_event(event))
                    .await
            }
            Err(e) => Err(e),
        };

        if cancel.is_cancelled() {
            break;
        }

        match outcome {
            Ok(()) => info!(attempt, "channel closed"),
            Err(e) => warn!(error = %e, attempt, "channel failure"),
        }

        if attempt >= inner.config.max_reconnect_attempts {
            warn!(
                max_attempts = inner.config.max_reconnect_attempts,
                "reconnect attempts exhausted, falling back to polling"
            );
            inner.set_state(ChannelState::Polling);
            run_polling(&inner, &cancel).await;
            break;
        }

        let delay = backoff::delay_for_attempt(
            attempt,
            inner.config.reconnect_base_delay,
            inner.config.reconnect_max_delay,
        );
        inner.set_state(ChannelState::Reconnecting { attempt });
        info!(delay_ms = delay.as_millis() as u64, attempt, "waiting before reconnect");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }

    inner.set_state(ChannelState::Idle);
    debug!("channel loop exiting");
}

/// Polling fallback: each tick marks the unread count stale and emits a
/// synthetic refetch event to subscribers. Runs until cancelled -- the
/// channel never upgrades back to WebSocket on its own.
async fn run_polling(inner: &ChannelInner, cancel: &CancellationToken) {
    let mut interval = tokio::time::interval(inner.config.poll_interval);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                debug!("polling tick: requesting unread-count refetch");
                inner.cache.invalidate(&keys::unread_count());
                inner.registry.dispatch(&ServerEvent::Other {
                    kind: "REFETCH_REQUESTED".into(),
                    payload: serde_json::json!({
                        "key": keys::unread_count().segments(),
                    }),
                });
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ── Tests ────────────────────────────────────────────────────────────
