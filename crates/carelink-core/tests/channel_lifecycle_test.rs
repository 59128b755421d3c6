// Lifecycle tests for `EventChannel` against in-process servers:
// a real WebSocket peer for the happy path, half-open and closed
// sockets for the failure paths.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

use carelink_core::{
    keys, CachePolicy, ChannelState, ClientMessage, EventChannel, ListenerRegistry, QueryCache,
    ServerEvent, ServiceConfig, StaticToken,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn build_channel(config: ServiceConfig) -> (EventChannel, Arc<QueryCache>, Arc<ListenerRegistry>) {
    let cache = Arc::new(QueryCache::new(CachePolicy::default()));
    let registry = Arc::new(ListenerRegistry::new());
    let channel = EventChannel::new(
        config,
        Arc::new(StaticToken::new("test-token")),
        Arc::clone(&cache),
        Arc::clone(&registry),
    );
    (channel, cache, registry)
}

fn config_for(addr: std::net::SocketAddr) -> ServiceConfig {
    let mut config = ServiceConfig::new(
        format!("http://{addr}").parse().expect("base url"),
    );
    config.connect_timeout = Duration::from_secs(2);
    config
}

async fn wait_for_state(
    rx: &mut watch::Receiver<ChannelState>,
    timeout: Duration,
    pred: impl Fn(&ChannelState) -> bool,
) -> ChannelState {
    tokio::time::timeout(timeout, async {
        loop {
            let current = rx.borrow().clone();
            if pred(&current) {
                return current;
            }
            rx.changed().await.expect("state sender alive");
        }
    })
    .await
    .expect("state condition within timeout")
}

/// Config pointed at a port nothing listens on, tuned for fast retries.
async fn closed_port_config(max_attempts: u32) -> ServiceConfig {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let mut config = config_for(addr);
    config.connect_timeout = Duration::from_millis(500);
    config.reconnect_base_delay = Duration::from_millis(10);
    config.reconnect_max_delay = Duration::from_millis(50);
    config.max_reconnect_attempts = max_attempts;
    config.poll_interval = Duration::from_millis(30);
    config
}

// ── Happy path ──────────────────────────────────────────────────────

#[tokio::test]
async fn connects_and_applies_pushed_count() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
        ws.send(Message::text(r#"{"type":"NOTIFICATION_COUNT","count":3}"#))
            .await
            .expect("send");
        // Hold the connection open until the client goes away
        while ws.next().await.is_some() {}
    });

    let (channel, cache, registry) = build_channel(config_for(addr));

    let events: Arc<Mutex<Vec<ServerEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _sub = registry.subscribe(move |event| {
        sink.lock().expect("events").push(event.clone());
    });

    channel.init();

    let mut state = channel.watch_state();
    wait_for_state(&mut state, Duration::from_secs(3), |s| {
        *s == ChannelState::Connected
    })
    .await;

    // The pushed count lands in the cache with no fetch involved
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(value) = cache.get_fresh(&keys::unread_count()) {
            assert_eq!(*value, serde_json::json!(3));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "count never arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let seen = events.lock().expect("events");
    assert!(
        seen.iter()
            .any(|e| matches!(e, ServerEvent::NotificationCount { count: 3 })),
        "listener should have received the count event, got {seen:?}"
    );
    drop(seen);

    channel.disconnect().await;
}

#[tokio::test]
async fn outbound_send_reaches_the_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let (frame_tx, frame_rx) = tokio::sync::oneshot::channel::<String>();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream).await.expect("handshake");
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                let _ = frame_tx.send(text.to_string());
                break;
            }
        }
    });

    let (channel, _cache, _registry) = build_channel(config_for(addr));
    channel.init();

    let mut state = channel.watch_state();
    wait_for_state(&mut state, Duration::from_secs(3), |s| {
        *s == ChannelState::Connected
    })
    .await;

    channel.send(ClientMessage::MarkRead { notification_id: 7 });

    let text = tokio::time::timeout(Duration::from_secs(2), frame_rx)
        .await
        .expect("frame within timeout")
        .expect("server alive");
    let json: serde_json::Value = serde_json::from_str(&text).expect("json frame");
    assert_eq!(
        json,
        serde_json::json!({"type": "MARK_READ", "notificationId": 7})
    );

    channel.disconnect().await;
}

// ── Idempotent init ─────────────────────────────────────────────────

#[tokio::test]
async fn double_init_makes_one_transport_attempt() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    // Accept connections but never complete the WebSocket handshake, so
    // the first attempt stays pending for the whole observation window.
    let accepted = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(stream);
        }
    });

    let (channel, _cache, _registry) = build_channel(config_for(addr));

    channel.init();
    channel.init();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1, "second init must not dial");

    channel.disconnect().await;
}

// ── Polling fallback ────────────────────────────────────────────────

#[tokio::test]
async fn falls_back_to_polling_after_attempt_cap() {
    let config = closed_port_config(2).await;
    let (channel, cache, registry) = build_channel(config);

    // Observe the count key so its invalidations become active signals
    let _watcher = cache.observe(&keys::unread_count());
    let mut invalidations = cache.invalidations();

    let refetch_events = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&refetch_events);
    let _sub = registry.subscribe(move |event| {
        if matches!(event, ServerEvent::Other { kind, .. } if kind == "REFETCH_REQUESTED") {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    channel.init();

    let mut state = channel.watch_state();
    wait_for_state(&mut state, Duration::from_secs(5), |s| {
        *s == ChannelState::Polling
    })
    .await;

    // Polling ticks mark the count stale and emit synthetic events
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while refetch_events.load(Ordering::SeqCst) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "no polling tick observed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let signalled = invalidations.recv().await.expect("invalidation signal");
    assert_eq!(signalled, keys::unread_count());

    // No automatic upgrade back to WebSocket
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(channel.state(), ChannelState::Polling);

    channel.disconnect().await;
}

// ── Teardown ────────────────────────────────────────────────────────

#[tokio::test]
async fn disconnect_quiesces_timers_and_listeners() {
    let config = closed_port_config(1).await;
    let poll_interval = config.poll_interval;
    let (channel, _cache, registry) = build_channel(config);

    let hits = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&hits);
    let _sub = registry.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    channel.init();

    let mut state = channel.watch_state();
    wait_for_state(&mut state, Duration::from_secs(5), |s| {
        *s == ChannelState::Polling
    })
    .await;

    channel.disconnect().await;
    assert_eq!(channel.state(), ChannelState::Idle);
    let hits_at_teardown = hits.load(Ordering::SeqCst);

    // Well past several would-be polling ticks: nothing moves
    tokio::time::sleep(poll_interval * 5).await;
    assert_eq!(hits.load(Ordering::SeqCst), hits_at_teardown);
    assert_eq!(channel.state(), ChannelState::Idle);

    let mut post = channel.watch_state();
    let quiet = tokio::time::timeout(Duration::from_millis(100), post.changed()).await;
    assert!(quiet.is_err(), "no state transitions after disconnect");
}

#[tokio::test]
async fn can_reinit_after_disconnect() {
    let config = closed_port_config(1).await;
    let (channel, _cache, _registry) = build_channel(config);

    channel.init();
    tokio::time::sleep(Duration::from_millis(50)).await;
    channel.disconnect().await;
    assert_eq!(channel.state(), ChannelState::Idle);

    channel.init();
    let mut state = channel.watch_state();
    wait_for_state(&mut state, Duration::from_secs(5), |s| {
        *s != ChannelState::Idle
    })
    .await;

    channel.disconnect().await;
    assert_eq!(channel.state(), ChannelState::Idle);
}
