// ── Runtime service configuration ──
//
// Tuning knobs for the notification core. The embedding app constructs
// a `ServiceConfig` and hands it in -- core never reads config files.

use std::time::Duration;

use carelink_api::transport::TransportConfig;
use url::Url;

/// Configuration for one [`NotificationService`](crate::NotificationService)
/// instance.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Portal base URL (e.g., `https://portal.example.com`). The
    /// WebSocket address is derived from it by scheme rewrite.
    pub base_url: Url,

    /// HTTP transport settings (TLS, request timeout).
    pub transport: TransportConfig,

    /// Bound on the WebSocket handshake (TCP + TLS + upgrade).
    pub connect_timeout: Duration,

    /// Delay before the first reconnect attempt; doubles each attempt.
    pub reconnect_base_delay: Duration,

    /// Upper bound on the reconnect delay.
    pub reconnect_max_delay: Duration,

    /// Reconnect attempts before falling back to polling.
    pub max_reconnect_attempts: u32,

    /// Fixed interval between refetch ticks while in polling mode.
    pub poll_interval: Duration,

    /// Age past which a cache entry is considered stale.
    pub stale_after: Duration,

    /// Age past which an unobserved cache entry is purged.
    pub gc_after: Duration,

    /// Safety-net refetch interval for the unread count, applied
    /// regardless of transport mode.
    pub refetch_interval: Duration,

    /// Retry budget for a single cache fetch (initial try included).
    pub fetch_retry_attempts: u32,
}

impl ServiceConfig {
    /// Defaults for everything except the base URL.
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            transport: TransportConfig::default(),
            connect_timeout: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            poll_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(20),
            gc_after: Duration::from_secs(300),
            refetch_interval: Duration::from_secs(30),
            fetch_retry_attempts: 3,
        }
    }
}
