// carelink-core: real-time notification core for the CareLink portal.
//
// Sits between carelink-api and the UI: a query cache over the REST
// responses, a managed live channel (WebSocket with polling fallback),
// and a listener registry for raw event fan-out.

mod backoff;

pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod keys;
pub mod registry;
pub mod service;

// ── Primary re-exports ──────────────────────────────────────────────
pub use cache::{CachePolicy, QueryCache, QueryKey};
pub use channel::{ChannelState, EventChannel};
pub use config::ServiceConfig;
pub use error::CoreError;
pub use registry::{ListenerRegistry, Subscription};
pub use service::NotificationService;

// Re-export the wire types consumers handle in listeners.
pub use carelink_api::{ClientMessage, Notification, Page, ServerEvent, StaticToken, TokenProvider};
