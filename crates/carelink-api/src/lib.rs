// carelink-api: wire layer for the CareLink portal notification service.
//
// REST endpoints (unread count, list, mark-read) plus the WebSocket
// event channel. Stateful concerns (caching, reconnection policy,
// fan-out) live in carelink-core -- this crate only moves bytes.

pub mod client;
pub mod error;
pub mod token;
pub mod transport;
pub mod wire;
pub mod ws;

pub use client::{Page, PortalClient};
pub use error::Error;
pub use token::{StaticToken, TokenProvider};
pub use wire::{ClientMessage, Notification, ServerEvent};
