// ── Core error types ──
//
// Consumer-facing errors from carelink-core. Consumers never see HTTP
// status codes or JSON parse failures directly -- the
// `From<carelink_api::Error>` impl translates wire-layer errors into
// domain-appropriate variants.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot reach the portal backend: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Notification service is not connected")]
    Disconnected,

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Data errors ──────────────────────────────────────────────────
    /// A cache fetch gave up after its retry budget.
    #[error("Fetch failed: {message}")]
    FetchFailed { message: String },

    /// A cached payload did not have the expected shape.
    #[error("Unexpected cached payload: {message}")]
    BadPayload { message: String },

    // ── Mutation errors ──────────────────────────────────────────────
    /// The backend rejected a mark-read mutation. The only error class
    /// that should reach the user.
    #[error("Operation rejected: {message}")]
    Rejected { message: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },
}

// ── Conversion from wire-layer errors ────────────────────────────────

impl From<carelink_api::Error> for CoreError {
    fn from(err: carelink_api::Error) -> Self {
        match err {
            carelink_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            carelink_api::Error::MissingCredential => CoreError::AuthenticationFailed {
                message: "no credential available".into(),
            },
            carelink_api::Error::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout { timeout_secs: 0 }
                } else if e.is_connect() {
                    CoreError::ConnectionFailed {
                        reason: e.to_string(),
                    }
                } else {
                    CoreError::Rejected {
                        message: e.to_string(),
                    }
                }
            }
            carelink_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            carelink_api::Error::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            carelink_api::Error::Tls(msg) => CoreError::ConnectionFailed {
                reason: format!("TLS error: {msg}"),
            },
            carelink_api::Error::Api { status, message } => CoreError::Rejected {
                message: format!("HTTP {status}: {message}"),
            },
            carelink_api::Error::WebSocket(reason) => CoreError::ConnectionFailed { reason },
            carelink_api::Error::Deserialization { message, body: _ } => CoreError::BadPayload {
                message,
            },
        }
    }
}
