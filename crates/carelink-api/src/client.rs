// Portal REST client
//
// Wraps `reqwest::Client` with bearer auth, URL construction, and
// status/body handling for the notification endpoints. Only the
// endpoints the notification layer consumes live here -- the rest of
// the portal API is out of scope for this crate.

use std::sync::Arc;

use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::token::TokenProvider;
use crate::transport::TransportConfig;
use crate::wire::Notification;

/// One page of a paginated listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

#[derive(Debug, Deserialize)]
struct UnreadCountResponse {
    count: u64,
}

/// HTTP client for the portal's notification endpoints.
///
/// Every request resolves the bearer credential through the injected
/// [`TokenProvider`] at call time, so a token refresh elsewhere in the
/// app is picked up without rebuilding the client.
pub struct PortalClient {
    http: reqwest::Client,
    base_url: Url,
    tokens: Arc<dyn TokenProvider>,
}

impl PortalClient {
    /// Create a new client from a `TransportConfig`.
    pub fn new(
        base_url: Url,
        tokens: Arc<dyn TokenProvider>,
        transport: &TransportConfig,
    ) -> Result<Self, Error> {
        let http = transport.build_client()?;
        Ok(Self {
            http,
            base_url,
            tokens,
        })
    }

    /// Create a client with a pre-built `reqwest::Client`.
    pub fn from_reqwest(
        base_url: Url,
        http: reqwest::Client,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            http,
            base_url,
            tokens,
        }
    }

    /// The portal base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // ── Notification endpoints ───────────────────────────────────────

    /// Fetch the unread notification count.
    pub async fn unread_count(&self) -> Result<u64, Error> {
        let url = self.api_url("api/notifications/unread-count")?;
        let resp: UnreadCountResponse = self.get(url).await?;
        Ok(resp.count)
    }

    /// Fetch one page of the notification list, newest first.
    pub async fn list_notifications(
        &self,
        page: u32,
        per_page: u32,
    ) -> Result<Page<Notification>, Error> {
        let mut url = self.api_url("api/notifications")?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("perPage", &per_page.to_string());
        self.get(url).await
    }

    /// Persist a single notification as read.
    pub async fn mark_read(&self, id: i64) -> Result<(), Error> {
        let url = self.api_url(&format!("api/notifications/{id}/read"))?;
        self.post_empty(url).await
    }

    /// Persist every notification as read.
    pub async fn mark_all_read(&self) -> Result<(), Error> {
        let url = self.api_url("api/notifications/read-all")?;
        self.post_empty(url).await
    }

    // ── Request helpers ──────────────────────────────────────────────

    fn api_url(&self, path: &str) -> Result<Url, Error> {
        self.base_url.join(path).map_err(Error::InvalidUrl)
    }

    fn bearer(&self) -> Result<String, Error> {
        self.tokens
            .token()
            .map(|t| t.expose_secret().to_owned())
            .ok_or(Error::MissingCredential)
    }

    /// Send a GET request and deserialize the JSON body.
    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T, Error> {
        debug!("GET {}", url);

        let resp = self
            .http
            .get(url)
            .bearer_auth(self.bearer()?)
            .send()
            .await
            .map_err(Error::Transport)?;

        Self::parse_json(resp).await
    }

    /// Send a bodyless POST (mutation endpoints return no payload).
    async fn post_empty(&self, url: Url) -> Result<(), Error> {
        debug!("POST {}", url);

        let resp = self
            .http
            .post(url)
            .bearer_auth(self.bearer()?)
            .send()
            .await
            .map_err(Error::Transport)?;

        Self::check_status(resp).await.map(|_| ())
    }

    /// Reject non-success statuses, mapping 401 to an auth error.
    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, Error> {
        let status = resp.status();

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication {
                message: "bearer token rejected or expired".into(),
            });
        }

        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(resp)
    }

    async fn parse_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
        let resp = Self::check_status(resp).await?;
        let body = resp.text().await.map_err(Error::Transport)?;

        serde_json::from_str(&body).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body,
        })
    }
}
