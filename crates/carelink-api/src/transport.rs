// HTTP transport settings for the portal client.
//
// Clinic deployments often sit behind a private CA, so the trust root
// is configurable. Everything else (timeout, user agent) is fixed
// policy shared by every request.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;

const USER_AGENT: &str = concat!("carelink/", env!("CARGO_PKG_VERSION"));

/// Transport settings applied to every portal request.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Extra PEM root certificate for portals fronted by a private CA.
    /// `None` trusts the system store only.
    pub root_ca: Option<PathBuf>,

    /// Per-request bound, connection setup included.
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            root_ca: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    /// Config trusting the given PEM root in addition to the system store.
    pub fn with_root_ca(path: impl Into<PathBuf>) -> Self {
        Self {
            root_ca: Some(path.into()),
            ..Self::default()
        }
    }

    /// Build the `reqwest::Client` backing a [`PortalClient`](crate::PortalClient).
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT);

        if let Some(path) = &self.root_ca {
            builder = builder.add_root_certificate(load_root_ca(path)?);
        }

        builder
            .build()
            .map_err(|e| Error::Tls(format!("cannot build HTTP client: {e}")))
    }
}

fn load_root_ca(path: &Path) -> Result<reqwest::Certificate, Error> {
    let pem = std::fs::read(path)
        .map_err(|e| Error::Tls(format!("cannot read root CA {}: {e}", path.display())))?;
    reqwest::Certificate::from_pem(&pem)
        .map_err(|e| Error::Tls(format!("invalid root CA {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds() {
        TransportConfig::default().build_client().expect("client");
    }

    #[test]
    fn missing_root_ca_file_is_a_tls_error() {
        let config = TransportConfig::with_root_ca("/nonexistent/clinic-ca.pem");
        let err = config.build_client().expect_err("unreadable CA");
        assert!(matches!(err, Error::Tls(_)), "got {err:?}");
    }
}
