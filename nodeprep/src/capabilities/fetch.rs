//! Downloading installer scripts, signing keys and manifests.

use crate::errors::ActionError;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Fetches a resource by URL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Returns the body of `url`; non-2xx responses are errors.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ActionError>;
}

/// [`Fetcher`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Creates a fetcher with connect and request timeouts.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, ActionError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("nodeprep/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ActionError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ActionError> {
        debug!(url, "Fetching");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ActionError::download(url, e.to_string()))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| ActionError::download(url, e.to_string()))?;
        debug!(url, bytes = body.len(), "Fetched");
        Ok(body.to_vec())
    }
}
