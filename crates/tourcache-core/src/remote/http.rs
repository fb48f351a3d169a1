//! HTTP remote speaking the `{success, data, error, lastModified, version}`
//! envelope.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::config::CacheConfig;

use super::{FetchResponse, PushResponse, RemoteDataSource, RemoteError, ResourceType, SyncDelta};

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// HTTP client for the remote API.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
    timeout_ms: u64,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, config: &CacheConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(config.network_timeout())
            .gzip(config.enable_compression)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout_ms: config.network_timeout_ms,
        })
    }

    fn url(&self, resource: &ResourceType) -> String {
        format!("{}/{}", self.base_url, resource.path())
    }

    fn map_send_error(&self, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout(self.timeout_ms)
        } else {
            RemoteError::NetworkError(e)
        }
    }

    /// Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, RemoteError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status().as_u16() == 429 {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(RemoteError::from_status(status, &body))
        }
    }

    async fn send<T: DeserializeOwned, B: Serialize>(
        &self,
        url: &str,
        body: Option<&B>,
    ) -> Result<T, RemoteError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let request = match body {
                Some(body) => self.client.post(url).json(body),
                None => self.client.get(url),
            };
            let response = request
                .header(header::ACCEPT, "application/json")
                .send()
                .await
                .map_err(|e| self.map_send_error(e))?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    return response
                        .json()
                        .await
                        .map_err(|e| RemoteError::InvalidResponse(format!("{}: {}", url, e)));
                }
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(RemoteError::RateLimited);
                    }
                    warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }
}

#[async_trait]
impl RemoteDataSource for HttpRemote {
    async fn fetch(&self, resource: &ResourceType) -> Result<FetchResponse, RemoteError> {
        let url = self.url(resource);
        debug!(url = %url, "Fetching resource");
        self.send::<FetchResponse, ()>(&url, None).await
    }

    async fn push(
        &self,
        resource: &ResourceType,
        delta: &SyncDelta,
    ) -> Result<PushResponse, RemoteError> {
        let url = self.url(resource);
        debug!(url = %url, operation = ?delta.operation, "Pushing change");
        self.send(&url, Some(delta)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_join_resource_path() {
        let remote = HttpRemote::new("https://api.example.com/v1/", &CacheConfig::default()).unwrap();
        assert_eq!(
            remote.url(&ResourceType::TouristPlaces),
            "https://api.example.com/v1/places"
        );
        assert_eq!(
            remote.url(&ResourceType::UserData("u7".into())),
            "https://api.example.com/v1/users/u7/data"
        );
    }
}
