use crate::error::ProviderError;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use std::time::Duration;
use tracing::{debug, instrument};

/// Ceiling for a single vendor call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const USER_AGENT_VALUE: &str = "planbar";

/// Shared reqwest client with the fixed timeout every provider uses.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Result<Self, ProviderError> {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| ProviderError::config(format!("failed to build HTTP client: {}", err)))?;

        Ok(Self { client })
    }

    /// One GET, no retries. 2xx yields the body; anything else is an error.
    #[instrument(skip(self, headers))]
    pub async fn get(&self, url: &str, headers: HeaderMap) -> Result<Vec<u8>, ProviderError> {
        let response = self.client.get(url).headers(headers).send().await?;

        let status = response.status();
        debug!(%status, "Usage endpoint responded");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::test_server;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_get_times_out_on_silent_server() {
        let url = test_server::serve_silent().await;
        let http = HttpClient::with_timeout(Duration::from_millis(100)).unwrap();

        let err = tokio::time::timeout(Duration::from_secs(1), http.get(&url, HeaderMap::new()))
            .await
            .expect("request should give up before the outer deadline")
            .unwrap_err();
        assert_eq!(err.kind(), "network_error");
        assert!(err.to_string().starts_with("request timed out"), "{}", err);
    }

    #[tokio::test]
    async fn test_get_returns_body() {
        let (url, _requests) = test_server::serve(200, r#"{"used": 1}"#).await;
        let http = HttpClient::new().unwrap();
        let body = http.get(&url, HeaderMap::new()).await.unwrap();
        assert_eq!(body, br#"{"used": 1}"#.to_vec());
    }
}
