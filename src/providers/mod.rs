pub mod bigmodel;
pub mod http;
pub mod kimi;

use crate::config::Credential;
use crate::error::ProviderError;
use crate::models::UsageInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

pub use bigmodel::BigModelProvider;
pub use http::HttpClient;
pub use kimi::KimiProvider;

/// Outgoing request headers produced by [`Provider::authenticate`].
#[derive(Clone, Default)]
pub struct AuthContext {
    headers: HeaderMap,
}

impl AuthContext {
    /// `Authorization: Bearer <key>` plus a JSON content type.
    pub fn bearer(credential: &Credential) -> Result<Self, ProviderError> {
        let key = credential.expose().trim();
        if key.is_empty() {
            return Err(ProviderError::config("api_key is empty"));
        }

        let value = HeaderValue::from_str(&format!("Bearer {}", key))
            .map_err(|_| ProviderError::config("api_key contains invalid header characters"))?;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(Self { headers })
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

// Headers carry the secret.
impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A vendor usage API. The three steps always run in order:
/// authenticate, then fetch, then parse.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pure function of the credential.
    fn authenticate(&self, credential: &Credential) -> Result<AuthContext, ProviderError>;

    /// Exactly one request to the vendor's usage endpoint.
    async fn fetch_usage(&self, auth: &AuthContext) -> Result<Vec<u8>, ProviderError>;

    /// Map the vendor's JSON onto [`UsageInfo`].
    fn parse_usage(&self, raw: &[u8]) -> Result<UsageInfo, ProviderError>;
}

/// Name → provider table, built once at startup.
#[derive(Clone, Default)]
pub struct Registry {
    providers: HashMap<&'static str, Arc<dyn Provider>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kimi and BigModel sharing one HTTP client.
    pub fn builtin() -> Result<Self, ProviderError> {
        let http = HttpClient::new()?;
        let mut registry = Self::new();
        registry.register(Arc::new(KimiProvider::new(http.clone())));
        registry.register(Arc::new(BigModelProvider::new(http)));
        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.providers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Vendors send quota numbers either as JSON numbers or numeric strings.
pub(crate) fn deserialize_number_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let Some(value) = value else {
        return Ok(None);
    };
    match value {
        serde_json::Value::Number(num) => num
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("invalid number value")),
        serde_json::Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .ok_or_else(|| serde::de::Error::custom(format!("invalid numeric string {:?}", s))),
        _ => Err(serde::de::Error::custom("expected a number or numeric string")),
    }
    .map(Some)
}

pub(crate) fn required(value: Option<f64>, field: &str) -> Result<f64, ProviderError> {
    value.ok_or_else(|| ProviderError::parse(format!("missing required field `{}`", field)))
}

/// Consumed amounts are counts; a negative one is a malformed body.
pub(crate) fn non_negative(value: f64, field: &str) -> Result<f64, ProviderError> {
    if value < 0.0 {
        return Err(ProviderError::parse(format!(
            "field `{}` must not be negative, got {}",
            field, value
        )));
    }
    Ok(value)
}

pub(crate) fn parse_iso8601(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
