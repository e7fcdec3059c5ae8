use crate::config::Credential;
use crate::error::ProviderError;
use crate::models::UsageInfo;
use crate::providers::{
    AuthContext, BigModelProvider, HttpClient, KimiProvider, Provider, Registry,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const KIMI_FIXTURE: &str = r#"{
    "user": {"userId": "mock-user", "membership": {"level": "LEVEL_INTERMEDIATE"}},
    "usage": {"limit": "100", "used": "13", "remaining": "87", "resetTime": "2026-02-06T08:31:59Z"},
    "limits": [
        {
            "window": {"duration": 300, "timeUnit": "TIME_UNIT_MINUTE"},
            "detail": {"limit": "100", "used": "65", "remaining": "35", "resetTime": "2026-01-30T13:31:59Z"}
        }
    ]
}"#;

const BIGMODEL_FIXTURE: &str = r#"{
    "code": 200,
    "msg": "ok",
    "success": true,
    "data": {
        "level": "pro",
        "limits": [
            {"type": "TOKENS_LIMIT", "unit": 3, "number": 5, "percentage": 45, "nextResetTime": 1769776934422},
            {
                "type": "TIME_LIMIT", "unit": 5, "number": 1,
                "usage": 1000, "currentValue": 310, "remaining": 690,
                "nextResetTime": 1769776934422,
                "usageDetails": [
                    {"modelCode": "search-prime", "usage": 250},
                    {"modelCode": "web-reader", "usage": 60}
                ]
            }
        ]
    }
}"#;

/// Pipeline step a [`MockProvider`] fails at
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Authenticate,
    Fetch,
    Parse,
}

/// Flat `{"used": .., "limit": ..}` body understood by standalone mocks
#[derive(Deserialize)]
struct FlatUsage {
    used: f64,
    limit: f64,
}

/// Provider that answers from a canned body instead of the network.
///
/// When wrapping a real provider, authentication and parsing go through it
/// so the output matches what the vendor variant would produce.
pub struct MockProvider {
    name: &'static str,
    body: String,
    fail_at: Option<FailAt>,
    inner: Option<Arc<dyn Provider>>,
    fetches: AtomicUsize,
}

impl MockProvider {
    pub fn ok(name: &'static str, body: impl Into<String>) -> Self {
        Self {
            name,
            body: body.into(),
            fail_at: None,
            inner: None,
            fetches: AtomicUsize::new(0),
        }
    }

    #[cfg(test)]
    pub fn failing(name: &'static str, fail_at: FailAt) -> Self {
        Self {
            fail_at: Some(fail_at),
            ..Self::ok(name, "")
        }
    }

    pub fn replaying(inner: Arc<dyn Provider>, body: impl Into<String>) -> Self {
        Self {
            inner: Some(inner.clone()),
            ..Self::ok(inner.name(), body)
        }
    }

    #[cfg(test)]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn authenticate(&self, credential: &Credential) -> Result<AuthContext, ProviderError> {
        if self.fail_at == Some(FailAt::Authenticate) {
            return Err(ProviderError::config("api_key rejected by mock"));
        }
        match &self.inner {
            Some(inner) => inner.authenticate(credential),
            None => AuthContext::bearer(credential),
        }
    }

    async fn fetch_usage(&self, _auth: &AuthContext) -> Result<Vec<u8>, ProviderError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.fail_at {
            Some(FailAt::Fetch) => Err(ProviderError::network("connection refused (mock)")),
            Some(FailAt::Parse) => Ok(b"<html>maintenance</html>".to_vec()),
            _ => Ok(self.body.clone().into_bytes()),
        }
    }

    fn parse_usage(&self, raw: &[u8]) -> Result<UsageInfo, ProviderError> {
        if let Some(inner) = &self.inner {
            return inner.parse_usage(raw);
        }
        let flat: FlatUsage = serde_json::from_slice(raw)?;
        Ok(UsageInfo::new(self.name, flat.used, flat.limit))
    }
}

/// Registry whose built-in providers replay recorded responses.
pub fn mock_registry() -> Result<Registry, ProviderError> {
    let http = HttpClient::new()?;
    let mut registry = Registry::new();
    registry.register(Arc::new(MockProvider::replaying(
        Arc::new(KimiProvider::new(http.clone())),
        KIMI_FIXTURE,
    )));
    registry.register(Arc::new(MockProvider::replaying(
        Arc::new(BigModelProvider::new(http)),
        BIGMODEL_FIXTURE,
    )));
    Ok(registry)
}
