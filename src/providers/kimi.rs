use crate::config::Credential;
use crate::error::ProviderError;
use crate::models::{LimitDetail, UsageInfo};
use crate::providers::{
    deserialize_number_opt, non_negative, parse_iso8601, required, AuthContext, HttpClient,
    Provider,
};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

const API_URL: &str = "https://api.kimi.com/coding/v1/usages";
const NAME: &str = "kimi";

/// Response from /coding/v1/usages
///
/// The quota numbers normally sit under `usage`; older and trimmed-down
/// responses put them at the root, so both places are accepted.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageResponse {
    user: Option<UserResponse>,
    usage: Option<QuotaResponse>,
    #[serde(flatten)]
    root: QuotaResponse,
    #[serde(default)]
    limits: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuotaResponse {
    #[serde(default, deserialize_with = "deserialize_number_opt")]
    limit: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_number_opt")]
    used: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_number_opt")]
    remaining: Option<f64>,
    reset_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserResponse {
    user_id: Option<String>,
    membership: Option<MembershipResponse>,
}

#[derive(Debug, Deserialize)]
struct MembershipResponse {
    level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    window: Option<WindowResponse>,
    #[serde(default)]
    detail: QuotaResponse,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WindowResponse {
    duration: Option<i64>,
    time_unit: Option<String>,
}

impl WindowResponse {
    fn label(&self) -> String {
        let unit = self
            .time_unit
            .as_deref()
            .map(|u| u.trim_start_matches("TIME_UNIT_").to_lowercase())
            .unwrap_or_else(|| "unit".to_string());
        match self.duration {
            Some(duration) => format!("{} {}", duration, unit),
            None => unit,
        }
    }
}

/// Kimi coding plan (bearer API key)
pub struct KimiProvider {
    http: HttpClient,
    url: String,
}

impl KimiProvider {
    pub fn new(http: HttpClient) -> Self {
        Self {
            http,
            url: API_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_url(http: HttpClient, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }

    /// Windows are supplementary; a bad one is dropped instead of failing the quota.
    fn parse_limit(value: serde_json::Value) -> Option<LimitDetail> {
        match Self::limit_detail(value) {
            Ok(detail) => Some(detail),
            Err(err) => {
                warn!(error = %err, "Skipping malformed Kimi rate-limit window");
                None
            }
        }
    }

    fn limit_detail(value: serde_json::Value) -> Result<LimitDetail, ProviderError> {
        let limit: RateLimitResponse = serde_json::from_value(value)?;
        let window = limit
            .window
            .as_ref()
            .map(WindowResponse::label)
            .unwrap_or_else(|| "window".to_string());
        let detail = limit.detail;

        let mut parsed = LimitDetail::new(
            window,
            non_negative(
                required(detail.used, "limits[].detail.used")?,
                "limits[].detail.used",
            )?,
            required(detail.limit, "limits[].detail.limit")?,
        );
        parsed.remaining = detail.remaining;
        parsed.reset_time = detail.reset_time.as_deref().and_then(parse_iso8601);
        Ok(parsed)
    }
}

#[async_trait]
impl Provider for KimiProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn authenticate(&self, credential: &Credential) -> Result<AuthContext, ProviderError> {
        AuthContext::bearer(credential)
    }

    #[instrument(skip_all, fields(provider = NAME))]
    async fn fetch_usage(&self, auth: &AuthContext) -> Result<Vec<u8>, ProviderError> {
        debug!(url = %self.url, "Fetching Kimi usage");
        self.http.get(&self.url, auth.headers().clone()).await
    }

    fn parse_usage(&self, raw: &[u8]) -> Result<UsageInfo, ProviderError> {
        let response: UsageResponse = serde_json::from_slice(raw)?;
        let quota = response.usage.unwrap_or(response.root);

        let used = non_negative(required(quota.used, "used")?, "used")?;
        let limit = required(quota.limit, "limit")?;

        let limits = response
            .limits
            .into_iter()
            .filter_map(Self::parse_limit)
            .collect();

        let (user_id, level) = match response.user {
            Some(user) => (user.user_id, user.membership.and_then(|m| m.level)),
            None => (None, None),
        };

        Ok(UsageInfo::new(NAME, used, limit)
            .with_remaining(quota.remaining)
            .with_reset_time(quota.reset_time.as_deref().and_then(parse_iso8601))
            .with_user_id(user_id)
            .with_membership_level(level)
            .with_limits(limits))
    }
}
