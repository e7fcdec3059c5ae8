use crate::error::ProviderError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Derive a usage percentage; `None` when the limit is unbounded.
fn percent_of(used: f64, limit: Option<f64>) -> Option<f64> {
    limit.map(|limit| (used / limit) * 100.0)
}

/// Vendors report "no cap" as a zero or negative limit.
fn bounded(limit: f64) -> Option<f64> {
    (limit > 0.0).then_some(limit)
}

/// Per-model breakdown inside a rate window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageDetail {
    pub model_code: String,
    pub usage: f64,
}

/// A single rate window reported by a vendor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitDetail {
    /// Human-readable window (e.g. "300 minute", "1 month", "total")
    pub window: String,
    pub used: f64,
    /// `None` when the window has no cap
    pub limit: Option<f64>,
    pub remaining: Option<f64>,
    pub reset_time: Option<DateTime<Utc>>,
    pub usage_details: Vec<UsageDetail>,
}

impl LimitDetail {
    pub fn new(window: impl Into<String>, used: f64, limit: f64) -> Self {
        Self {
            window: window.into(),
            used,
            limit: bounded(limit),
            remaining: None,
            reset_time: None,
            usage_details: Vec::new(),
        }
    }

    pub fn percent(&self) -> Option<f64> {
        percent_of(self.used, self.limit)
    }
}

/// Normalized result of one provider query.
///
/// Built once from a vendor response and never mutated afterwards; the
/// percentage is derived at construction so it always agrees with
/// `used` and `limit`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageInfo {
    provider: String,
    used: f64,
    limit: Option<f64>,
    percent: Option<f64>,
    remaining: Option<f64>,
    reset_time: Option<DateTime<Utc>>,
    user_id: Option<String>,
    membership_level: Option<String>,
    limits: Vec<LimitDetail>,
    extra: BTreeMap<String, String>,
}

impl UsageInfo {
    pub fn new(provider: impl Into<String>, used: f64, limit: f64) -> Self {
        let limit = bounded(limit);
        Self {
            provider: provider.into(),
            used,
            limit,
            percent: percent_of(used, limit),
            remaining: None,
            reset_time: None,
            user_id: None,
            membership_level: None,
            limits: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_remaining(mut self, remaining: Option<f64>) -> Self {
        self.remaining = remaining;
        self
    }

    pub fn with_reset_time(mut self, reset_time: Option<DateTime<Utc>>) -> Self {
        self.reset_time = reset_time;
        self
    }

    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_membership_level(mut self, level: Option<String>) -> Self {
        self.membership_level = level.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_limits(mut self, limits: Vec<LimitDetail>) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn used(&self) -> f64 {
        self.used
    }

    pub fn limit(&self) -> Option<f64> {
        self.limit
    }

    pub fn percent(&self) -> Option<f64> {
        self.percent
    }

    /// Percentage rounded for display
    pub fn rounded_percent(&self) -> Option<i64> {
        self.percent.map(|p| p.round() as i64)
    }

    pub fn remaining(&self) -> Option<f64> {
        self.remaining
    }

    pub fn reset_time(&self) -> Option<DateTime<Utc>> {
        self.reset_time
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn membership_level(&self) -> Option<&str> {
        self.membership_level.as_deref()
    }

    pub fn limits(&self) -> &[LimitDetail] {
        &self.limits
    }

    pub fn extra(&self) -> &BTreeMap<String, String> {
        &self.extra
    }
}

pub type ProviderOutcome = Result<UsageInfo, ProviderError>;

/// Outcome of one provider within a run
#[derive(Debug, Clone)]
pub struct ProviderReport {
    pub provider: String,
    pub outcome: ProviderOutcome,
}

impl Serialize for ProviderReport {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("ProviderReport", 3)?;
        state.serialize_field("provider", &self.provider)?;
        match &self.outcome {
            Ok(usage) => {
                state.serialize_field("status", "ok")?;
                state.serialize_field("usage", usage)?;
            }
            Err(err) => {
                state.serialize_field("status", "error")?;
                state.serialize_field("error", &ErrorView::from(err))?;
            }
        }
        state.end()
    }
}

/// Error as exposed to JSON consumers: the tagged variant plus its message.
#[derive(Serialize)]
struct ErrorView<'a> {
    #[serde(flatten)]
    error: &'a ProviderError,
    message: String,
}

impl<'a> From<&'a ProviderError> for ErrorView<'a> {
    fn from(error: &'a ProviderError) -> Self {
        Self {
            error,
            message: error.to_string(),
        }
    }
}

/// Every configured provider's outcome for one run, in configuration order
#[derive(Debug, Clone, Serialize)]
pub struct AggregateResult {
    pub fetched_at: DateTime<Utc>,
    pub providers: Vec<ProviderReport>,
}

impl AggregateResult {
    pub fn new(providers: Vec<ProviderReport>) -> Self {
        Self {
            fetched_at: Utc::now(),
            providers,
        }
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn successes(&self) -> impl Iterator<Item = &UsageInfo> {
        self.providers.iter().filter_map(|r| r.outcome.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &ProviderError)> {
        self.providers
            .iter()
            .filter_map(|r| r.outcome.as_ref().err().map(|e| (r.provider.as_str(), e)))
    }

    pub fn has_success(&self) -> bool {
        self.successes().next().is_some()
    }

    #[cfg(test)]
    pub fn get(&self, provider: &str) -> Option<&ProviderOutcome> {
        self.providers
            .iter()
            .find(|r| r.provider == provider)
            .map(|r| &r.outcome)
    }
}
