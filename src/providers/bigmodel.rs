use crate::config::Credential;
use crate::error::ProviderError;
use crate::models::{LimitDetail, UsageDetail, UsageInfo};
use crate::providers::{deserialize_number_opt, non_negative, AuthContext, HttpClient, Provider};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

const API_URL: &str = "https://open.bigmodel.cn/api/monitor/usage/quota/limit";
const NAME: &str = "bigmodel";

const TOKENS_LIMIT: &str = "TOKENS_LIMIT";
const TIME_LIMIT: &str = "TIME_LIMIT";

/// Envelope returned by the monitor API
#[derive(Debug, Deserialize)]
struct QuotaEnvelope {
    code: Option<i64>,
    msg: Option<String>,
    success: Option<bool>,
    data: Option<QuotaData>,
}

#[derive(Debug, Deserialize)]
struct QuotaData {
    limits: Option<Vec<QuotaLimit>>,
    level: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuotaLimit {
    #[serde(rename = "type")]
    kind: String,
    unit: Option<i64>,
    number: Option<i64>,
    /// Quota size
    #[serde(default, deserialize_with = "deserialize_number_opt")]
    usage: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_number_opt")]
    current_value: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_number_opt")]
    remaining: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_number_opt")]
    percentage: Option<f64>,
    next_reset_time: Option<i64>,
    #[serde(default)]
    usage_details: Vec<UsageDetailResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageDetailResponse {
    model_code: String,
    #[serde(default, deserialize_with = "deserialize_number_opt")]
    usage: Option<f64>,
}

/// A limit entry reduced to the shared used/limit shape.
struct Normalized {
    used: f64,
    limit: f64,
    remaining: Option<f64>,
}

impl QuotaLimit {
    /// Time quotas report absolute counts; token quotas usually only a
    /// percentage, which becomes used/100.
    fn normalize(&self) -> Result<Normalized, ProviderError> {
        if let (Some(limit), Some(used)) = (self.usage, self.current_value) {
            return Ok(Normalized {
                used: non_negative(used, "currentValue")?,
                limit,
                remaining: self.remaining.or(Some(limit - used)),
            });
        }

        let percentage = self.percentage.ok_or_else(|| {
            ProviderError::parse(format!(
                "{} entry has neither usage/currentValue nor percentage",
                self.kind
            ))
        })?;
        Ok(Normalized {
            used: non_negative(percentage, "percentage")?,
            limit: 100.0,
            remaining: Some(100.0 - percentage),
        })
    }

    fn window(&self) -> String {
        match (self.number, self.unit) {
            (Some(number), Some(unit)) => format!("{} {}", number, unit_name(unit)),
            _ if self.kind == TOKENS_LIMIT => "total".to_string(),
            _ => self.kind.to_lowercase(),
        }
    }

    fn reset_time(&self) -> Option<DateTime<Utc>> {
        self.next_reset_time.and_then(parse_reset_time)
    }

    /// Entries other than the primary are informational; one that cannot be
    /// normalised is logged and dropped.
    fn to_detail(&self) -> Option<LimitDetail> {
        let normalized = match self.normalize() {
            Ok(normalized) => normalized,
            Err(err) => {
                warn!(kind = %self.kind, error = %err, "Skipping malformed BigModel limit");
                return None;
            }
        };
        let mut detail = LimitDetail::new(self.window(), normalized.used, normalized.limit);
        detail.remaining = normalized.remaining;
        detail.reset_time = self.reset_time();
        detail.usage_details = self
            .usage_details
            .iter()
            .map(|d| UsageDetail {
                model_code: d.model_code.clone(),
                usage: d.usage.unwrap_or(0.0),
            })
            .collect();
        Some(detail)
    }
}

fn unit_name(unit: i64) -> String {
    match unit {
        1 => "second".to_string(),
        2 => "minute".to_string(),
        3 => "hour".to_string(),
        4 => "day".to_string(),
        5 => "month".to_string(),
        6 => "year".to_string(),
        other => format!("unit_{}", other),
    }
}

/// `nextResetTime` is epoch milliseconds; zero means unknown.
fn parse_reset_time(timestamp_ms: i64) -> Option<DateTime<Utc>> {
    if timestamp_ms <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(timestamp_ms).single()
}

/// 智谱 BigModel coding plan (access key)
pub struct BigModelProvider {
    http: HttpClient,
    url: String,
}

impl BigModelProvider {
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
}

#[async_trait]
impl Provider for BigModelProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn authenticate(&self, credential: &Credential) -> Result<AuthContext, ProviderError> {
        AuthContext::bearer(credential)
    }

    #[instrument(skip_all, fields(provider = NAME))]
    async fn fetch_usage(&self, auth: &AuthContext) -> Result<Vec<u8>, ProviderError> {
        debug!(url = %self.url, "Fetching BigModel quota");
        self.http.get(&self.url, auth.headers().clone()).await
    }

    fn parse_usage(&self, raw: &[u8]) -> Result<UsageInfo, ProviderError> {
        let envelope: QuotaEnvelope = serde_json::from_slice(raw)?;

        if envelope.success == Some(false) {
            let status = envelope
                .code
                .and_then(|c| u16::try_from(c).ok())
                .unwrap_or(200);
            warn!(status, "BigModel reported an unsuccessful response");
            return Err(ProviderError::Api {
                status,
                body: envelope.msg.unwrap_or_default(),
            });
        }

        let data = envelope
            .data
            .ok_or_else(|| ProviderError::parse("missing required field `data`"))?;
        let limits = data
            .limits
            .ok_or_else(|| ProviderError::parse("missing required field `data.limits`"))?;

        let primary = limits
            .iter()
            .find(|l| l.kind == TOKENS_LIMIT)
            .or_else(|| limits.iter().find(|l| l.kind == TIME_LIMIT))
            .ok_or_else(|| {
                ProviderError::parse("no TOKENS_LIMIT or TIME_LIMIT entry in `data.limits`")
            })?;

        let normalized = primary.normalize()?;
        let details = limits.iter().filter_map(QuotaLimit::to_detail).collect();

        Ok(UsageInfo::new(NAME, normalized.used, normalized.limit)
            .with_remaining(normalized.remaining)
            .with_reset_time(primary.reset_time())
            .with_membership_level(data.level)
            .with_limits(details)
            .with_extra("quota_type", primary.kind.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::test_server;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn sample() -> Value {
        json!({
            "code": 200,
            "msg": "操作成功",
            "data": {
                "limits": [
                    {
                        "type": "TOKENS_LIMIT",
                        "unit": 3,
                        "number": 5,
                        "percentage": 42,
                        "nextResetTime": 1769776934422_i64
                    },
                    {
                        "type": "TIME_LIMIT",
                        "unit": 5,
                        "number": 1,
                        "usage": 100,
                        "currentValue": 92,
                        "remaining": 8,
                        "percentage": 92,
                        "nextResetTime": 1769776934422_i64,
                        "usageDetails": [
                            {"modelCode": "search-prime", "usage": 83},
                            {"modelCode": "web-reader", "usage": 9},
                            {"modelCode": "zread", "usage": 0}
                        ]
                    }
                ],
                "level": "lite"
            },
            "success": true
        })
    }

    fn provider() -> BigModelProvider {
        BigModelProvider::new(HttpClient::new().unwrap())
    }

    fn parse(value: &Value) -> Result<UsageInfo, ProviderError> {
        provider().parse_usage(value.to_string().as_bytes())
    }

    fn reset() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 30, 12, 42, 14).unwrap() + chrono::Duration::milliseconds(422)
    }

    #[test]
    fn test_authenticate() {
        let auth = provider()
            .authenticate(&Credential::new("test-access-key"))
            .unwrap();
        assert_eq!(auth.headers()["authorization"], "Bearer test-access-key");
        assert_eq!(auth.headers()["content-type"], "application/json");
    }

    #[test]
    fn test_parse_usage() {
        let usage = parse(&sample()).unwrap();

        assert_eq!(usage.provider(), "bigmodel");
        assert_eq!(usage.user_id(), None);
        assert_eq!(usage.membership_level(), Some("lite"));

        // Token quota only reports a percentage
        assert_eq!(usage.used(), 42.0);
        assert_eq!(usage.limit(), Some(100.0));
        assert_eq!(usage.remaining(), Some(58.0));
        assert_eq!(usage.rounded_percent(), Some(42));
        assert_eq!(usage.reset_time(), Some(reset()));
        assert_eq!(usage.extra()["quota_type"], "TOKENS_LIMIT");

        assert_eq!(usage.limits().len(), 2);

        let tokens = &usage.limits()[0];
        assert_eq!(tokens.window, "5 hour");
        assert_eq!(tokens.used, 42.0);
        assert_eq!(tokens.limit, Some(100.0));
        assert_eq!(tokens.remaining, Some(58.0));
        assert_eq!(tokens.reset_time, Some(reset()));

        let time = &usage.limits()[1];
        assert_eq!(time.window, "1 month");
        assert_eq!(time.used, 92.0);
        assert_eq!(time.limit, Some(100.0));
        assert_eq!(time.remaining, Some(8.0));
        assert_eq!(
            time.usage_details,
            vec![
                UsageDetail {
                    model_code: "search-prime".to_string(),
                    usage: 83.0
                },
                UsageDetail {
                    model_code: "web-reader".to_string(),
                    usage: 9.0
                },
                UsageDetail {
                    model_code: "zread".to_string(),
                    usage: 0.0
                },
            ]
        );
    }

    #[test]
    fn test_time_limit_used_when_no_token_quota() {
        let mut value = sample();
        value["data"]["limits"].as_array_mut().unwrap().remove(0);

        let usage = parse(&value).unwrap();
        assert_eq!(usage.used(), 92.0);
        assert_eq!(usage.limit(), Some(100.0));
        assert_eq!(usage.rounded_percent(), Some(92));
        assert_eq!(usage.extra()["quota_type"], "TIME_LIMIT");
    }

    #[test]
    fn test_absolute_quota_percent() {
        let value = json!({
            "success": true,
            "data": {"limits": [
                {"type": "TOKENS_LIMIT", "usage": 2000000, "currentValue": 900000}
            ]}
        });
        let usage = parse(&value).unwrap();
        assert_eq!(usage.rounded_percent(), Some(45));
        assert_eq!(usage.remaining(), Some(1_100_000.0));
        assert_eq!(usage.limits()[0].window, "total");
    }

    #[test]
    fn test_missing_required_fields() {
        let mut cases = Vec::new();

        let mut value = sample();
        value.as_object_mut().unwrap().remove("data");
        cases.push(value);

        let mut value = sample();
        value["data"].as_object_mut().unwrap().remove("limits");
        cases.push(value);

        let mut value = sample();
        value["data"]["limits"] = json!([]);
        cases.push(value);

        let mut value = sample();
        value["data"]["limits"][0]
            .as_object_mut()
            .unwrap()
            .remove("percentage");
        cases.push(value);

        let mut value = sample();
        value["data"]["limits"][0].as_object_mut().unwrap().remove("type");
        cases.push(value);

        for value in cases {
            let err = parse(&value).unwrap_err();
            assert!(
                matches!(err, ProviderError::Parse { .. }),
                "expected parse error for {}, got {:?}",
                value,
                err
            );
        }
    }

    #[test]
    fn test_wrong_types() {
        let mut value = sample();
        value["data"]["limits"][0]["percentage"] = json!("many");
        assert_eq!(parse(&value).unwrap_err().kind(), "parse_error");

        let mut value = sample();
        value["data"]["limits"] = json!({"type": "TOKENS_LIMIT"});
        assert_eq!(parse(&value).unwrap_err().kind(), "parse_error");
    }

    #[test]
    fn test_rejects_impossible_numbers() {
        for limit in [
            json!({"type": "TOKENS_LIMIT", "percentage": -5}),
            json!({"type": "TOKENS_LIMIT", "percentage": "NaN"}),
            json!({"type": "TOKENS_LIMIT", "percentage": "inf"}),
            json!({"type": "TIME_LIMIT", "usage": 100, "currentValue": -1}),
            json!({"type": "TIME_LIMIT", "usage": "-inf", "currentValue": 1}),
        ] {
            let value = json!({"success": true, "data": {"limits": [limit]}});
            assert_eq!(parse(&value).unwrap_err().kind(), "parse_error", "{}", value);
        }
    }

    #[test]
    fn test_unknown_limit_does_not_hide_primary() {
        let mut value = sample();
        let limits = value["data"]["limits"].as_array_mut().unwrap();
        limits.push(json!({"type": "MCP_LIMIT", "unit": 5, "number": 1}));
        limits.push(json!({"type": "TIME_LIMIT", "usage": 10, "currentValue": -3}));

        let usage = parse(&value).unwrap();
        assert_eq!(usage.rounded_percent(), Some(42));
        assert_eq!(usage.extra()["quota_type"], "TOKENS_LIMIT");
        let windows: Vec<&str> = usage.limits().iter().map(|l| l.window.as_str()).collect();
        assert_eq!(windows, vec!["5 hour", "1 month"]);
    }

    #[test]
    fn test_unsuccessful_envelope() {
        let value = json!({"code": 401, "msg": "令牌已过期", "success": false});
        let err = parse(&value).unwrap_err();
        assert_eq!(
            err,
            ProviderError::Api {
                status: 401,
                body: "令牌已过期".to_string()
            }
        );
    }

    #[test]
    fn test_unit_name() {
        assert_eq!(unit_name(1), "second");
        assert_eq!(unit_name(2), "minute");
        assert_eq!(unit_name(3), "hour");
        assert_eq!(unit_name(4), "day");
        assert_eq!(unit_name(5), "month");
        assert_eq!(unit_name(6), "year");
        assert_eq!(unit_name(99), "unit_99");
    }

    #[test]
    fn test_parse_reset_time() {
        assert_eq!(parse_reset_time(1769776934422), Some(reset()));
        assert_eq!(parse_reset_time(0), None);
    }

    #[tokio::test]
    async fn test_fetch_usage_round_trip() {
        let body = r#"{"success": true, "data": {"limits": [{"type": "TOKENS_LIMIT", "percentage": 45}]}}"#;
        let (url, mut requests) = test_server::serve(200, body).await;
        let provider = BigModelProvider::with_url(
            HttpClient::new().unwrap(),
            format!("{}/api/monitor/usage/quota/limit", url),
        );

        let auth = provider.authenticate(&Credential::new("b1")).unwrap();
        let raw = provider.fetch_usage(&auth).await.unwrap();
        assert_eq!(provider.parse_usage(&raw).unwrap().rounded_percent(), Some(45));

        let request = requests.recv().await.unwrap().to_lowercase();
        assert!(request.starts_with("get /api/monitor/usage/quota/limit"));
        assert!(request.contains("authorization: bearer b1"));
    }
}
