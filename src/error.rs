use serde::Serialize;
use thiserror::Error;

/// Failure of a single provider's authenticate/fetch/parse pipeline.
///
/// Every variant is scoped to one provider entry; none of them aborts a run.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind")]
pub enum ProviderError {
    /// Credential missing or malformed, or provider name not recognized.
    #[serde(rename = "config_error")]
    #[error("{message}")]
    Config { message: String },

    /// Connection failure, DNS failure or timeout.
    #[serde(rename = "network_error")]
    #[error("{message}")]
    Network { message: String },

    /// Vendor answered with a non-success status.
    #[serde(rename = "api_error")]
    #[error("HTTP {status}: {body}")]
    Api { status: u16, body: String },

    /// Response did not have the expected shape.
    #[serde(rename = "parse_error")]
    #[error("{message}")]
    Parse { message: String },
}

impl ProviderError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Stable identifier used by the renderers.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Config { .. } => "config_error",
            ProviderError::Network { .. } => "network_error",
            ProviderError::Api { .. } => "api_error",
            ProviderError::Parse { .. } => "parse_error",
        }
    }

    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Network { .. })
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            format!("request timed out: {}", err)
        } else if err.is_connect() {
            format!("connection failed: {}", err)
        } else {
            format!("request failed: {}", err)
        };
        ProviderError::network(message)
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Parse {
            message: format!("invalid usage response: {}", err),
        }
    }
}
