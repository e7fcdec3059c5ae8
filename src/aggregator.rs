use crate::config::{Config, Credential};
use crate::error::ProviderError;
use crate::models::{AggregateResult, ProviderOutcome, ProviderReport, UsageInfo};
use crate::providers::{Provider, Registry};
use futures::future::join_all;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// How often a failed fetch is attempted again within one cycle.
///
/// Only retryable (network) failures are repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// One attempt, no retry.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }

    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: Duration::from_secs(1),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::single_attempt()
    }
}

/// Runs every configured provider's pipeline and collects the outcomes.
#[derive(Clone)]
pub struct Aggregator {
    registry: Registry,
    retry: RetryPolicy,
}

impl Aggregator {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Query every configured provider concurrently.
    ///
    /// The result has one entry per configured provider, in configuration
    /// order; a failing provider never affects its siblings.
    #[instrument(skip_all)]
    pub async fn run(&self, config: &Config) -> AggregateResult {
        let started = Instant::now();

        let pipelines = config
            .providers
            .iter()
            .map(|(name, provider_config)| self.run_one(name, &provider_config.api_key));
        let outcomes = join_all(pipelines).await;

        let providers: Vec<ProviderReport> = config
            .providers
            .iter()
            .zip(outcomes)
            .map(|((name, _), outcome)| ProviderReport {
                provider: name.clone(),
                outcome,
            })
            .collect();

        let result = AggregateResult::new(providers);
        info!(
            providers = result.len(),
            succeeded = result.successes().count(),
            failed = result.failures().count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Aggregation finished"
        );
        result
    }

    async fn run_one(&self, name: &str, credential: &Credential) -> ProviderOutcome {
        let Some(provider) = self.registry.get(name) else {
            warn!(provider = name, "Unknown provider in config");
            return Err(ProviderError::config(format!(
                "unknown provider: {} (known: {})",
                name,
                self.registry.names().join(", ")
            )));
        };

        let outcome = self.pipeline(provider.as_ref(), credential).await;
        match &outcome {
            Ok(usage) => debug!(provider = name, percent = ?usage.percent(), "Fetched usage"),
            Err(err) => warn!(provider = name, kind = err.kind(), error = %err, "Provider failed"),
        }
        outcome
    }

    async fn pipeline(
        &self,
        provider: &dyn Provider,
        credential: &Credential,
    ) -> Result<UsageInfo, ProviderError> {
        let auth = provider.authenticate(credential)?;

        let mut attempt = 1;
        let raw = loop {
            match provider.fetch_usage(&auth).await {
                Ok(raw) => break raw,
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    debug!(
                        provider = provider.name(),
                        attempt,
                        error = %err,
                        "Retrying fetch"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry.delay).await;
                }
                Err(err) => return Err(err),
            }
        };

        provider.parse_usage(&raw)
    }
}
