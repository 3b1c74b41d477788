//! Retry and Error Recovery
//!
//! Wraps a provider with exponential backoff. Only retryable
//! [`ProviderFailure`]s are retried; `AuthFailure` and every non-provider
//! error go straight back to the caller.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{AgentError, Result};
use crate::message::Message;
use crate::provider::{GenerationOptions, LlmProvider, ModelInfo, ProviderResult};
use crate::tool::ToolSchema;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (default 3).
    pub max_retries: u32,
    /// Delay before the first retry (default 1s).
    pub base_delay: Duration,
    /// Upper bound for any single delay (default 30s).
    pub max_delay: Duration,
    /// Backoff multiplier (default 2.0).
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Provider decorator retrying transient failures
pub struct RetryProvider<P> {
    inner: P,
    policy: RetryPolicy,
}

impl<P: LlmProvider> RetryProvider<P> {
    pub const fn new(inner: P, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub const fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: LlmProvider> LlmProvider for RetryProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn health_check(&self) -> Result<bool> {
        self.inner.health_check().await
    }

    async fn send(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        options: &GenerationOptions,
    ) -> Result<ProviderResult> {
        let mut attempt = 0;

        loop {
            match self.inner.send(messages, tools, options).await {
                Ok(result) => return Ok(result),
                Err(AgentError::Provider(failure)) if failure.is_retryable() => {
                    if attempt >= self.policy.max_retries {
                        tracing::warn!(
                            provider = self.inner.name(),
                            attempts = attempt + 1,
                            "max retries exceeded"
                        );
                        return Err(AgentError::Provider(failure));
                    }

                    let delay = self.policy.delay_for_attempt(attempt);
                    tracing::warn!(
                        provider = self.inner.name(),
                        attempt = attempt + 1,
                        max = self.policy.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        err = %failure,
                        "retrying after error"
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        self.inner.list_models().await
    }
}
