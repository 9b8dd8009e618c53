use ragpipe_core::{Error, SearchProvider, SearchQuery, SearchResult};
use std::sync::Arc;
use std::time::Duration;

/// Retry knobs for one provider call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (minimum 1).
    pub max_attempts: u32,
    /// Sleep before the second attempt; doubles per attempt when `exponential`.
    pub backoff_ms: u64,
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 250,
            exponential: true,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let mult = if self.exponential {
            1u64 << attempt.min(16)
        } else {
            1
        };
        Duration::from_millis(self.backoff_ms.saturating_mul(mult))
    }
}

/// Terminal outcome of a retried search. Never an error: exhaustion
/// degrades to an empty result list with the failure recorded.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    pub provider: String,
    pub attempts: u32,
    pub failed: bool,
    pub error: Option<String>,
}

impl SearchOutcome {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

fn is_retryable(e: &Error) -> bool {
    matches!(e, Error::Search(_) | Error::Fetch(_))
}

/// A provider plus retry policy. Failures never escape as errors; callers
/// treat an empty outcome as "no evidence found" and keep going.
pub struct SearchClient {
    provider: Arc<dyn SearchProvider>,
    policy: RetryPolicy,
}

impl SearchClient {
    pub fn new(provider: Arc<dyn SearchProvider>, policy: RetryPolicy) -> Self {
        Self { provider, policy }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub async fn search(&self, q: &SearchQuery) -> SearchOutcome {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_err: Option<Error> = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.policy.delay_for(attempt - 1)).await;
            }
            match self.provider.search(q).await {
                Ok(resp) => {
                    return SearchOutcome {
                        results: resp.results,
                        provider: resp.provider,
                        attempts: attempt + 1,
                        failed: false,
                        error: None,
                    };
                }
                Err(e) => {
                    let retryable = is_retryable(&e);
                    tracing::debug!(
                        provider = self.provider.name(),
                        attempt = attempt + 1,
                        retryable,
                        error = %e,
                        "search attempt failed"
                    );
                    last_err = Some(e);
                    if !retryable {
                        return self.exhausted(attempt + 1, last_err);
                    }
                }
            }
        }
        self.exhausted(max_attempts, last_err)
    }

    fn exhausted(&self, attempts: u32, last_err: Option<Error>) -> SearchOutcome {
        let error = last_err.map(|e| e.to_string());
        tracing::warn!(
            provider = self.provider.name(),
            attempts,
            error = error.as_deref().unwrap_or("unknown"),
            "search exhausted; degrading to empty results"
        );
        SearchOutcome {
            results: Vec::new(),
            provider: self.provider.name().to_string(),
            attempts,
            failed: true,
            error,
        }
    }
}
