//! Bounded, rate-limited fan-out of independent generation requests.
//!
//! Each request of a batch runs as its own tokio task. A semaphore bounds how
//! many tasks talk to the backend at once, the shared `RateLimiter` throttles
//! every attempt, and results are joined back in input order. Failures never
//! escape a batch: a request that exhausts its retries yields empty samples.

use crate::call_log::{CallLog, CallLogEntry};
use crate::llm_client::{ChatMessage, CompletionBackend, GenerationParams, LanguageModelClient};
use crate::rate_limit::RateLimiter;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, warn};

pub const DEFAULT_MAX_WORKERS: usize = 100;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Retry budget and backoff for a single request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Exponential backoff: `min(max_delay, base_delay * 2^attempt)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// The production `LanguageModelClient`.
pub struct RateLimitedDispatcher {
    backend: Arc<dyn CompletionBackend>,
    limiter: Arc<RateLimiter>,
    workers: Arc<Semaphore>,
    retry: RetryPolicy,
    call_log: Option<Arc<CallLog>>,
}

impl RateLimitedDispatcher {
    pub fn new(backend: Arc<dyn CompletionBackend>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            backend,
            limiter,
            workers: Arc::new(Semaphore::new(DEFAULT_MAX_WORKERS)),
            retry: RetryPolicy::default(),
            call_log: None,
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.workers = Arc::new(Semaphore::new(max_workers.max(1)));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_log(mut self, call_log: Option<Arc<CallLog>>) -> Self {
        self.call_log = call_log;
        self
    }
}

/// Trims every sample and pads or truncates to exactly `n` entries.
fn normalize_samples(samples: Vec<String>, n: usize) -> Vec<String> {
    let mut samples: Vec<String> = samples
        .into_iter()
        .take(n)
        .map(|s| s.trim().to_string())
        .collect();
    samples.resize(n, String::new());
    samples
}

async fn run_with_retry(
    backend: &dyn CompletionBackend,
    limiter: &RateLimiter,
    retry: RetryPolicy,
    messages: &[ChatMessage],
    params: GenerationParams,
) -> Vec<String> {
    let n = usize::from(params.sample_count);
    let attempts = retry.max_attempts.max(1);
    for attempt in 0..attempts {
        limiter.acquire().await;
        match backend.complete(messages.to_vec(), params).await {
            Ok(samples) => return normalize_samples(samples, n),
            Err(e) if !e.is_transient() => {
                error!(attempt = attempt + 1, error = %e, "Backend rejected the request; not retrying");
                return vec![String::new(); n];
            }
            Err(e) => {
                warn!(attempt = attempt + 1, max_attempts = attempts, error = %e, "Backend request failed");
                if attempt + 1 < attempts {
                    tokio::time::sleep(retry.backoff(attempt)).await;
                }
            }
        }
    }
    error!(max_attempts = attempts, "Retries exhausted; returning empty samples");
    vec![String::new(); n]
}

#[async_trait]
impl LanguageModelClient for RateLimitedDispatcher {
    async fn generate(
        &self,
        batch: Vec<Vec<ChatMessage>>,
        params: GenerationParams,
    ) -> Vec<Vec<String>> {
        let n = usize::from(params.sample_count);
        let handles: Vec<_> = batch
            .into_iter()
            .map(|messages| {
                let backend = self.backend.clone();
                let limiter = self.limiter.clone();
                let workers = self.workers.clone();
                let call_log = self.call_log.clone();
                let retry = self.retry;
                tokio::spawn(async move {
                    // The semaphore is never closed, so acquiring cannot fail.
                    let _permit = workers.acquire_owned().await.ok();
                    let output =
                        run_with_retry(backend.as_ref(), &limiter, retry, &messages, params).await;
                    if let Some(log) = call_log {
                        let entry = CallLogEntry::new(
                            &backend.model_name(),
                            &messages,
                            &output,
                            params.temperature,
                            params.max_tokens,
                            params.sample_count,
                        );
                        if let Err(e) = log.append(&entry).await {
                            warn!(error = %e, "Failed to append call log entry");
                        }
                    }
                    output
                })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    error!(error = %e, "Dispatcher worker panicked");
                    vec![String::new(); n]
                })
            })
            .collect()
    }
}
