//! Embedding client.
//!
//! Issues batched embedding requests to an external HTTP provider and
//! exposes them as a synchronous `embed_batch` call so the rest of the
//! pipeline (which runs on rayon/worker threads, not async tasks) never
//! has to be async-aware. The client owns a small internal tokio runtime
//! to drive the HTTP calls; callers on the daemon's async side wrap the
//! call in `spawn_blocking`.
//!
//! Never performs proactive client-side throttling: requests go out at
//! full speed, and backoff only kicks in once the provider signals 429 or
//! a transient 5xx.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("embedding service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("retry limit reached after {attempts} attempts, last status {status:?}")]
    RetryLimit { attempts: u32, status: Option<u16> },
}

impl EmbedError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EmbedError::RateLimited { .. } | EmbedError::ServiceUnavailable(_)
        )
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDatum>,
}

#[derive(Deserialize)]
struct EmbedDatum {
    embedding: Vec<f32>,
}

/// Exponential backoff with base `retry_base_secs`, factor 2, capped at
/// 120s. Mirrors `chat_completions::backoff` in shape: attempts are
/// 1-indexed, so `attempt == 1` gives the base delay.
fn backoff(attempt: u32, retry_base_secs: u64) -> Duration {
    let secs = retry_base_secs.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
    Duration::from_secs(secs.min(120))
}

pub struct EmbeddingClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    max_retries: u32,
    retry_base_secs: u64,
    dimension: usize,
    runtime: tokio::runtime::Runtime,
}

impl EmbeddingClient {
    pub fn new(config: &AppConfig, dimension: usize) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.embedding_timeout_secs))
            .build()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;

        Ok(Self {
            http,
            endpoint: config.embedding_endpoint.clone(),
            api_key: config.embedding_api_key.clone(),
            model: config.embedding_model.clone(),
            max_retries: config.embedding_max_retries,
            retry_base_secs: config.embedding_retry_base_secs,
            dimension,
            runtime,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embeds a batch of texts, preserving input order. A single-item
    /// request is just a batch of one — no separate code path.
    pub fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.runtime.block_on(self.embed_batch_async(texts))
    }

    pub fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let texts = vec![text.to_string()];
        let mut out = self.embed_batch(&texts)?;
        out.pop().ok_or_else(|| EmbedError::ServiceUnavailable("empty response".to_string()))
    }

    async fn embed_batch_async(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;

            let mut req = self
                .http
                .post(&self.endpoint)
                .json(&EmbedRequest { texts, model: &self.model });
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }

            let res = req.send().await;

            match res {
                Ok(resp) if resp.status().is_success() => {
                    let body: EmbedResponse = resp
                        .json()
                        .await
                        .map_err(|e| EmbedError::ServiceUnavailable(e.to_string()))?;
                    let vectors: Vec<Vec<f32>> =
                        body.data.into_iter().map(|d| d.embedding).collect();
                    for v in &vectors {
                        if v.len() != self.dimension {
                            return Err(EmbedError::DimensionMismatch {
                                expected: self.dimension,
                                actual: v.len(),
                            });
                        }
                    }
                    return Ok(vectors);
                }
                Ok(resp) => {
                    let status = resp.status();
                    if status == reqwest::StatusCode::UNAUTHORIZED
                        || status == reqwest::StatusCode::FORBIDDEN
                    {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(EmbedError::AuthFailed(body));
                    }
                    if status == reqwest::StatusCode::BAD_REQUEST {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(EmbedError::InvalidInput(body));
                    }
                    let retryable =
                        status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if !retryable {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(EmbedError::ServiceUnavailable(format!(
                            "{}: {}",
                            status, body
                        )));
                    }

                    if attempt > self.max_retries {
                        return Err(EmbedError::RetryLimit {
                            attempts: attempt,
                            status: Some(status.as_u16()),
                        });
                    }

                    let retry_after_secs = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok());

                    let delay = match retry_after_secs {
                        Some(secs) => Duration::from_secs(secs.min(120)),
                        None => backoff(attempt, self.retry_base_secs),
                    };
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if attempt > self.max_retries {
                        return Err(EmbedError::ConnectionFailed(e.to_string()));
                    }
                    let delay = backoff(attempt, self.retry_base_secs);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff(1, 1), Duration::from_secs(1));
        assert_eq!(backoff(2, 1), Duration::from_secs(2));
        assert_eq!(backoff(3, 1), Duration::from_secs(4));
        assert_eq!(backoff(20, 1), Duration::from_secs(120));
    }

    #[test]
    fn test_backoff_respects_base() {
        assert_eq!(backoff(1, 5), Duration::from_secs(5));
        assert_eq!(backoff(2, 5), Duration::from_secs(10));
    }

    #[test]
    fn test_is_retryable() {
        assert!(EmbedError::RateLimited { retry_after_secs: 2 }.is_retryable());
        assert!(EmbedError::ServiceUnavailable("x".into()).is_retryable());
        assert!(!EmbedError::AuthFailed("x".into()).is_retryable());
        assert!(!EmbedError::DimensionMismatch { expected: 1, actual: 2 }.is_retryable());
    }
}
