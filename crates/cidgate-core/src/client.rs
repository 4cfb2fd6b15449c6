//! Gateway HTTP client: availability probes, warm-up requests and full
//! content digests.
//!
//! Every request is raced against a timer and the caller's cancellation
//! token, so no network call can outlive its budget.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cidgate_types::{Endpoint, ErrorType, ProbeResult, WarmResult};
use reqwest::header::{HeaderMap, RANGE};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ProbeConfig;
use crate::error::GatewayError;

/// Network operations the engine performs against one endpoint.
#[async_trait]
pub trait GatewayClient: Send + Sync + 'static {
    /// Check whether `cid` is available on `endpoint`.
    ///
    /// Returns `None` only when `cancel` fired before an outcome was known.
    async fn probe(
        &self,
        endpoint: &Endpoint,
        cid: &str,
        cancel: &CancellationToken,
    ) -> Option<ProbeResult>;

    /// Issue a small ranged request to encourage the gateway to fetch and
    /// cache `cid`.
    async fn warm(
        &self,
        endpoint: &Endpoint,
        cid: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> WarmResult;

    /// Download the full object and return its lowercase hex SHA-256.
    async fn fetch_sha256(
        &self,
        endpoint: &Endpoint,
        cid: &str,
        cancel: &CancellationToken,
    ) -> Result<String, GatewayError>;
}

/// Statuses worth retrying: the gateway's own upstream timed out or is overloaded.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 502 | 503 | 504 | 522 | 524)
}

/// Statuses that say nothing about the object, only about the HEAD method.
fn is_ambiguous_status(status: u16) -> bool {
    matches!(status, 405 | 501)
}

enum Raced<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

async fn race<F, T>(fut: F, timeout: Duration, cancel: &CancellationToken) -> Raced<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Raced::Cancelled,
        _ = tokio::time::sleep(timeout) => Raced::TimedOut,
        out = fut => Raced::Done(out),
    }
}

fn classify(err: &reqwest::Error) -> ErrorType {
    if err.is_timeout() {
        ErrorType::Timeout
    } else {
        ErrorType::Network
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Whether the response came out of the gateway's edge cache.
pub fn is_cache_hit(headers: &HeaderMap) -> bool {
    let header_says_hit = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_uppercase().contains("HIT"))
    };
    let aged = headers
        .get("age")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .is_some_and(|age| age > 0);
    header_says_hit("x-cache") || header_says_hit("cf-cache-status") || aged
}

/// [`GatewayClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpGatewayClient {
    config: ProbeConfig,
    client: Client,
}

impl HttpGatewayClient {
    pub fn new(config: ProbeConfig) -> Result<Self, GatewayError> {
        let client = Client::builder().user_agent(config.user_agent.clone()).build()?;
        Ok(Self { config, client })
    }

    fn result(&self, endpoint: &Endpoint, status: u16, latency_ms: u64) -> ProbeResult {
        ProbeResult {
            url: endpoint.url.clone(),
            name: endpoint.name.clone(),
            available: true,
            latency_ms: Some(latency_ms),
            error_type: ErrorType::None,
            status_code: Some(status),
            health_score: 0,
        }
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn probe(
        &self,
        endpoint: &Endpoint,
        cid: &str,
        cancel: &CancellationToken,
    ) -> Option<ProbeResult> {
        let url = endpoint.object_url(cid);
        let timeout = self.config.timeout;
        let mut attempt = 0u32;

        loop {
            let start = Instant::now();
            let mut status = match race(self.client.head(&url).send(), timeout, cancel).await {
                Raced::Cancelled => return None,
                Raced::TimedOut => {
                    return Some(ProbeResult::unavailable(
                        &endpoint.url,
                        &endpoint.name,
                        ErrorType::Timeout,
                        None,
                    ));
                }
                Raced::Done(Err(e)) => {
                    debug!(url = %url, error = %e, "HEAD probe failed");
                    return Some(ProbeResult::unavailable(
                        &endpoint.url,
                        &endpoint.name,
                        classify(&e),
                        None,
                    ));
                }
                Raced::Done(Ok(resp)) => resp.status(),
            };

            if is_ambiguous_status(status.as_u16()) && self.config.range_fallback {
                let ranged = self.client.get(&url).header(RANGE, "bytes=0-0").send();
                status = match race(ranged, timeout, cancel).await {
                    Raced::Cancelled => return None,
                    Raced::TimedOut => {
                        return Some(ProbeResult::unavailable(
                            &endpoint.url,
                            &endpoint.name,
                            ErrorType::Timeout,
                            Some(status.as_u16()),
                        ));
                    }
                    Raced::Done(Err(e)) => {
                        debug!(url = %url, error = %e, "ranged probe failed");
                        return Some(ProbeResult::unavailable(
                            &endpoint.url,
                            &endpoint.name,
                            classify(&e),
                            Some(status.as_u16()),
                        ));
                    }
                    Raced::Done(Ok(resp)) => resp.status(),
                };
            }

            let latency_ms = elapsed_ms(start);
            if status.is_success() || status == StatusCode::PARTIAL_CONTENT {
                return Some(self.result(endpoint, status.as_u16(), latency_ms));
            }

            if is_transient_status(status.as_u16()) && attempt < self.config.retry_count {
                attempt += 1;
                debug!(
                    url = %url,
                    status = status.as_u16(),
                    attempt,
                    "transient gateway status; retrying"
                );
                match race(std::future::pending::<()>(), self.config.retry_delay, cancel).await {
                    Raced::Cancelled => return None,
                    _ => continue,
                }
            }

            return Some(ProbeResult::unavailable(
                &endpoint.url,
                &endpoint.name,
                ErrorType::Server,
                Some(status.as_u16()),
            ));
        }
    }

    async fn warm(
        &self,
        endpoint: &Endpoint,
        cid: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> WarmResult {
        let url = endpoint.object_url(cid);
        let start = Instant::now();
        let request = self.client.get(&url).header(RANGE, "bytes=0-0").send();
        let mut result = WarmResult {
            url: endpoint.url.clone(),
            success: false,
            cache_hit: false,
            latency_ms: None,
            status_code: None,
        };
        if let Raced::Done(Ok(resp)) = race(request, timeout, cancel).await {
            let status = resp.status();
            result.latency_ms = Some(elapsed_ms(start));
            result.status_code = Some(status.as_u16());
            result.success = status.is_success();
            result.cache_hit = is_cache_hit(resp.headers());
        }
        result
    }

    async fn fetch_sha256(
        &self,
        endpoint: &Endpoint,
        cid: &str,
        cancel: &CancellationToken,
    ) -> Result<String, GatewayError> {
        let url = endpoint.object_url(cid);
        let download = async {
            let mut resp = self.client.get(&url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(GatewayError::BadStatus {
                    url: url.clone(),
                    status: status.as_u16(),
                });
            }
            let mut hasher = Sha256::new();
            while let Some(chunk) = resp.chunk().await? {
                hasher.update(&chunk);
            }
            Ok::<_, GatewayError>(hex::encode(&hasher.finalize()[..]))
        };
        match race(download, self.config.content_timeout, cancel).await {
            Raced::Done(out) => out,
            Raced::TimedOut => Err(GatewayError::Timeout),
            Raced::Cancelled => Err(GatewayError::Cancelled),
        }
    }
}
