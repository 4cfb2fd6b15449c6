//! Best-effort propagation warm-up.
//!
//! A fixed pool of workers drains a shared queue of target endpoints, each
//! issuing one small ranged request. Individual failures only show up in
//! the returned [`WarmSummary`].

use std::collections::VecDeque;
use std::sync::Arc;

use cidgate_types::{Endpoint, WarmResult, WarmSummary};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::GatewayClient;
use crate::config::WarmConfig;

#[derive(Clone)]
pub struct PropagationWarmer {
    client: Arc<dyn GatewayClient>,
    config: WarmConfig,
}

impl std::fmt::Debug for PropagationWarmer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagationWarmer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PropagationWarmer {
    pub fn new(client: Arc<dyn GatewayClient>, config: WarmConfig) -> Self {
        Self { client, config }
    }

    /// Warm `cid` on up to `max_targets` of `targets`, in order.
    pub async fn warm(
        &self,
        cid: &str,
        mut targets: Vec<Endpoint>,
        cancel: &CancellationToken,
    ) -> WarmSummary {
        let start = Instant::now();
        targets.truncate(self.config.max_targets);
        let workers = self.config.concurrency.max(1).min(targets.len());
        let queue = Arc::new(Mutex::new(VecDeque::from(targets)));

        let handles: Vec<JoinHandle<Vec<WarmResult>>> = (0..workers)
            .map(|worker| {
                let queue = Arc::clone(&queue);
                let client = Arc::clone(&self.client);
                let cid = cid.to_owned();
                let timeout = self.config.timeout;
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut results = Vec::new();
                    loop {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let Some(endpoint) = queue.lock().await.pop_front() else {
                            break;
                        };
                        let result = client.warm(&endpoint, &cid, timeout, &cancel).await;
                        debug!(
                            worker,
                            url = %result.url,
                            success = result.success,
                            cache_hit = result.cache_hit,
                            "warm request settled"
                        );
                        results.push(result);
                    }
                    results
                })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(batch) => results.extend(batch),
                Err(e) => warn!(error = %e, "warm worker terminated abnormally"),
            }
        }

        let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        let summary = WarmSummary::from_results(cid, results, elapsed_ms);
        info!(
            cid = %summary.cid,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            cached = summary.cached,
            elapsed_ms,
            "propagation warm-up finished"
        );
        summary
    }

    /// Start a warm-up in the background and return immediately.
    pub fn spawn(
        &self,
        cid: String,
        targets: Vec<Endpoint>,
        cancel: CancellationToken,
    ) -> JoinHandle<WarmSummary> {
        let warmer = self.clone();
        tokio::spawn(async move { warmer.warm(&cid, targets, &cancel).await })
    }
}
