//! Runs probes across many endpoints.
//!
//! Two modes share the same batching:
//!
//! - **race**: batches of `concurrency` endpoints; the first success in a
//!   batch cancels its in-flight siblings and becomes the sticky preferred
//!   endpoint. Later batches only start if the current one produced no winner.
//! - **sweep**: every endpoint runs to completion, chunk by chunk. Chunk
//!   `N + 1` never starts before chunk `N` has fully settled.
//!
//! Every settled probe is folded into the [`HealthLedger`]; probes cut short
//! by cancellation are not recorded.

use std::sync::Arc;

use cidgate_types::{Endpoint, ProbeResult, Region};
use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::GatewayClient;
use crate::config::OrchestratorConfig;
use crate::ledger::HealthLedger;

/// Result of a race.
#[derive(Debug, Clone, Default)]
pub struct RaceOutcome {
    /// First endpoint to answer successfully, if any.
    pub winner: Option<ProbeResult>,
    /// Every probe that settled, in completion order.
    pub results: Vec<ProbeResult>,
}

#[derive(Clone)]
pub struct ProbeOrchestrator {
    client: Arc<dyn GatewayClient>,
    ledger: HealthLedger,
    config: OrchestratorConfig,
    /// URL of the last race winner.
    preferred: Arc<RwLock<Option<String>>>,
}

impl std::fmt::Debug for ProbeOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProbeOrchestrator {
    pub fn new(
        client: Arc<dyn GatewayClient>,
        ledger: HealthLedger,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            client,
            ledger,
            config,
            preferred: Arc::new(RwLock::new(None)),
        }
    }

    pub fn ledger(&self) -> &HealthLedger {
        &self.ledger
    }

    pub fn client(&self) -> &Arc<dyn GatewayClient> {
        &self.client
    }

    pub fn probe_cid(&self) -> &str {
        &self.config.probe_cid
    }

    pub async fn preferred(&self) -> Option<String> {
        self.preferred.read().await.clone()
    }

    pub async fn clear_preferred(&self) {
        *self.preferred.write().await = None;
    }

    fn batch_size(&self) -> usize {
        self.config.concurrency.max(1)
    }

    /// `endpoints` with the sticky preferred endpoint moved to the front.
    async fn preferred_first(&self, endpoints: &[Endpoint]) -> Vec<Endpoint> {
        let mut ordered = endpoints.to_vec();
        if let Some(url) = self.preferred().await
            && let Some(idx) = ordered.iter().position(|e| e.url == url)
        {
            let ep = ordered.remove(idx);
            ordered.insert(0, ep);
        }
        ordered
    }

    async fn record(
        &self,
        endpoint: &Endpoint,
        mut result: ProbeResult,
        preference: Region,
    ) -> ProbeResult {
        let record = self.ledger.update(endpoint, &result, preference).await;
        result.health_score = record.health_score;
        if !result.available {
            let mut preferred = self.preferred.write().await;
            if preferred.as_deref() == Some(endpoint.url.as_str()) {
                debug!(url = %endpoint.url, "preferred endpoint failed; dropping preference");
                *preferred = None;
            }
        }
        result
    }

    /// Probe batches until one endpoint answers.
    pub async fn race(
        &self,
        endpoints: &[Endpoint],
        cid: &str,
        preference: Region,
        cancel: &CancellationToken,
    ) -> RaceOutcome {
        let ordered = self.preferred_first(endpoints).await;
        let mut outcome = RaceOutcome::default();

        for (batch_index, batch) in ordered.chunks(self.batch_size()).enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            let race_token = cancel.child_token();
            let mut in_flight: FuturesUnordered<_> = batch
                .iter()
                .map(|ep| {
                    let token = race_token.clone();
                    async move { (ep, self.client.probe(ep, cid, &token).await) }
                })
                .collect();

            while let Some((ep, settled)) = in_flight.next().await {
                let Some(result) = settled else {
                    continue;
                };
                let result = self.record(ep, result, preference).await;
                if result.available && outcome.winner.is_none() {
                    race_token.cancel();
                    outcome.winner = Some(result.clone());
                }
                outcome.results.push(result);
            }

            if let Some(winner) = &outcome.winner {
                *self.preferred.write().await = Some(winner.url.clone());
                info!(
                    url = %winner.url,
                    latency_ms = winner.latency_ms,
                    batch = batch_index,
                    "race won"
                );
                return outcome;
            }
        }

        info!(tried = outcome.results.len(), "race found no available endpoint");
        outcome
    }

    /// Probe every endpoint to completion in bounded chunks.
    ///
    /// Results come back in input order; cancelled probes are omitted.
    pub async fn sweep(
        &self,
        endpoints: &[Endpoint],
        cid: &str,
        preference: Region,
        cancel: &CancellationToken,
    ) -> Vec<ProbeResult> {
        let mut results = Vec::with_capacity(endpoints.len());
        for chunk in endpoints.chunks(self.batch_size()) {
            if cancel.is_cancelled() {
                break;
            }
            let settled = join_all(
                chunk
                    .iter()
                    .map(|ep| async move { (ep, self.client.probe(ep, cid, cancel).await) }),
            )
            .await;
            for (ep, result) in settled {
                if let Some(result) = result {
                    results.push(self.record(ep, result, preference).await);
                }
            }
        }

        let available = results.iter().filter(|r| r.available).count();
        info!(total = endpoints.len(), probed = results.len(), available, "sweep complete");
        results
    }
}
