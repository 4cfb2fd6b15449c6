//! The engine's context object.
//!
//! [`GatewayService`] owns the endpoint registry, health ledger, result
//! cache, orchestrator, selector, cleanup policy and warmer, all over one
//! injected [`KvStore`]. Build it once per process and share it behind an
//! `Arc`; it also serves as the [`Verifier`] for the verification scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cidgate_types::{
    Endpoint, EndpointDescriptor, EndpointOrigin, EndpointStatus, HealthRecord, ProbeResult,
    ProbeRun, Region, WarmSummary,
};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheMiss, ResultCache, cache_version};
use crate::cleanup::{CleanupCandidate, CleanupPolicy};
use crate::client::GatewayClient;
use crate::config::EngineConfig;
use crate::error::GatewayError;
use crate::ledger::HealthLedger;
use crate::orchestrator::ProbeOrchestrator;
use crate::registry::EndpointRegistry;
use crate::selector::{Intent, Selector};
use crate::store::{self, KvStore, keys};
use crate::verify::{Verifier, VerifyOutcome};

pub struct GatewayService {
    config: EngineConfig,
    store: Arc<dyn KvStore>,
    registry: RwLock<EndpointRegistry>,
    region: RwLock<Region>,
    ledger: HealthLedger,
    cache: ResultCache,
    orchestrator: ProbeOrchestrator,
    selector: Selector,
    cleanup: CleanupPolicy,
    warmer: crate::warmer::PropagationWarmer,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for GatewayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl GatewayService {
    /// Load persisted state from `store` and assemble the engine.
    ///
    /// Missing or unreadable state falls back to defaults, so this never fails.
    pub async fn open(
        config: EngineConfig,
        store: Arc<dyn KvStore>,
        client: Arc<dyn GatewayClient>,
    ) -> Self {
        let registry = EndpointRegistry::load(store.as_ref()).await;
        let ledger = HealthLedger::load(store.as_ref()).await;
        let region = store::load_json::<Region>(store.as_ref(), keys::REGION)
            .await
            .unwrap_or_default();
        info!(
            endpoints = registry.len(),
            history = ledger.len().await,
            region = %region,
            "gateway service opened"
        );

        Self {
            cache: ResultCache::new(Arc::clone(&store), config.cache.clone()),
            orchestrator: ProbeOrchestrator::new(
                Arc::clone(&client),
                ledger.clone(),
                config.orchestrator.clone(),
            ),
            selector: Selector::new(config.warm.max_targets),
            cleanup: CleanupPolicy::new(config.cleanup.clone()),
            warmer: crate::warmer::PropagationWarmer::new(client, config.warm.clone()),
            registry: RwLock::new(registry),
            region: RwLock::new(region),
            ledger,
            store,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Catalogue ───────────────────────────────────────────────────────

    pub async fn endpoints(&self) -> Vec<Endpoint> {
        self.registry.read().await.endpoints().to_vec()
    }

    pub async fn add_endpoint(
        &self,
        descriptor: EndpointDescriptor,
    ) -> Result<Endpoint, GatewayError> {
        let mut registry = self.registry.write().await;
        let endpoint = registry.add(descriptor, EndpointOrigin::User)?;
        registry.save(self.store.as_ref()).await?;
        info!(url = %endpoint.url, priority = endpoint.priority, "endpoint added");
        Ok(endpoint)
    }

    pub async fn remove_endpoint(&self, url: &str) -> Result<Endpoint, GatewayError> {
        let mut registry = self.registry.write().await;
        let endpoint = registry.remove(url)?;
        registry.save(self.store.as_ref()).await?;
        if self.orchestrator.preferred().await.as_deref() == Some(endpoint.url.as_str()) {
            self.orchestrator.clear_preferred().await;
        }
        info!(url = %endpoint.url, "endpoint removed");
        Ok(endpoint)
    }

    /// Merge a discovered endpoint list; returns how many entries were
    /// added or updated.
    pub async fn merge_discovered(
        &self,
        descriptors: Vec<EndpointDescriptor>,
    ) -> Result<usize, GatewayError> {
        let mut registry = self.registry.write().await;
        let changed = registry.merge_discovered(descriptors);
        if changed > 0 {
            registry.save(self.store.as_ref()).await?;
        }
        Ok(changed)
    }

    // ── Region preference ───────────────────────────────────────────────

    pub async fn region(&self) -> Region {
        *self.region.read().await
    }

    pub async fn set_region(&self, region: Region) -> Result<(), GatewayError> {
        store::save_json(self.store.as_ref(), keys::REGION, &region).await?;
        *self.region.write().await = region;
        info!(region = %region, "network preference updated");
        Ok(())
    }

    // ── Probing and ranking ─────────────────────────────────────────────

    pub async fn health(&self) -> HashMap<String, HealthRecord> {
        self.ledger.snapshot().await
    }

    async fn current_version(&self) -> String {
        cache_version(&self.registry.read().await.fingerprint())
    }

    /// Endpoints in static order (priority, then health).
    async fn ordered_endpoints(&self) -> Vec<Endpoint> {
        let endpoints = self.endpoints().await;
        self.selector.static_order(&endpoints, &self.ledger.snapshot().await)
    }

    async fn persist_ledger(&self) {
        if let Err(e) = self.ledger.save(self.store.as_ref()).await {
            warn!(error = %e, "failed to persist health history");
        }
    }

    /// Probe every endpoint and cache the resulting run.
    pub async fn sweep(&self) -> ProbeRun {
        let endpoints = self.ordered_endpoints().await;
        let version = self.current_version().await;
        let results = self
            .orchestrator
            .sweep(
                &endpoints,
                self.orchestrator.probe_cid(),
                self.region().await,
                &self.shutdown,
            )
            .await;
        let run = ProbeRun::new(results, crate::now_ms(), version);

        self.persist_ledger().await;
        if let Err(e) = self.cache.save(&run).await {
            warn!(error = %e, "failed to cache probe run");
        }
        run
    }

    /// The cached run when it is current, otherwise a fresh sweep.
    pub async fn current_run(&self, force: bool) -> ProbeRun {
        if !force {
            match self.cache.load(&self.current_version().await).await {
                Ok(hit) => {
                    debug!(age_secs = hit.age_secs, "using cached probe run");
                    return hit.run;
                }
                Err(CacheMiss::Absent) => {}
                Err(miss) => debug!(reason = %miss, "probe run cache miss"),
            }
        }
        self.sweep().await
    }

    /// All endpoints, best first, with their latest observed state.
    pub async fn ranked_endpoints(&self, force: bool) -> Vec<EndpointStatus> {
        let run = self.current_run(force).await;
        let endpoints = self.endpoints().await;
        self.selector.rank(
            Intent::Download,
            &endpoints,
            &self.ledger.snapshot().await,
            &run.results,
        )
    }

    /// Race the catalogue for `cid` and return the first endpoint to serve it.
    ///
    /// `None` means no endpoint is available right now.
    pub async fn best_endpoint(&self, cid: &str) -> Option<ProbeResult> {
        self.race(cid, &self.shutdown).await
    }

    async fn race(&self, cid: &str, cancel: &CancellationToken) -> Option<ProbeResult> {
        let endpoints = self.ordered_endpoints().await;
        let outcome = self
            .orchestrator
            .race(&endpoints, cid, self.region().await, cancel)
            .await;
        self.persist_ledger().await;
        if outcome.winner.is_none() {
            warn!(cid, tried = outcome.results.len(), "no available endpoint");
        }
        outcome.winner
    }

    // ── Cleanup ─────────────────────────────────────────────────────────

    /// Endpoints the cleanup policy would remove, without removing them.
    pub async fn cleanup_candidates(&self) -> Vec<CleanupCandidate> {
        let registry = self.registry.read().await;
        self.cleanup.identify_candidates(
            registry.endpoints(),
            &self.ledger.snapshot().await,
            crate::now_ms(),
        )
    }

    /// Remove flagged endpoints and persist the catalogue.
    pub async fn cleanup(&self) -> Result<Vec<CleanupCandidate>, GatewayError> {
        let mut registry = self.registry.write().await;
        let history = self.ledger.snapshot().await;
        let removed = self
            .cleanup
            .perform_cleanup(&mut registry, &history, crate::now_ms());
        if !removed.is_empty() {
            registry.save(self.store.as_ref()).await?;
        }
        info!(removed = removed.len(), "endpoint cleanup finished");
        Ok(removed)
    }

    // ── Propagation ─────────────────────────────────────────────────────

    /// Healthy endpoints to warm, best first, at most `warm.max_targets`.
    pub async fn warm_targets(&self) -> Vec<Endpoint> {
        let results = match self.cache.load(&self.current_version().await).await {
            Ok(hit) => hit.run.results,
            Err(_) => Vec::new(),
        };
        let endpoints = self.endpoints().await;
        self.selector
            .rank(Intent::Warm, &endpoints, &self.ledger.snapshot().await, &results)
            .into_iter()
            .map(|s| s.endpoint)
            .collect()
    }

    pub async fn warm(&self, cid: &str) -> WarmSummary {
        let targets = self.warm_targets().await;
        self.warmer.warm(cid, targets, &self.shutdown).await
    }

    /// Start warming `cid` in the background.
    pub async fn spawn_warm(&self, cid: &str) -> JoinHandle<WarmSummary> {
        let targets = self.warm_targets().await;
        self.warmer
            .spawn(cid.to_owned(), targets, self.shutdown.child_token())
    }

    /// Cancel every in-flight probe and warm-up.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Verifier for GatewayService {
    async fn propagate(&self, cid: &str) {
        // Detached; the summary is only logged.
        drop(self.spawn_warm(cid).await);
    }

    async fn verify(
        &self,
        cid: &str,
        hash: Option<&str>,
        cancel: &CancellationToken,
    ) -> VerifyOutcome {
        let Some(winner) = self.race(cid, cancel).await else {
            return VerifyOutcome::Unavailable {
                reason: "no endpoint serves the content yet".to_owned(),
            };
        };
        let Some(expected) = hash else {
            return VerifyOutcome::Available { url: winner.url };
        };

        let Some(endpoint) = self.registry.read().await.get(&winner.url).cloned() else {
            return VerifyOutcome::Unavailable {
                reason: format!("endpoint {} left the catalogue", winner.url),
            };
        };
        match self.orchestrator.client().fetch_sha256(&endpoint, cid, cancel).await {
            Ok(actual) if actual.eq_ignore_ascii_case(expected) => {
                VerifyOutcome::Available { url: winner.url }
            }
            Ok(actual) => VerifyOutcome::HashMismatch {
                expected: expected.to_ascii_lowercase(),
                actual,
            },
            Err(e) => VerifyOutcome::Unavailable {
                reason: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::store::{FileStore, MemoryFileStore, MemoryStore};
    use crate::testing::{LossyStore, ScriptedClient, endpoint, seed_catalogue};
    use crate::verify::{RetryStep, VerifyScheduler};
    use cidgate_types::{ErrorType, FileRecord, VerifyStatus};
    use tracing_test::traced_test;

    const A: &str = "https://a.example/ipfs/";
    const B: &str = "https://b.example/ipfs/";
    const C: &str = "https://c.example/ipfs/";

    async fn service(client: Arc<ScriptedClient>, store: Arc<MemoryStore>) -> GatewayService {
        if store.get(keys::CATALOGUE).await.unwrap().is_none() {
            seed_catalogue(store.as_ref(), vec![endpoint(A, 1), endpoint(B, 2), endpoint(C, 60)])
                .await;
        }
        GatewayService::open(EngineConfig::default(), store, client).await
    }

    #[tokio::test(start_paused = true)]
    async fn ranking_reuses_cached_run_until_catalogue_changes() {
        let client = Arc::new(
            ScriptedClient::new()
                .ok(A, 400)
                .ok(B, 90)
                .fail(C, 10, ErrorType::Network),
        );
        let svc = service(client.clone(), Arc::new(MemoryStore::new())).await;

        let ranked = svc.ranked_endpoints(false).await;
        let urls: Vec<&str> = ranked.iter().map(|s| s.endpoint.url.as_str()).collect();
        assert_eq!(urls, vec![B, A, C]);
        assert_eq!(ranked[2].available, Some(false));
        assert_eq!(client.calls().len(), 3);

        svc.ranked_endpoints(false).await;
        assert_eq!(client.calls().len(), 3, "second ranking is served from cache");

        svc.ranked_endpoints(true).await;
        assert_eq!(client.calls().len(), 6, "forced refresh re-probes");

        svc.remove_endpoint(C).await.unwrap();
        let ranked = svc.ranked_endpoints(false).await;
        assert_eq!(ranked.len(), 2);
        assert_eq!(client.calls().len(), 8, "catalogue change invalidates the cache");
    }

    #[tokio::test(start_paused = true)]
    async fn best_endpoint_races_and_persists_history() {
        let client = Arc::new(ScriptedClient::new().ok(A, 500).ok(B, 20).ok(C, 5));
        let store = Arc::new(MemoryStore::new());
        let svc = service(client.clone(), store.clone()).await;

        let best = svc.best_endpoint("QmX").await.unwrap();
        // Concurrency 4 puts all three in one batch; the fastest wins.
        assert_eq!(best.url, C);

        let reopened = service(client, store).await;
        assert!(reopened.health().await.contains_key(C));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn no_available_endpoint_is_reported_as_none() {
        let client = Arc::new(ScriptedClient::new());
        let svc = service(client, Arc::new(MemoryStore::new())).await;
        assert!(svc.best_endpoint("QmX").await.is_none());
        assert!(logs_contain("no available endpoint"));
    }

    #[tokio::test]
    async fn region_and_catalogue_edits_survive_reopen() {
        let client = Arc::new(ScriptedClient::new());
        let store = Arc::new(MemoryStore::new());
        let svc = service(client.clone(), store.clone()).await;
        assert_eq!(svc.region().await, Region::Auto);

        svc.set_region(Region::Cn).await.unwrap();
        let added = svc
            .add_endpoint(EndpointDescriptor {
                name: "Mine".into(),
                url: "https://Mine.example".into(),
                region: Region::Cn,
                priority: None,
                icon: None,
            })
            .await
            .unwrap();
        assert_eq!(added.url, "https://mine.example/ipfs/");
        assert!(added.priority >= 100);
        assert!(matches!(
            svc.remove_endpoint("https://nope.example").await,
            Err(GatewayError::EndpointNotFound { .. })
        ));

        let reopened = service(client, store).await;
        assert_eq!(reopened.region().await, Region::Cn);
        assert_eq!(reopened.endpoints().await.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_removes_chronic_failures_only() {
        let client = Arc::new(
            ScriptedClient::new()
                .fail(A, 10, ErrorType::Network)
                .ok(B, 10)
                .fail(C, 10, ErrorType::Timeout),
        );
        let svc = service(client, Arc::new(MemoryStore::new())).await;
        for _ in 0..10 {
            svc.sweep().await;
        }

        let candidates = svc.cleanup_candidates().await;
        assert_eq!(candidates.len(), 1, "protected endpoint A is never flagged");
        assert_eq!(candidates[0].endpoint.url, C);
        assert_eq!(svc.endpoints().await.len(), 3, "identifying does not remove");

        let removed = svc.cleanup().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(svc.endpoints().await.len(), 2);
        assert!(svc.health().await.contains_key(C), "history is kept");
    }

    #[tokio::test(start_paused = true)]
    async fn warm_targets_skip_failing_endpoints() {
        let client = Arc::new(
            ScriptedClient::new()
                .ok(A, 10)
                .fail(B, 10, ErrorType::Server)
                .ok(C, 10)
                .cache_hit(C),
        );
        let svc = service(client.clone(), Arc::new(MemoryStore::new())).await;
        svc.sweep().await;

        let targets: Vec<String> = svc.warm_targets().await.into_iter().map(|e| e.url).collect();
        assert_eq!(targets, vec![A.to_owned(), C.to_owned()]);
        let summary = svc.warm("QmX").await;
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.cached, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn strong_verification_compares_digests() {
        let client = Arc::new(ScriptedClient::new().ok(A, 10).digest(A, "abcdef"));
        let svc = service(client, Arc::new(MemoryStore::new())).await;
        let cancel = CancellationToken::new();

        assert_eq!(
            svc.verify("QmX", Some("ABCDEF"), &cancel).await,
            VerifyOutcome::Available { url: A.to_owned() }
        );
        assert!(svc.verify("QmX", Some("012345"), &cancel).await.is_permanent());
        assert_eq!(
            svc.verify("QmX", None, &cancel).await,
            VerifyOutcome::Available { url: A.to_owned() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_verifies_through_the_service() {
        let client = Arc::new(ScriptedClient::new().ok(B, 10));
        let kv = Arc::new(MemoryStore::new());
        let svc = Arc::new(service(client.clone(), kv.clone()).await);
        let files = Arc::new(MemoryFileStore::new());
        files.upsert(FileRecord::new("f1", "QmUpload")).await.unwrap();

        let scheduler = VerifyScheduler::start(RetryConfig::default(), files.clone(), kv, svc);
        assert_eq!(scheduler.verify_now("f1").await.unwrap(), RetryStep::Verified);

        let file = files.get("f1").await.unwrap().unwrap();
        assert_eq!(file.verify_status, VerifyStatus::Ok);
        assert_eq!(file.verify_message.as_deref(), Some(format!("Available via {B}").as_str()));
    }

    #[tokio::test]
    async fn discovered_lists_update_and_persist_the_catalogue() {
        let client = Arc::new(ScriptedClient::new());
        let store = Arc::new(MemoryStore::new());
        let svc = service(client.clone(), store.clone()).await;
        svc.add_endpoint(EndpointDescriptor {
            name: "Mine".into(),
            url: "https://mine.example".into(),
            region: Region::Auto,
            priority: None,
            icon: None,
        })
        .await
        .unwrap();

        let discovered = |name: &str, url: &str| EndpointDescriptor {
            name: name.into(),
            url: url.into(),
            region: Region::Intl,
            priority: None,
            icon: None,
        };
        let changed = svc
            .merge_discovered(vec![
                discovered("Listed", "https://mine.example/ipfs/"),
                discovered("New", "https://new.example"),
                discovered("Shadow", A),
                discovered("bad", "not a url"),
            ])
            .await
            .unwrap();
        assert_eq!(changed, 2);

        let reopened = service(client, store).await;
        let endpoints = reopened.endpoints().await;
        assert_eq!(endpoints.len(), 5);
        let mine = endpoints.iter().find(|e| e.url == "https://mine.example/ipfs/").unwrap();
        assert_eq!(mine.name, "Listed");
        assert_eq!(mine.origin, EndpointOrigin::Discovered);
        let a = endpoints.iter().find(|e| e.url == A).unwrap();
        assert_eq!(a.name, A, "built-in keeps its fields");

        let again = reopened
            .merge_discovered(vec![discovered("Listed", "https://mine.example")])
            .await
            .unwrap();
        assert_eq!(again, 0, "discovered entries do not override each other");
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_returns_the_fresh_run_when_caching_loses_it() {
        let client = Arc::new(ScriptedClient::new().ok(A, 10).ok(B, 20).ok(C, 30));
        let store = Arc::new(LossyStore::truncating(keys::PROBE_RUN));
        let catalogue = vec![endpoint(A, 1), endpoint(B, 2), endpoint(C, 60)];
        seed_catalogue(store.as_ref(), catalogue).await;
        let svc = GatewayService::open(EngineConfig::default(), store, client.clone()).await;

        let run = svc.sweep().await;
        assert_eq!(run.results.len(), 3);
        assert!(run.results.iter().all(|r| r.available));

        // Nothing usable was cached, so the next ranking sweeps again.
        svc.ranked_endpoints(false).await;
        assert_eq!(client.calls().len(), 6);
    }
}
