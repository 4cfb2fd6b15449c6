//! Cumulative per-endpoint health history.
//!
//! The ledger outlives individual probe runs and catalogue edits: removing
//! an endpoint from the registry leaves its record here for audit or re-add.

use std::collections::HashMap;
use std::sync::Arc;

use cidgate_types::{Endpoint, HealthRecord, NEUTRAL_HEALTH_SCORE, ProbeResult, Region};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::GatewayError;
use crate::store::{self, KvStore, keys};

/// Bonus added to the latency score when the endpoint's region matches the
/// user's declared network preference.
pub const REGION_BONUS: u8 = 10;

/// Score for a successful probe from its latency alone.
pub fn latency_score(latency_ms: u64) -> u8 {
    match latency_ms {
        0..500 => 100,
        500..1000 => 85,
        1000..2000 => 70,
        2000..5000 => 50,
        _ => 20,
    }
}

/// Score for a successful probe, including the region bonus (capped at 100).
pub fn health_score(latency_ms: u64, region: Region, preference: Region) -> u8 {
    let base = latency_score(latency_ms);
    if region.matches(preference) {
        base.saturating_add(REGION_BONUS).min(100)
    } else {
        base
    }
}

/// Process-wide health ledger keyed by canonical endpoint URL.
///
/// Each update takes the write lock for the whole read-modify-write, so two
/// probe completions for the same endpoint can never interleave.
#[derive(Debug, Clone, Default)]
pub struct HealthLedger {
    records: Arc<RwLock<HashMap<String, HealthRecord>>>,
}

impl HealthLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: HashMap<String, HealthRecord>) -> Self {
        Self {
            records: Arc::new(RwLock::new(records)),
        }
    }

    /// Load persisted history; unreadable blobs start an empty ledger.
    pub async fn load(store: &dyn KvStore) -> Self {
        let records = store::load_json::<HashMap<String, HealthRecord>>(store, keys::HEALTH)
            .await
            .unwrap_or_default();
        Self::from_records(records)
    }

    pub async fn save(&self, store: &dyn KvStore) -> Result<(), GatewayError> {
        let snapshot = self.snapshot().await;
        store::save_json(store, keys::HEALTH, &snapshot).await
    }

    /// Fold one probe result into the endpoint's record and return the
    /// updated record.
    pub async fn update(
        &self,
        endpoint: &Endpoint,
        result: &ProbeResult,
        preference: Region,
    ) -> HealthRecord {
        let now = crate::now_ms();
        let mut guard = self.records.write().await;
        let record = guard.entry(endpoint.url.clone()).or_default();

        match (result.available, result.latency_ms) {
            (true, latency) => {
                let latency = latency.unwrap_or(0);
                let score = health_score(latency, endpoint.region, preference);
                record.record_success(now, latency, score);
            }
            (false, _) => record.record_failure(now),
        }
        debug!(
            url = %endpoint.url,
            available = result.available,
            score = record.health_score,
            consecutive_failures = record.consecutive_failures,
            "health ledger updated"
        );
        record.clone()
    }

    pub async fn get(&self, url: &str) -> Option<HealthRecord> {
        self.records.read().await.get(url).cloned()
    }

    /// Latest score, or the neutral default for endpoints never probed.
    pub async fn score_of(&self, url: &str) -> u8 {
        self.records
            .read()
            .await
            .get(url)
            .map_or(NEUTRAL_HEALTH_SCORE, |r| r.health_score)
    }

    pub async fn snapshot(&self) -> HashMap<String, HealthRecord> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{endpoint, fail_result, ok_result};
    use cidgate_types::ErrorType;

    #[test]
    fn latency_tiers() {
        assert_eq!(latency_score(0), 100);
        assert_eq!(latency_score(499), 100);
        assert_eq!(latency_score(500), 85);
        assert_eq!(latency_score(1999), 70);
        assert_eq!(latency_score(4999), 50);
        assert_eq!(latency_score(5000), 20);
    }

    #[test]
    fn region_bonus_is_capped() {
        assert_eq!(health_score(100, Region::Cn, Region::Cn), 100);
        assert_eq!(health_score(600, Region::Cn, Region::Cn), 95);
        assert_eq!(health_score(600, Region::Cn, Region::Intl), 85);
        assert_eq!(health_score(600, Region::Auto, Region::Auto), 85);
    }

    #[tokio::test]
    async fn success_after_failures_resets_streak() {
        let ledger = HealthLedger::new();
        let ep = endpoint("https://a.example/ipfs/", 1);
        ledger.update(&ep, &fail_result(&ep, ErrorType::Timeout), Region::Auto).await;
        let rec = ledger.update(&ep, &fail_result(&ep, ErrorType::Network), Region::Auto).await;
        assert_eq!(rec.consecutive_failures, 2);
        assert_eq!(rec.health_score, 0);

        let rec = ledger.update(&ep, &ok_result(&ep, 700), Region::Auto).await;
        assert_eq!(rec.consecutive_failures, 0);
        assert_eq!(rec.health_score, 85);
        assert_eq!(rec.latency, 700);
        assert_eq!(rec.failure_count, 2);
        assert_eq!(rec.success_count, 1);
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let ledger = HealthLedger::new();
        let ep = endpoint("https://a.example/ipfs/", 1);
        let mut handles = Vec::new();
        for i in 0..50 {
            let ledger = ledger.clone();
            let ep = ep.clone();
            handles.push(tokio::spawn(async move {
                let result = if i % 2 == 0 {
                    ok_result(&ep, 100)
                } else {
                    fail_result(&ep, ErrorType::Timeout)
                };
                ledger.update(&ep, &result, Region::Auto).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let rec = ledger.get(&ep.url).await.unwrap();
        assert_eq!(rec.success_count, 25);
        assert_eq!(rec.failure_count, 25);
    }

    #[tokio::test]
    async fn counters_are_monotonic() {
        let ledger = HealthLedger::new();
        let ep = endpoint("https://a.example/ipfs/", 1);
        let (mut s, mut f) = (0, 0);
        for i in 0..20 {
            let result = if i % 3 == 0 {
                fail_result(&ep, ErrorType::Server)
            } else {
                ok_result(&ep, 50)
            };
            let rec = ledger.update(&ep, &result, Region::Auto).await;
            assert!(rec.success_count >= s && rec.failure_count >= f);
            if result.available {
                assert_eq!(rec.consecutive_failures, 0);
            }
            s = rec.success_count;
            f = rec.failure_count;
        }
    }

    #[tokio::test]
    async fn unknown_endpoint_scores_neutral_and_history_persists() {
        let store = MemoryStore::new();
        let ledger = HealthLedger::load(&store).await;
        assert_eq!(ledger.score_of("https://nope/ipfs/").await, NEUTRAL_HEALTH_SCORE);

        let ep = endpoint("https://a.example/ipfs/", 1);
        ledger.update(&ep, &ok_result(&ep, 100), Region::Auto).await;
        ledger.save(&store).await.unwrap();

        let reloaded = HealthLedger::load(&store).await;
        assert_eq!(reloaded.get(&ep.url).await, ledger.get(&ep.url).await);
    }
}
