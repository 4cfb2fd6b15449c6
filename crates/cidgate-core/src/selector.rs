//! Endpoint ordering for a given intent.
//!
//! The static order is `priority` ascending, then ledger health descending
//! (never-probed endpoints score [`NEUTRAL_HEALTH_SCORE`]). Once probe
//! results exist, the download order puts available endpoints first by
//! latency, then the unavailable ones by priority.

use std::cmp::Ordering;
use std::collections::HashMap;

use cidgate_types::{
    Endpoint, EndpointStatus, ErrorType, HealthRecord, NEUTRAL_HEALTH_SCORE, ProbeResult,
};
use strum::{Display, EnumString};

/// What the ordering is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Intent {
    /// Fetch an object right now: fastest available endpoint first.
    #[default]
    Download,
    /// Background warm-up: a bounded slice of healthy endpoints.
    Warm,
}

type Health = HashMap<String, HealthRecord>;

fn score(health: &Health, url: &str) -> u8 {
    health.get(url).map_or(NEUTRAL_HEALTH_SCORE, |r| r.health_score)
}

#[derive(Debug, Clone)]
pub struct Selector {
    warm_limit: usize,
}

impl Default for Selector {
    fn default() -> Self {
        Self { warm_limit: 6 }
    }
}

impl Selector {
    pub fn new(warm_limit: usize) -> Self {
        Self { warm_limit }
    }

    /// Priority ascending, then health score descending, then URL.
    pub fn static_order(&self, endpoints: &[Endpoint], health: &Health) -> Vec<Endpoint> {
        let mut ordered = endpoints.to_vec();
        ordered.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| score(health, &b.url).cmp(&score(health, &a.url)))
                .then_with(|| a.url.cmp(&b.url))
        });
        ordered
    }

    /// Order endpoints for `intent` and join them with their latest state.
    ///
    /// `results` are the most recent per-endpoint probe results (typically
    /// the cached run); endpoints without one are reported as unprobed.
    pub fn rank(
        &self,
        intent: Intent,
        endpoints: &[Endpoint],
        health: &Health,
        results: &[ProbeResult],
    ) -> Vec<EndpointStatus> {
        let by_url: HashMap<&str, &ProbeResult> =
            results.iter().map(|r| (r.url.as_str(), r)).collect();
        let statuses: Vec<EndpointStatus> = self
            .static_order(endpoints, health)
            .into_iter()
            .map(|ep| {
                let result = by_url.get(ep.url.as_str()).copied();
                status_of(ep, health, result)
            })
            .collect();

        match intent {
            Intent::Download => download_order(statuses),
            Intent::Warm => statuses
                .into_iter()
                .filter(|s| is_healthy(s, health))
                .take(self.warm_limit)
                .collect(),
        }
    }
}

fn status_of(endpoint: Endpoint, health: &Health, result: Option<&ProbeResult>) -> EndpointStatus {
    let record = health.get(&endpoint.url);
    EndpointStatus {
        available: result.map(|r| r.available),
        latency_ms: result.and_then(|r| r.latency_ms),
        health_score: record.map_or(NEUTRAL_HEALTH_SCORE, |r| r.health_score),
        reliability: record.and_then(HealthRecord::reliability).unwrap_or(0),
        error_type: result.map_or(ErrorType::None, |r| r.error_type),
        endpoint,
    }
}

/// Endpoints fit for background traffic: available in the latest results,
/// or not probed yet and not currently failing.
fn is_healthy(status: &EndpointStatus, health: &Health) -> bool {
    match status.available {
        Some(available) => available,
        None => health
            .get(&status.endpoint.url)
            .is_none_or(|r| r.consecutive_failures == 0),
    }
}

/// Available by latency, then unprobed in static order, then unavailable by
/// priority. The sort is stable, so ties keep the static order.
fn download_order(mut statuses: Vec<EndpointStatus>) -> Vec<EndpointStatus> {
    fn group(s: &EndpointStatus) -> u8 {
        match s.available {
            Some(true) => 0,
            None => 1,
            Some(false) => 2,
        }
    }
    statuses.sort_by(|a, b| {
        group(a).cmp(&group(b)).then_with(|| match group(a) {
            0 => a
                .latency_ms
                .unwrap_or(u64::MAX)
                .cmp(&b.latency_ms.unwrap_or(u64::MAX)),
            2 => a.endpoint.priority.cmp(&b.endpoint.priority),
            _ => Ordering::Equal,
        })
    });
    statuses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{endpoint, fail_result, ok_result};

    fn record(score: u8, consecutive_failures: u32) -> HealthRecord {
        HealthRecord {
            health_score: score,
            consecutive_failures,
            ..Default::default()
        }
    }

    fn urls(statuses: &[EndpointStatus]) -> Vec<&str> {
        statuses.iter().map(|s| s.endpoint.url.as_str()).collect()
    }

    #[test]
    fn equal_scores_tie_break_on_latency() {
        let a = endpoint("https://a.example/ipfs/", 20);
        let b = endpoint("https://b.example/ipfs/", 20);
        let health = HashMap::from([
            (a.url.clone(), record(90, 0)),
            (b.url.clone(), record(90, 0)),
        ]);
        let results = vec![ok_result(&a, 200), ok_result(&b, 50)];

        let pool = [a.clone(), b.clone()];
        let ranked = Selector::default().rank(Intent::Download, &pool, &health, &results);
        assert_eq!(urls(&ranked), vec![b.url.as_str(), a.url.as_str()]);
        assert_eq!(ranked[0].health_score, 90);
    }

    #[test]
    fn static_order_uses_priority_then_health() {
        let a = endpoint("https://a.example/ipfs/", 2);
        let b = endpoint("https://b.example/ipfs/", 1);
        let c = endpoint("https://c.example/ipfs/", 2);
        let health = HashMap::from([(a.url.clone(), record(10, 3))]);

        let pool = [a.clone(), b.clone(), c.clone()];
        let ordered = Selector::default().static_order(&pool, &health);
        let ordered: Vec<&str> = ordered.iter().map(|e| e.url.as_str()).collect();
        // `c` was never probed and scores neutral, above `a`'s 10.
        assert_eq!(ordered, vec![b.url.as_str(), c.url.as_str(), a.url.as_str()]);
    }

    #[test]
    fn unavailable_endpoints_trail_by_priority() {
        let a = endpoint("https://a.example/ipfs/", 5);
        let b = endpoint("https://b.example/ipfs/", 1);
        let c = endpoint("https://c.example/ipfs/", 3);
        let d = endpoint("https://d.example/ipfs/", 9);
        let results = vec![
            fail_result(&a, ErrorType::Timeout),
            fail_result(&b, ErrorType::Server),
            ok_result(&d, 900),
        ];
        let selector = Selector::default();
        let pool = [a.clone(), b.clone(), c.clone(), d.clone()];
        let ranked = selector.rank(Intent::Download, &pool, &HashMap::new(), &results);
        assert_eq!(
            urls(&ranked),
            vec![d.url.as_str(), c.url.as_str(), b.url.as_str(), a.url.as_str()]
        );
        assert_eq!(ranked[3].error_type, ErrorType::Timeout);
        assert_eq!(ranked[1].available, None);
    }

    #[test]
    fn warm_targets_are_healthy_and_bounded() {
        let pool: Vec<Endpoint> = (1..=5)
            .map(|i| endpoint(&format!("https://gw{i}.example/ipfs/"), i))
            .collect();
        let health = HashMap::from([(pool[1].url.clone(), record(0, 2))]);
        let results = vec![fail_result(&pool[0], ErrorType::Network)];

        let ranked = Selector::new(2).rank(Intent::Warm, &pool, &health, &results);
        assert_eq!(urls(&ranked), vec![pool[2].url.as_str(), pool[3].url.as_str()]);
    }

    #[test]
    fn intent_parses() {
        assert_eq!("warm".parse::<Intent>().unwrap(), Intent::Warm);
        assert_eq!("Download".parse::<Intent>().unwrap(), Intent::Download);
    }
}
