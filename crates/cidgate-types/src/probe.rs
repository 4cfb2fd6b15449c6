use serde::{Deserialize, Serialize};
use strum::Display;

/// Failure classification of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ErrorType {
    #[default]
    None,
    Timeout,
    Network,
    Server,
}

/// Outcome of probing one endpoint for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub url: String,
    pub name: String,
    pub available: bool,
    /// Wall-clock time to the first response header.
    pub latency_ms: Option<u64>,
    pub error_type: ErrorType,
    pub status_code: Option<u16>,
    /// Ledger score after this result was recorded.
    #[serde(default)]
    pub health_score: u8,
}

impl ProbeResult {
    pub fn unavailable(url: &str, name: &str, error_type: ErrorType, status: Option<u16>) -> Self {
        Self {
            url: url.to_owned(),
            name: name.to_owned(),
            available: false,
            latency_ms: None,
            error_type,
            status_code: status,
            health_score: 0,
        }
    }
}

/// Summary statistics of a probe run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total: usize,
    pub available: usize,
    /// Mean latency over available endpoints.
    pub average_latency_ms: Option<u64>,
    /// URL of the lowest-latency available endpoint.
    pub fastest: Option<String>,
}

impl RunSummary {
    pub fn from_results(results: &[ProbeResult]) -> Self {
        let available: Vec<&ProbeResult> = results.iter().filter(|r| r.available).collect();
        let latencies: Vec<u64> = available.iter().filter_map(|r| r.latency_ms).collect();
        let average_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<u64>() / latencies.len() as u64)
        };
        let fastest = available
            .iter()
            .filter(|r| r.latency_ms.is_some())
            .min_by_key(|r| r.latency_ms)
            .map(|r| r.url.clone());

        Self {
            total: results.len(),
            available: available.len(),
            average_latency_ms,
            fastest,
        }
    }
}

/// Immutable snapshot of a full sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeRun {
    pub results: Vec<ProbeResult>,
    /// Epoch milliseconds at which the sweep finished.
    pub timestamp: i64,
    pub version: String,
    pub summary: RunSummary,
}

impl ProbeRun {
    pub fn new(results: Vec<ProbeResult>, timestamp: i64, version: impl Into<String>) -> Self {
        let summary = RunSummary::from_results(&results);
        Self {
            results,
            timestamp,
            version: version.into(),
            summary,
        }
    }

    pub fn result_for(&self, url: &str) -> Option<&ProbeResult> {
        self.results.iter().find(|r| r.url == url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(url: &str, latency: u64) -> ProbeResult {
        ProbeResult {
            url: url.to_owned(),
            name: url.to_owned(),
            available: true,
            latency_ms: Some(latency),
            error_type: ErrorType::None,
            status_code: Some(200),
            health_score: 100,
        }
    }

    #[test]
    fn summary_counts_and_fastest() {
        let results = vec![
            ok("a", 300),
            ProbeResult::unavailable("b", "b", ErrorType::Timeout, None),
            ok("c", 100),
        ];
        let run = ProbeRun::new(results, 42, "v1");
        assert_eq!(run.summary.total, 3);
        assert_eq!(run.summary.available, 2);
        assert_eq!(run.summary.average_latency_ms, Some(200));
        assert_eq!(run.summary.fastest.as_deref(), Some("c"));
        assert!(run.result_for("b").is_some_and(|r| !r.available));
    }

    #[test]
    fn summary_of_all_failures_is_empty() {
        let summary = RunSummary::from_results(&[ProbeResult::unavailable(
            "a",
            "a",
            ErrorType::Network,
            None,
        )]);
        assert_eq!(summary.available, 0);
        assert_eq!(summary.average_latency_ms, None);
        assert_eq!(summary.fastest, None);
    }

    #[test]
    fn error_type_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ErrorType::Timeout).unwrap(), "\"timeout\"");
        assert_eq!(ErrorType::Server.to_string(), "server");
    }
}
