use serde::{Deserialize, Serialize};

/// Outcome of one warming request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmResult {
    pub url: String,
    pub success: bool,
    /// The gateway answered from its own cache.
    pub cache_hit: bool,
    pub latency_ms: Option<u64>,
    pub status_code: Option<u16>,
}

/// Aggregate of a propagation warm-up.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmSummary {
    pub cid: String,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cached: usize,
    pub elapsed_ms: u64,
    pub results: Vec<WarmResult>,
}

impl WarmSummary {
    pub fn from_results(cid: &str, results: Vec<WarmResult>, elapsed_ms: u64) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        let cached = results.iter().filter(|r| r.success && r.cache_hit).count();
        Self {
            cid: cid.to_owned(),
            attempted: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            cached,
            elapsed_ms,
            results,
        }
    }
}
