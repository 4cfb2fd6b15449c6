use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Score assumed for endpoints that have never been probed.
pub const NEUTRAL_HEALTH_SCORE: u8 = 50;

/// Number of recent samples kept for the reliability figure.
pub const RELIABILITY_WINDOW: usize = 20;

/// Cumulative health history for one endpoint, independent of any probe run.
///
/// `consecutive_failures` only ever grows between successes and is reset to
/// exactly zero by [`HealthRecord::record_success`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    /// Epoch milliseconds.
    pub last_success_time: Option<i64>,
    pub last_failure_time: Option<i64>,
    pub last_check_time: Option<i64>,
    pub health_score: u8,
    /// Latest latency in milliseconds, `-1` when the last probe failed.
    pub latency: i64,
    /// Most recent outcomes, oldest first, capped at [`RELIABILITY_WINDOW`].
    #[serde(default)]
    pub recent: VecDeque<bool>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            last_success_time: None,
            last_failure_time: None,
            last_check_time: None,
            health_score: NEUTRAL_HEALTH_SCORE,
            latency: -1,
            recent: VecDeque::new(),
        }
    }
}

impl HealthRecord {
    pub fn record_success(&mut self, now_ms: i64, latency_ms: u64, health_score: u8) {
        self.success_count = self.success_count.saturating_add(1);
        self.consecutive_failures = 0;
        self.last_success_time = Some(now_ms);
        self.last_check_time = Some(now_ms);
        self.health_score = health_score.min(100);
        self.latency = i64::try_from(latency_ms).unwrap_or(i64::MAX);
        self.push_sample(true);
    }

    pub fn record_failure(&mut self, now_ms: i64) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_time = Some(now_ms);
        self.last_check_time = Some(now_ms);
        self.health_score = 0;
        self.latency = -1;
        self.push_sample(false);
    }

    /// Total number of recorded checks.
    pub fn samples(&self) -> u64 {
        self.success_count.saturating_add(self.failure_count)
    }

    /// Percentage (0–100) of the recent window that succeeded.
    ///
    /// Returns `None` when there are no samples yet.
    pub fn reliability(&self) -> Option<u8> {
        if self.recent.is_empty() {
            return None;
        }
        let ok = self.recent.iter().filter(|s| **s).count();
        Some(((ok * 100) / self.recent.len()) as u8)
    }

    fn push_sample(&mut self, ok: bool) {
        if self.recent.len() >= RELIABILITY_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(ok);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_resets_consecutive_failures() {
        let mut rec = HealthRecord::default();
        rec.record_failure(1);
        rec.record_failure(2);
        assert_eq!(rec.consecutive_failures, 2);
        assert_eq!(rec.health_score, 0);
        assert_eq!(rec.latency, -1);

        rec.record_success(3, 120, 100);
        assert_eq!(rec.consecutive_failures, 0);
        assert_eq!(rec.success_count, 1);
        assert_eq!(rec.failure_count, 2);
        assert_eq!(rec.last_success_time, Some(3));
        assert_eq!(rec.last_check_time, Some(3));
        assert_eq!(rec.latency, 120);
    }

    #[test]
    fn reliability_uses_bounded_window() {
        let mut rec = HealthRecord::default();
        assert_eq!(rec.reliability(), None);
        for i in 0..RELIABILITY_WINDOW {
            rec.record_failure(i as i64);
        }
        assert_eq!(rec.reliability(), Some(0));
        for i in 0..RELIABILITY_WINDOW / 2 {
            rec.record_success(i as i64, 10, 100);
        }
        assert_eq!(rec.recent.len(), RELIABILITY_WINDOW);
        assert_eq!(rec.reliability(), Some(50));
        assert_eq!(rec.samples(), (RELIABILITY_WINDOW + RELIABILITY_WINDOW / 2) as u64);
    }

    #[test]
    fn legacy_record_without_window_deserializes() {
        let json = r#"{
            "successCount": 3, "failureCount": 1, "consecutiveFailures": 0,
            "lastSuccessTime": 10, "lastFailureTime": 5, "lastCheckTime": 10,
            "healthScore": 85, "latency": 640
        }"#;
        let rec: HealthRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.success_count, 3);
        assert!(rec.recent.is_empty());
    }
}
