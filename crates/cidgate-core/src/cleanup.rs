//! Flags and removes chronically unhealthy endpoints.
//!
//! Endpoints with `priority <= protected_priority` are never flagged. The
//! health ledger is only read here: records of removed endpoints stay put.

use std::collections::HashMap;
use std::fmt;

use cidgate_types::{Endpoint, HealthRecord};
use serde::Serialize;
use tracing::info;

use crate::config::CleanupConfig;
use crate::registry::EndpointRegistry;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Why an endpoint was flagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CleanupReason {
    TooManyFailures { failures: u64, limit: u64 },
    ConsecutiveFailures { failures: u32, limit: u32 },
    NeverSucceeded { checks: u64 },
    Stale { days: u32, limit: u32 },
    LowHealth { score: u8, floor: u8 },
}

impl fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyFailures { failures, limit } => {
                write!(f, "{failures} failed checks (limit {limit})")
            }
            Self::ConsecutiveFailures { failures, limit } => {
                write!(f, "{failures} failures in a row (limit {limit})")
            }
            Self::NeverSucceeded { checks } => {
                write!(f, "never succeeded in {checks} checks")
            }
            Self::Stale { days, limit } => {
                write!(f, "no success for {days} days (limit {limit})")
            }
            Self::LowHealth { score, floor } => {
                write!(f, "health score {score} below {floor}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupCandidate {
    pub endpoint: Endpoint,
    pub reasons: Vec<CleanupReason>,
}

impl CleanupCandidate {
    /// All reasons joined into one line.
    pub fn summary(&self) -> String {
        self.reasons
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct CleanupPolicy {
    config: CleanupConfig,
}

impl CleanupPolicy {
    pub fn new(config: CleanupConfig) -> Self {
        Self { config }
    }

    pub fn is_protected(&self, endpoint: &Endpoint) -> bool {
        endpoint.priority <= self.config.protected_priority
    }

    fn reasons(&self, record: &HealthRecord, now_ms: i64) -> Vec<CleanupReason> {
        let cfg = &self.config;
        let mut reasons = Vec::new();
        if record.samples() == 0 {
            return reasons;
        }

        if record.failure_count >= cfg.max_failures {
            reasons.push(CleanupReason::TooManyFailures {
                failures: record.failure_count,
                limit: cfg.max_failures,
            });
        }
        if record.consecutive_failures >= cfg.max_consecutive_failures {
            reasons.push(CleanupReason::ConsecutiveFailures {
                failures: record.consecutive_failures,
                limit: cfg.max_consecutive_failures,
            });
        }
        match record.last_success_time {
            None => reasons.push(CleanupReason::NeverSucceeded {
                checks: record.samples(),
            }),
            Some(last) => {
                let days = u32::try_from((now_ms - last).max(0) / DAY_MS).unwrap_or(u32::MAX);
                if days >= cfg.max_days_since_success {
                    reasons.push(CleanupReason::Stale {
                        days,
                        limit: cfg.max_days_since_success,
                    });
                }
            }
        }
        if record.samples() >= cfg.min_samples_for_score
            && record.health_score < cfg.min_health_score
        {
            reasons.push(CleanupReason::LowHealth {
                score: record.health_score,
                floor: cfg.min_health_score,
            });
        }
        reasons
    }

    /// Non-protected endpoints matching at least one cleanup rule.
    ///
    /// Endpoints that were never checked have nothing against them and are
    /// not flagged.
    pub fn identify_candidates(
        &self,
        endpoints: &[Endpoint],
        health: &HashMap<String, HealthRecord>,
        now_ms: i64,
    ) -> Vec<CleanupCandidate> {
        endpoints
            .iter()
            .filter(|ep| !self.is_protected(ep))
            .filter_map(|ep| {
                let reasons = self.reasons(health.get(&ep.url)?, now_ms);
                (!reasons.is_empty()).then(|| CleanupCandidate {
                    endpoint: ep.clone(),
                    reasons,
                })
            })
            .collect()
    }

    /// Remove every flagged endpoint from `registry` and report what went.
    pub fn perform_cleanup(
        &self,
        registry: &mut EndpointRegistry,
        health: &HashMap<String, HealthRecord>,
        now_ms: i64,
    ) -> Vec<CleanupCandidate> {
        let candidates = self.identify_candidates(registry.endpoints(), health, now_ms);
        let mut removed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if self.is_protected(&candidate.endpoint) {
                continue;
            }
            if registry.remove(&candidate.endpoint.url).is_ok() {
                info!(
                    url = %candidate.endpoint.url,
                    reasons = %candidate.summary(),
                    "removed unhealthy endpoint"
                );
                removed.push(candidate);
            }
        }
        removed
    }
}
