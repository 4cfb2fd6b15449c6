//! Engine tunables.
//!
//! Every threshold the engine uses lives here with a default. Embedders
//! override fields directly or through the `set_*` builder methods on
//! [`EngineConfig`].

use std::time::Duration;

/// Reference object probed when no specific content is requested: the empty
/// UnixFS directory, which every IPFS gateway can serve.
pub const DEFAULT_PROBE_CID: &str = "QmUNLLsPACCz1vLxQVkXqqLX5R1X345qqfHbsf67hvA3Nn";

/// Single-probe behaviour.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Budget for one request, from send to first response header.
    pub timeout: Duration,
    /// Extra attempts after a transient server status (502/503/504/524).
    pub retry_count: u32,
    /// Fixed pause between those attempts.
    pub retry_delay: Duration,
    /// Fall back to a one-byte ranged GET when HEAD is not allowed.
    pub range_fallback: bool,
    /// Budget for downloading a full object during strong verification.
    pub content_timeout: Duration,
    pub user_agent: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(8),
            retry_count: 2,
            retry_delay: Duration::from_secs(1),
            range_fallback: true,
            content_timeout: Duration::from_secs(120),
            user_agent: concat!("cidgate/", env!("CARGO_PKG_VERSION")).to_owned(),
        }
    }
}

/// Batching of probes across endpoints.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Endpoints probed at once, both in races and sweeps.
    pub concurrency: usize,
    pub probe_cid: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            probe_cid: DEFAULT_PROBE_CID.to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub expiry: Duration,
    /// Serialized runs larger than this are stored gzip-compressed.
    pub compress_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(10 * 60),
            compress_threshold: 8 * 1024,
        }
    }
}

/// Ceilings and floors for flagging chronically bad endpoints.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Endpoints with `priority <= protected_priority` are never removed.
    pub protected_priority: u32,
    pub max_failures: u64,
    pub max_consecutive_failures: u32,
    pub max_days_since_success: u32,
    pub min_health_score: u8,
    /// The health floor only applies once this many checks were recorded.
    pub min_samples_for_score: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            protected_priority: 10,
            max_failures: 20,
            max_consecutive_failures: 10,
            max_days_since_success: 7,
            min_health_score: 20,
            min_samples_for_score: 5,
        }
    }
}

/// Verification retry scheduling.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub enabled: bool,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the uniform random jitter added to each delay.
    pub jitter_max: Duration,
    pub max_attempts: u32,
    /// Delay before looking again at a file that is still being verified.
    pub busy_delay: Duration,
    /// A file stuck in `verifying` for longer than this is re-enrolled on resync.
    pub stuck_window: Duration,
    /// Files that failed within this window are re-enrolled on resync.
    pub failed_retry_window: Duration,
    /// Compare the full body's SHA-256 with the record's hash when one exists.
    pub strong_verification: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(5 * 60),
            jitter_max: Duration::from_secs(2),
            max_attempts: 6,
            busy_delay: Duration::from_secs(5),
            stuck_window: Duration::from_secs(5 * 60),
            failed_retry_window: Duration::from_secs(24 * 60 * 60),
            strong_verification: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WarmConfig {
    pub max_targets: usize,
    pub concurrency: usize,
    pub timeout: Duration,
}

impl Default for WarmConfig {
    fn default() -> Self {
        Self {
            max_targets: 6,
            concurrency: 3,
            timeout: Duration::from_secs(15),
        }
    }
}

/// All engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub probe: ProbeConfig,
    pub orchestrator: OrchestratorConfig,
    pub cache: CacheConfig,
    pub cleanup: CleanupConfig,
    pub retry: RetryConfig,
    pub warm: WarmConfig,
}

impl EngineConfig {
    pub fn set_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe.timeout = timeout;
        self
    }

    pub fn set_concurrency(mut self, concurrency: usize) -> Self {
        self.orchestrator.concurrency = concurrency.max(1);
        self
    }

    pub fn set_probe_cid(mut self, cid: impl Into<String>) -> Self {
        self.orchestrator.probe_cid = cid.into();
        self
    }

    pub fn set_cache_expiry(mut self, expiry: Duration) -> Self {
        self.cache.expiry = expiry;
        self
    }

    pub fn set_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn set_cleanup(mut self, cleanup: CleanupConfig) -> Self {
        self.cleanup = cleanup;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.orchestrator.concurrency, 4);
        assert_eq!(cfg.cache.expiry, Duration::from_secs(600));
        assert_eq!(cfg.retry.max_attempts, 6);
        assert!(cfg.retry.base_delay <= cfg.retry.max_delay);
        assert!(cfg.probe.range_fallback);
    }

    #[test]
    fn builder_overrides() {
        let cfg = EngineConfig::default()
            .set_probe_timeout(Duration::from_millis(500))
            .set_concurrency(0)
            .set_probe_cid("QmOther")
            .set_cache_expiry(Duration::from_secs(30));
        assert_eq!(cfg.probe.timeout, Duration::from_millis(500));
        assert_eq!(cfg.orchestrator.concurrency, 1, "concurrency is clamped to 1");
        assert_eq!(cfg.orchestrator.probe_cid, "QmOther");
        assert_eq!(cfg.cache.expiry, Duration::from_secs(30));
    }
}
