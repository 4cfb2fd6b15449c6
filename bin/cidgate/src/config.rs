//! CLI configuration, loaded from environment variables at startup.

use std::time::Duration;

use cidgate_core::EngineConfig;
use cidgate_core::config::DEFAULT_PROBE_CID;

/// Runtime configuration for the `cidgate` binary.
///
/// Every field has a default so the tool works without any environment
/// variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// sqlx SQLite URL (default: `"sqlite://cidgate.db"`).
    pub database_url: String,

    /// `tracing` filter string, e.g. `"info"` or `"cidgate_core=debug"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// CID probed by sweeps and rankings.
    pub probe_cid: String,

    pub probe_timeout: Duration,

    /// Endpoints probed at once.
    pub concurrency: usize,

    pub cache_expiry: Duration,

    pub retry_enabled: bool,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    /// Compare the full object digest with the recorded hash.
    pub strong_verification: bool,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            database_url: env_or("CIDGATE_DATABASE_URL", "sqlite://cidgate.db"),
            log_level: env_or("CIDGATE_LOG", "info"),
            log_json: env_flag("CIDGATE_LOG_JSON", false),
            probe_cid: env_or("CIDGATE_PROBE_CID", DEFAULT_PROBE_CID),
            probe_timeout: Duration::from_millis(parse_env("CIDGATE_PROBE_TIMEOUT_MS", 8_000)),
            concurrency: parse_env("CIDGATE_CONCURRENCY", 4),
            cache_expiry: Duration::from_secs(parse_env("CIDGATE_CACHE_EXPIRY_SECS", 600)),
            retry_enabled: env_flag("CIDGATE_RETRY_ENABLED", true),
            retry_max_attempts: parse_env("CIDGATE_RETRY_MAX_ATTEMPTS", 6),
            retry_base_delay: Duration::from_millis(parse_env("CIDGATE_RETRY_BASE_MS", 3_000)),
            retry_max_delay: Duration::from_secs(parse_env("CIDGATE_RETRY_MAX_SECS", 300)),
            strong_verification: env_flag("CIDGATE_STRONG_VERIFY", false),
        }
    }

    /// Engine configuration with the environment overrides applied.
    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = EngineConfig::default()
            .set_probe_timeout(self.probe_timeout)
            .set_concurrency(self.concurrency)
            .set_probe_cid(self.probe_cid.clone())
            .set_cache_expiry(self.cache_expiry);
        engine.retry.enabled = self.retry_enabled;
        engine.retry.max_attempts = self.retry_max_attempts;
        engine.retry.base_delay = self.retry_base_delay;
        engine.retry.max_delay = self.retry_max_delay;
        engine.retry.strong_verification = self.strong_verification;
        engine
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_carries_overrides() {
        let cfg = Config {
            concurrency: 0,
            retry_max_attempts: 3,
            strong_verification: true,
            ..Config::from_env()
        };
        let engine = cfg.engine_config();
        assert_eq!(engine.orchestrator.concurrency, 1, "concurrency is clamped");
        assert_eq!(engine.retry.max_attempts, 3);
        assert!(engine.retry.strong_verification);
        assert_eq!(engine.probe.timeout, cfg.probe_timeout);
    }

    #[test]
    fn unparsable_values_fall_back() {
        assert_eq!(parse_env("CIDGATE_TEST_UNSET_VALUE", 7u32), 7);
        assert!(env_flag("CIDGATE_TEST_UNSET_FLAG", true));
    }
}
