//! Gateway health probing, scoring, caching and selection for
//! content-addressed storage, with an upload-verification retry scheduler
//! and a propagation warmer.
//!
//! [`GatewayService`] is the entry point: construct it once per process with
//! a [`KvStore`] and a [`GatewayClient`], and share it behind an `Arc`.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cidgate_core::{EngineConfig, GatewayService, HttpGatewayClient, MemoryStore};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), cidgate_core::GatewayError> {
//! let config = EngineConfig::default();
//! let client = Arc::new(HttpGatewayClient::new(config.probe.clone())?);
//! let service = GatewayService::open(config, Arc::new(MemoryStore::new()), client).await;
//!
//! let ranked = service.ranked_endpoints(false).await;
//! let best = service.best_endpoint("QmUNLLsPACCz1vLxQVkXqqLX5R1X345qqfHbsf67hvA3Nn").await;
//! # let _ = (ranked, best);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cleanup;
pub mod client;
pub mod config;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod registry;
pub mod selector;
pub mod service;
pub mod store;
pub mod verify;
pub mod warmer;

#[cfg(test)]
pub(crate) mod testing;

pub use cidgate_types as types;

pub use cache::{CacheLookup, CacheMiss, ResultCache};
pub use cleanup::{CleanupCandidate, CleanupPolicy, CleanupReason};
pub use client::{GatewayClient, HttpGatewayClient};
pub use config::{
    CacheConfig, CleanupConfig, EngineConfig, OrchestratorConfig, ProbeConfig, RetryConfig,
    WarmConfig,
};
pub use error::{GatewayError, StoreError};
pub use ledger::HealthLedger;
pub use orchestrator::{ProbeOrchestrator, RaceOutcome};
pub use registry::{EndpointRegistry, Merged};
pub use selector::{Intent, Selector};
pub use service::GatewayService;
pub use store::{FileStore, KvStore, MemoryFileStore, MemoryStore};
pub use verify::{ResyncReport, RetryStep, Verifier, VerifyOutcome, VerifyScheduler};
pub use warmer::PropagationWarmer;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
