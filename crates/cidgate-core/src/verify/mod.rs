//! Upload verification with persisted, exponentially backed-off retries.
//!
//! Per file the state machine is
//! `pending → verifying → {ok | pending (retry) | failed}`. Retry state is
//! kept in a [`VerifyRetryEntry`] map under [`keys::VERIFY_RETRY`] so a
//! restarted process can pick up where it left off via
//! [`VerifyScheduler::resync_timers`].

mod backoff;
mod supervisor;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cidgate_types::VerifyRetryEntry;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::store::{self, KvStore, keys};

pub use backoff::{backoff_delay, jitter, retry_delay};
pub use supervisor::VerifyScheduler;

/// Prefix of the message written when content fails strong verification.
pub const HASH_MISMATCH_MESSAGE: &str = "Content hash mismatch";

/// Result of one verification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Available { url: String },
    /// Not reachable right now; worth retrying.
    Unavailable { reason: String },
    /// The served bytes do not hash to the recorded value. Never retried.
    HashMismatch { expected: String, actual: String },
}

impl VerifyOutcome {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::HashMismatch { .. })
    }
}

/// Availability check the scheduler runs on every attempt.
#[async_trait]
pub trait Verifier: Send + Sync + 'static {
    /// Nudge endpoints to fetch `cid`. Must not block on the outcome.
    async fn propagate(&self, cid: &str);

    /// One verification pass. When `hash` is given, the content digest must
    /// match it as well.
    async fn verify(
        &self,
        cid: &str,
        hash: Option<&str>,
        cancel: &CancellationToken,
    ) -> VerifyOutcome;
}

/// What a scheduled run (or an immediate check) ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStep {
    /// The file is gone or already verified; its retry state was dropped.
    Cleared,
    /// Another check is in flight; looked again later without counting an attempt.
    Busy,
    Verified,
    /// Permanent failure.
    Failed,
    /// Still unavailable; the next attempt is armed.
    Rescheduled(VerifyRetryEntry),
    /// Still unavailable after the last allowed attempt.
    Exhausted,
    /// The pass was cut short by shutdown; retry state is kept.
    Interrupted,
}

/// Counts from [`VerifyScheduler::resync_timers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ResyncReport {
    pub rearmed: usize,
    pub enrolled: usize,
    pub dropped: usize,
}

/// The persisted retry map.
///
/// Every mutation re-reads the whole map under a lock right before writing,
/// so concurrent updates for different files are never lost.
struct RetryBook {
    store: Arc<dyn KvStore>,
    lock: Mutex<()>,
}

impl RetryBook {
    fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> HashMap<String, VerifyRetryEntry> {
        store::load_json(self.store.as_ref(), keys::VERIFY_RETRY)
            .await
            .unwrap_or_default()
    }

    async fn get(&self, id: &str) -> Option<VerifyRetryEntry> {
        self.load().await.remove(id)
    }

    async fn put(&self, id: &str, entry: VerifyRetryEntry) -> Result<(), GatewayError> {
        let _guard = self.lock.lock().await;
        let mut map = self.load().await;
        map.insert(id.to_owned(), entry);
        store::save_json(self.store.as_ref(), keys::VERIFY_RETRY, &map).await
    }

    async fn remove(&self, id: &str) -> Result<bool, GatewayError> {
        let _guard = self.lock.lock().await;
        let mut map = self.load().await;
        if map.remove(id).is_none() {
            return Ok(false);
        }
        store::save_json(self.store.as_ref(), keys::VERIFY_RETRY, &map).await?;
        Ok(true)
    }
}
