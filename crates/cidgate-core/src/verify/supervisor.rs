use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use cidgate_types::{FilePatch, FileRecord, VerifyRetryEntry, VerifyStatus};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::retry_delay;
use super::{HASH_MISMATCH_MESSAGE, ResyncReport, RetryBook, RetryStep, Verifier, VerifyOutcome};
use crate::config::RetryConfig;
use crate::error::GatewayError;
use crate::store::{FileStore, KvStore};

const COMMAND_QUEUE_CAPACITY: usize = 64;
/// Parked deadline for an empty timer queue.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Commands sent to the supervisor loop.
#[derive(Debug)]
enum Command {
    /// Arm the timer for `id`, replacing any timer already armed for it.
    Arm { id: String, delay: Duration },
    Disarm { id: String },
    Armed { reply: oneshot::Sender<Vec<String>> },
}

struct Inner {
    config: RetryConfig,
    files: Arc<dyn FileStore>,
    book: RetryBook,
    verifier: Arc<dyn Verifier>,
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
}

/// Handle to the verification retry scheduler.
///
/// A single supervisor task owns every timer: a min-heap of due times plus
/// one cancellation token per armed file id. Arming an id that already has
/// a timer cancels the old one first, so at most one timer per file exists.
///
/// ```rust,ignore
/// let scheduler = VerifyScheduler::start(config.retry, files, kv, service);
/// scheduler.resync_timers().await?;
/// scheduler.verify_now("file-1").await?;
/// ```
#[derive(Clone)]
pub struct VerifyScheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for VerifyScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyScheduler")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl VerifyScheduler {
    /// Spawn the supervisor loop and return a handle to it.
    pub fn start(
        config: RetryConfig,
        files: Arc<dyn FileStore>,
        store: Arc<dyn KvStore>,
        verifier: Arc<dyn Verifier>,
    ) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let inner = Arc::new(Inner {
            config,
            files,
            book: RetryBook::new(store),
            verifier,
            commands,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(supervise(Arc::clone(&inner), rx));
        Self { inner }
    }

    /// Persist a retry entry for `file` and arm its timer.
    ///
    /// Returns `Ok(None)` without doing anything when retries are disabled or
    /// `attempts_made` already reached the limit.
    pub async fn schedule_retry(
        &self,
        file: &FileRecord,
        attempts_made: u32,
        last_error: Option<String>,
    ) -> Result<Option<VerifyRetryEntry>, GatewayError> {
        self.inner.schedule_retry(file, attempts_made, last_error).await
    }

    /// Run the retry that is due for `id`.
    pub async fn run_scheduled_retry(&self, id: &str) -> Result<RetryStep, GatewayError> {
        let cancel = self.inner.shutdown.child_token();
        self.inner.run_scheduled_retry(id, &cancel).await
    }

    /// First verification of a freshly recorded file. Any previous retry
    /// cycle for `id` is discarded.
    pub async fn verify_now(&self, id: &str) -> Result<RetryStep, GatewayError> {
        self.inner.verify_now(id).await
    }

    /// Rehydrate persisted retries after a restart and enrol files that
    /// slipped out of the retry cycle.
    pub async fn resync_timers(&self) -> Result<ResyncReport, GatewayError> {
        self.inner.resync_timers().await
    }

    /// Drop all retry state for `id`, e.g. after the file was deleted.
    pub async fn forget(&self, id: &str) -> Result<(), GatewayError> {
        self.inner.disarm(id).await?;
        self.inner.book.remove(id).await?;
        Ok(())
    }

    /// File ids with an armed timer, sorted.
    pub async fn armed_timers(&self) -> Result<Vec<String>, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.inner.send(Command::Armed { reply }).await?;
        rx.await.map_err(|_| GatewayError::SchedulerShutdown)
    }

    pub async fn is_armed(&self, id: &str) -> Result<bool, GatewayError> {
        Ok(self.armed_timers().await?.iter().any(|armed| armed == id))
    }

    /// Stop the supervisor. Armed timers are dropped; persisted entries are
    /// kept for the next [`VerifyScheduler::resync_timers`].
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

async fn supervise(inner: Arc<Inner>, mut rx: mpsc::Receiver<Command>) {
    let mut due: BinaryHeap<Reverse<(Instant, u64, String)>> = BinaryHeap::new();
    let mut armed: HashMap<String, (u64, CancellationToken)> = HashMap::new();
    let mut generation = 0u64;

    loop {
        let next_due = due.peek().map(|Reverse((at, _, _))| *at);
        let wake_at = next_due.unwrap_or_else(|| Instant::now() + IDLE_WAIT);
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,

            cmd = rx.recv() => match cmd {
                None => break,
                Some(Command::Arm { id, delay }) => {
                    generation += 1;
                    let token = inner.shutdown.child_token();
                    if let Some((_, old)) = armed.insert(id.clone(), (generation, token)) {
                        old.cancel();
                        debug!(id = %id, "replaced armed verification timer");
                    }
                    due.push(Reverse((Instant::now() + delay, generation, id)));
                }
                Some(Command::Disarm { id }) => {
                    if let Some((_, token)) = armed.remove(&id) {
                        token.cancel();
                    }
                }
                Some(Command::Armed { reply }) => {
                    let mut ids: Vec<String> = armed.keys().cloned().collect();
                    ids.sort();
                    let _ = reply.send(ids);
                }
            },

            _ = sleep_until(wake_at), if next_due.is_some() => {
                let now = Instant::now();
                while due.peek().is_some_and(|Reverse((at, _, _))| *at <= now) {
                    let Some(Reverse((_, fired, id))) = due.pop() else {
                        break;
                    };
                    // Stale heap entries belong to replaced or disarmed timers.
                    let current = armed.get(&id).is_some_and(|(g, _)| *g == fired);
                    if !current {
                        continue;
                    }
                    let Some((_, token)) = armed.remove(&id) else {
                        continue;
                    };
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        if let Err(e) = inner.run_scheduled_retry(&id, &token).await {
                            warn!(id = %id, error = %e, "scheduled verification failed");
                        }
                    });
                }
            }
        }
    }
    info!(armed = armed.len(), "verification scheduler stopped");
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl Inner {
    async fn send(&self, command: Command) -> Result<(), GatewayError> {
        if self.shutdown.is_cancelled() {
            return Err(GatewayError::SchedulerShutdown);
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| GatewayError::SchedulerShutdown)
    }

    async fn arm(&self, id: &str, delay: Duration) -> Result<(), GatewayError> {
        self.send(Command::Arm {
            id: id.to_owned(),
            delay,
        })
        .await
    }

    async fn disarm(&self, id: &str) -> Result<(), GatewayError> {
        self.send(Command::Disarm { id: id.to_owned() }).await
    }

    async fn patch(
        &self,
        id: &str,
        status: VerifyStatus,
        message: impl Into<String>,
    ) -> Result<Option<FileRecord>, GatewayError> {
        Ok(self
            .files
            .apply_patch(id, &FilePatch::status(status, message))
            .await?)
    }

    /// Drop the persisted entry and any armed timer for `id`.
    async fn release(&self, id: &str) -> Result<(), GatewayError> {
        self.book.remove(id).await?;
        if self.disarm(id).await.is_err() {
            debug!(id, "scheduler stopped; no timer to disarm");
        }
        Ok(())
    }

    fn is_stuck(&self, file: &FileRecord, now_ms: i64) -> bool {
        file.verify_updated_at
            .is_none_or(|at| now_ms - at > millis(self.config.stuck_window))
    }

    async fn schedule_retry(
        &self,
        file: &FileRecord,
        attempts_made: u32,
        last_error: Option<String>,
    ) -> Result<Option<VerifyRetryEntry>, GatewayError> {
        if !self.config.enabled {
            debug!(id = %file.id, "verification retries disabled");
            return Ok(None);
        }
        if attempts_made >= self.config.max_attempts {
            debug!(id = %file.id, attempts_made, "no verification attempts left");
            return Ok(None);
        }

        let delay = retry_delay(&self.config, attempts_made);
        let entry = VerifyRetryEntry {
            attempts_made,
            max_attempts: self.config.max_attempts,
            next_at: crate::now_ms().saturating_add(millis(delay)),
            cid: file.cid.clone(),
            hash: file.hash.clone(),
            last_error,
        };
        self.book.put(&file.id, entry.clone()).await?;

        let secs = delay.as_millis().div_ceil(1000);
        self.patch(
            &file.id,
            VerifyStatus::Pending,
            format!(
                "Not available yet; retrying in {secs} seconds (attempt {} of {})",
                attempts_made + 1,
                self.config.max_attempts
            ),
        )
        .await?;
        self.arm(&file.id, delay).await?;

        info!(
            id = %file.id,
            cid = %file.cid,
            attempts_made,
            delay_ms = millis(delay),
            "verification retry scheduled"
        );
        Ok(Some(entry))
    }

    /// One pass: mark verifying, re-propagate, check, and record terminal
    /// outcomes on the file. Transient failures are left to the caller.
    async fn attempt(
        &self,
        file: &FileRecord,
        cancel: &CancellationToken,
    ) -> Result<VerifyOutcome, GatewayError> {
        self.patch(&file.id, VerifyStatus::Verifying, "Checking availability")
            .await?;
        self.verifier.propagate(&file.cid).await;

        let hash = file
            .hash
            .as_deref()
            .filter(|_| self.config.strong_verification);
        let outcome = self.verifier.verify(&file.cid, hash, cancel).await;

        match &outcome {
            VerifyOutcome::Available { url } => {
                self.patch(&file.id, VerifyStatus::Ok, format!("Available via {url}"))
                    .await?;
                info!(id = %file.id, url = %url, "file verified");
            }
            VerifyOutcome::HashMismatch { expected, actual } => {
                self.patch(
                    &file.id,
                    VerifyStatus::Failed,
                    format!("{HASH_MISMATCH_MESSAGE}: expected {expected}, got {actual}"),
                )
                .await?;
                warn!(
                    id = %file.id,
                    expected = %expected,
                    actual = %actual,
                    "content hash mismatch"
                );
            }
            VerifyOutcome::Unavailable { reason } => {
                debug!(id = %file.id, reason = %reason, "file not available yet");
            }
        }
        Ok(outcome)
    }

    /// Settle an attempt numbered `attempts_made` (1-based) that came back
    /// with `outcome`.
    async fn settle(
        &self,
        file: &FileRecord,
        attempts_made: u32,
        outcome: VerifyOutcome,
        cancel: &CancellationToken,
    ) -> Result<RetryStep, GatewayError> {
        match outcome {
            VerifyOutcome::Available { .. } => {
                self.release(&file.id).await?;
                Ok(RetryStep::Verified)
            }
            VerifyOutcome::HashMismatch { .. } => {
                self.release(&file.id).await?;
                Ok(RetryStep::Failed)
            }
            VerifyOutcome::Unavailable { .. } if cancel.is_cancelled() => {
                self.patch(&file.id, VerifyStatus::Pending, "Verification interrupted")
                    .await?;
                Ok(RetryStep::Interrupted)
            }
            VerifyOutcome::Unavailable { reason } => {
                if self.config.enabled && attempts_made < self.config.max_attempts {
                    let entry = self.schedule_retry(file, attempts_made, Some(reason)).await?;
                    return Ok(entry.map_or(RetryStep::Exhausted, RetryStep::Rescheduled));
                }
                self.release(&file.id).await?;
                self.patch(
                    &file.id,
                    VerifyStatus::Failed,
                    format!("Not available after {attempts_made} attempts: {reason}"),
                )
                .await?;
                warn!(
                    id = %file.id,
                    attempts_made,
                    reason = %reason,
                    "verification attempts exhausted"
                );
                Ok(RetryStep::Exhausted)
            }
        }
    }

    async fn verify_now(&self, id: &str) -> Result<RetryStep, GatewayError> {
        self.disarm(id).await?;
        self.book.remove(id).await?;
        let Some(file) = self.files.get(id).await? else {
            return Ok(RetryStep::Cleared);
        };
        let cancel = self.shutdown.child_token();
        let outcome = self.attempt(&file, &cancel).await?;
        self.settle(&file, 1, outcome, &cancel).await
    }

    async fn run_scheduled_retry(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<RetryStep, GatewayError> {
        let Some(file) = self.files.get(id).await? else {
            debug!(id, "file disappeared; dropping retry state");
            self.book.remove(id).await?;
            return Ok(RetryStep::Cleared);
        };
        let now = crate::now_ms();
        match file.verify_status {
            // Settled while the timer was pending.
            VerifyStatus::Ok | VerifyStatus::Failed => {
                self.book.remove(id).await?;
                return Ok(RetryStep::Cleared);
            }
            VerifyStatus::Verifying if !self.is_stuck(&file, now) => {
                if let Some(mut entry) = self.book.get(id).await {
                    entry.next_at = now.saturating_add(millis(self.config.busy_delay));
                    self.book.put(id, entry).await?;
                }
                self.arm(id, self.config.busy_delay).await?;
                debug!(id, "verification already in flight; looking again later");
                return Ok(RetryStep::Busy);
            }
            _ => {}
        }

        let attempts_made = self.book.get(id).await.map_or(0, |e| e.attempts_made);
        let outcome = self.attempt(&file, cancel).await?;
        self.settle(&file, attempts_made + 1, outcome, cancel).await
    }

    async fn resync_timers(&self) -> Result<ResyncReport, GatewayError> {
        let mut report = ResyncReport::default();
        let now = crate::now_ms();
        let files: HashMap<String, FileRecord> = self
            .files
            .list()
            .await?
            .into_iter()
            .map(|f| (f.id.clone(), f))
            .collect();
        let mut rearmed = HashSet::new();

        for (id, entry) in self.book.load().await {
            let in_cycle = files.get(&id).is_some_and(|f| {
                matches!(f.verify_status, VerifyStatus::Pending | VerifyStatus::Verifying)
            });
            if in_cycle {
                let wait = u64::try_from(entry.next_at - now).unwrap_or(0);
                self.arm(&id, Duration::from_millis(wait)).await?;
                rearmed.insert(id);
            } else {
                self.book.remove(&id).await?;
                report.dropped += 1;
            }
        }
        report.rearmed = rearmed.len();

        for file in files.values() {
            if rearmed.contains(&file.id) || !self.needs_enrolment(file, now) {
                continue;
            }
            if self
                .schedule_retry(file, 0, file.verify_message.clone())
                .await?
                .is_some()
            {
                report.enrolled += 1;
            }
        }

        info!(
            rearmed = report.rearmed,
            enrolled = report.enrolled,
            dropped = report.dropped,
            "verification timers resynced"
        );
        Ok(report)
    }

    fn needs_enrolment(&self, file: &FileRecord, now_ms: i64) -> bool {
        match file.verify_status {
            VerifyStatus::Ok => false,
            VerifyStatus::Pending => true,
            VerifyStatus::Verifying => self.is_stuck(file, now_ms),
            VerifyStatus::Failed => {
                let permanent = file
                    .verify_message
                    .as_deref()
                    .is_some_and(|m| m.starts_with(HASH_MISMATCH_MESSAGE));
                let recent = file
                    .verify_updated_at
                    .is_some_and(|at| now_ms - at <= millis(self.config.failed_retry_window));
                !permanent && recent
            }
        }
    }
}
