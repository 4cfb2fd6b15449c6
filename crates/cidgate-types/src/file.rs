use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Verification state of an uploaded file.
///
/// `Pending → Verifying → {Ok | Pending (retry) | Failed}`. `Ok` and `Failed`
/// are terminal for one upload generation; a re-upload resets to `Pending`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VerifyStatus {
    #[default]
    Pending,
    Verifying,
    Ok,
    Failed,
}

impl VerifyStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, VerifyStatus::Ok | VerifyStatus::Failed)
    }
}

/// The slice of a stored file record that verification reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub cid: String,
    /// Hex SHA-256 of the content, when strong verification is possible.
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub verify_status: VerifyStatus,
    #[serde(default)]
    pub verify_message: Option<String>,
    /// Epoch milliseconds of the last `verify_status` change.
    #[serde(default)]
    pub verify_updated_at: Option<i64>,
}

impl FileRecord {
    /// A freshly uploaded file awaiting verification.
    pub fn new(id: impl Into<String>, cid: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            cid: cid.into(),
            hash: None,
            verified: false,
            verify_status: VerifyStatus::Pending,
            verify_message: None,
            verify_updated_at: None,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    pub fn apply(&mut self, patch: &FilePatch, now_ms: i64) {
        if let Some(verified) = patch.verified {
            self.verified = verified;
        }
        if let Some(status) = patch.verify_status {
            if status != self.verify_status {
                self.verify_updated_at = Some(now_ms);
            }
            self.verify_status = status;
        }
        if let Some(message) = &patch.verify_message {
            self.verify_message = Some(message.clone());
        }
    }
}

/// Partial update produced by the verification scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_status: Option<VerifyStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify_message: Option<String>,
}

impl FilePatch {
    pub fn status(status: VerifyStatus, message: impl Into<String>) -> Self {
        Self {
            verified: Some(status == VerifyStatus::Ok),
            verify_status: Some(status),
            verify_message: Some(message.into()),
        }
    }
}

/// Persisted retry state for one file.
///
/// Invariant: `attempts_made <= max_attempts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRetryEntry {
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Epoch milliseconds of the next scheduled attempt.
    pub next_at: i64,
    pub cid: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}
