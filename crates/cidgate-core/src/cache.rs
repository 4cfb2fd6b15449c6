//! Versioned, expiring cache of the latest full probe run.
//!
//! One [`ProbeRun`] is stored under [`keys::PROBE_RUN`] inside an envelope
//! carrying its version, timestamp and result count. Large runs are stored
//! gzip-compressed and base64-encoded; if compression fails the run is
//! stored as plain JSON. Every write is read back and checked.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use cidgate_types::ProbeRun;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::GatewayError;
use crate::store::{KvStore, keys};

/// Cache version for a catalogue fingerprint.
///
/// Changes whenever the crate is upgraded or the set of catalogued endpoint
/// URLs changes.
pub fn cache_version(fingerprint: &str) -> String {
    format!("{}+{fingerprint}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Encoding {
    Json,
    Gzip,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    version: String,
    timestamp: i64,
    count: usize,
    encoding: Encoding,
    payload: String,
}

/// A cache hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLookup {
    pub run: ProbeRun,
    pub age_secs: u64,
    /// Always `false` for a hit; expired entries come back as
    /// [`CacheMiss::Expired`].
    pub is_expired: bool,
}

/// Why `load` found nothing usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum CacheMiss {
    Absent,
    Unparsable,
    VersionMismatch,
    FutureTimestamp,
    Expired,
}

fn compress(json: &str) -> Result<String, GatewayError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(json.as_bytes())
        .map_err(|e| GatewayError::CacheEncoding(e.to_string()))?;
    let bytes = encoder
        .finish()
        .map_err(|e| GatewayError::CacheEncoding(e.to_string()))?;
    Ok(STANDARD.encode(bytes))
}

fn decompress(payload: &str) -> Option<String> {
    let bytes = STANDARD.decode(payload).ok()?;
    let mut json = String::new();
    GzDecoder::new(bytes.as_slice()).read_to_string(&mut json).ok()?;
    Some(json)
}

fn decode(raw: &str) -> Result<(Envelope, ProbeRun), CacheMiss> {
    let envelope: Envelope = serde_json::from_str(raw).map_err(|_| CacheMiss::Unparsable)?;
    let json = match envelope.encoding {
        Encoding::Json => envelope.payload.clone(),
        Encoding::Gzip => decompress(&envelope.payload).ok_or(CacheMiss::Unparsable)?,
    };
    let run: ProbeRun = serde_json::from_str(&json).map_err(|_| CacheMiss::Unparsable)?;
    Ok((envelope, run))
}

#[derive(Clone)]
pub struct ResultCache {
    store: Arc<dyn KvStore>,
    config: CacheConfig,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ResultCache {
    pub fn new(store: Arc<dyn KvStore>, config: CacheConfig) -> Self {
        Self { store, config }
    }

    /// Store `run` as the current probe run, then read it back.
    ///
    /// Returns [`GatewayError::CacheWriteMismatch`] when the read-back does
    /// not hold the number of results that was written.
    pub async fn save(&self, run: &ProbeRun) -> Result<(), GatewayError> {
        let json = serde_json::to_string(run)?;
        let (encoding, payload) = if json.len() > self.config.compress_threshold {
            match compress(&json) {
                Ok(packed) => (Encoding::Gzip, packed),
                Err(e) => {
                    warn!(error = %e, "compression failed; caching plain JSON");
                    (Encoding::Json, json)
                }
            }
        } else {
            (Encoding::Json, json)
        };

        let envelope = Envelope {
            version: run.version.clone(),
            timestamp: run.timestamp,
            count: run.results.len(),
            encoding,
            payload,
        };
        self.store
            .put(keys::PROBE_RUN, serde_json::to_string(&envelope)?)
            .await?;

        let actual = match self.store.get(keys::PROBE_RUN).await? {
            Some(raw) => decode(&raw).map(|(_, r)| r.results.len()).unwrap_or(0),
            None => 0,
        };
        if actual != run.results.len() {
            return Err(GatewayError::CacheWriteMismatch {
                expected: run.results.len(),
                actual,
            });
        }
        debug!(results = actual, ?encoding, "probe run cached");
        Ok(())
    }

    /// The cached run if it is current for `version` and not expired.
    pub async fn load(&self, version: &str) -> Result<CacheLookup, CacheMiss> {
        self.load_at(version, crate::now_ms()).await
    }

    /// [`ResultCache::load`] against an explicit clock reading.
    pub async fn load_at(&self, version: &str, now_ms: i64) -> Result<CacheLookup, CacheMiss> {
        let raw = match self.store.get(keys::PROBE_RUN).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Err(CacheMiss::Absent),
            Err(e) => {
                warn!(error = %e, "failed to read cached probe run");
                return Err(CacheMiss::Absent);
            }
        };
        let (envelope, run) = decode(&raw).inspect_err(|_| {
            warn!("cached probe run is unreadable; ignoring it");
        })?;

        if envelope.version != version || run.version != version {
            debug!(cached = %envelope.version, current = %version, "cached probe run is stale");
            return Err(CacheMiss::VersionMismatch);
        }
        if envelope.timestamp > now_ms {
            warn!(timestamp = envelope.timestamp, now_ms, "cached probe run is from the future");
            return Err(CacheMiss::FutureTimestamp);
        }
        let age = Duration::from_millis(u64::try_from(now_ms - envelope.timestamp).unwrap_or(0));
        if age >= self.config.expiry {
            return Err(CacheMiss::Expired);
        }

        Ok(CacheLookup {
            run,
            age_secs: age.as_secs(),
            is_expired: false,
        })
    }

    /// Drop the cached run, forcing the next lookup to miss.
    pub async fn invalidate(&self) -> Result<(), GatewayError> {
        self.store.delete(keys::PROBE_RUN).await?;
        info!("probe run cache invalidated");
        Ok(())
    }
}
