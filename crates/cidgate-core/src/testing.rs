//! Test doubles shared by the unit tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cidgate_types::{Endpoint, EndpointOrigin, ErrorType, ProbeResult, Region, WarmResult};
use tokio_util::sync::CancellationToken;

use crate::client::GatewayClient;
use crate::error::{GatewayError, StoreError};
use crate::registry::{EndpointRegistry, default_endpoints};
use crate::store::{self, KvStore, MemoryStore, keys};

pub fn endpoint(url: &str, priority: u32) -> Endpoint {
    Endpoint {
        url: url.to_owned(),
        name: url.to_owned(),
        region: Region::Auto,
        priority,
        icon: None,
        origin: EndpointOrigin::BuiltIn,
    }
}

/// Persist `endpoints` as the whole catalogue, with every built-in marked
/// as removed so loading does not merge them back in.
pub async fn seed_catalogue(store: &dyn KvStore, endpoints: Vec<Endpoint>) {
    EndpointRegistry::from_endpoints(endpoints)
        .save(store)
        .await
        .unwrap();
    let builtins: Vec<String> = default_endpoints().into_iter().map(|d| d.url).collect();
    store::save_json(store, keys::REMOVED_BUILTINS, &builtins)
        .await
        .unwrap();
}

pub fn ok_result(ep: &Endpoint, latency_ms: u64) -> ProbeResult {
    ProbeResult {
        url: ep.url.clone(),
        name: ep.name.clone(),
        available: true,
        latency_ms: Some(latency_ms),
        error_type: ErrorType::None,
        status_code: Some(200),
        health_score: 0,
    }
}

pub fn fail_result(ep: &Endpoint, error_type: ErrorType) -> ProbeResult {
    ProbeResult::unavailable(&ep.url, &ep.name, error_type, None)
}

/// Scripted behaviour of one endpoint.
#[derive(Debug, Clone)]
pub enum Script {
    Ok(Duration),
    Fail(Duration, ErrorType),
}

/// In-memory [`GatewayClient`] driven by per-endpoint scripts.
///
/// Each probe pops the next script for its endpoint; the last script
/// repeats. Endpoints without a script fail with a network error.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    digests: Mutex<HashMap<String, String>>,
    cache_hits: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
    warm_calls: Mutex<Vec<String>>,
    cancelled: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, url: &str, steps: impl IntoIterator<Item = Script>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_owned(), steps.into_iter().collect());
        self
    }

    pub fn ok(self, url: &str, latency_ms: u64) -> Self {
        self.script(url, [Script::Ok(Duration::from_millis(latency_ms))])
    }

    pub fn fail(self, url: &str, latency_ms: u64, error: ErrorType) -> Self {
        self.script(url, [Script::Fail(Duration::from_millis(latency_ms), error)])
    }

    pub fn digest(self, url: &str, digest: &str) -> Self {
        self.digests
            .lock()
            .unwrap()
            .insert(url.to_owned(), digest.to_owned());
        self
    }

    pub fn cache_hit(self, url: &str) -> Self {
        self.cache_hits.lock().unwrap().insert(url.to_owned());
        self
    }

    pub fn set_script(&self, url: &str, steps: impl IntoIterator<Item = Script>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_owned(), steps.into_iter().collect());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn warm_calls(&self) -> Vec<String> {
        self.warm_calls.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_script(&self, url: &str) -> Script {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(url) {
            Some(steps) if steps.len() > 1 => steps.pop_front().unwrap(),
            Some(steps) => steps
                .front()
                .cloned()
                .unwrap_or(Script::Fail(Duration::ZERO, ErrorType::Network)),
            None => Script::Fail(Duration::ZERO, ErrorType::Network),
        }
    }

    async fn run_script(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Option<(bool, Duration, ErrorType)> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let (ok, delay, error) = match self.next_script(url) {
            Script::Ok(d) => (true, d, ErrorType::None),
            Script::Fail(d, e) => (false, d, e),
        };
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep(delay) => Some((ok, delay, error)),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if outcome.is_none() {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
        outcome
    }
}

#[async_trait]
impl GatewayClient for ScriptedClient {
    async fn probe(
        &self,
        endpoint: &Endpoint,
        _cid: &str,
        cancel: &CancellationToken,
    ) -> Option<ProbeResult> {
        self.calls.lock().unwrap().push(endpoint.url.clone());
        let (ok, delay, error) = self.run_script(&endpoint.url, cancel).await?;
        Some(if ok {
            ok_result(endpoint, delay.as_millis() as u64)
        } else {
            fail_result(endpoint, error)
        })
    }

    async fn warm(
        &self,
        endpoint: &Endpoint,
        _cid: &str,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> WarmResult {
        self.warm_calls.lock().unwrap().push(endpoint.url.clone());
        let outcome = self.run_script(&endpoint.url, cancel).await;
        let success = outcome.is_some_and(|(ok, _, _)| ok);
        WarmResult {
            url: endpoint.url.clone(),
            success,
            cache_hit: success && self.cache_hits.lock().unwrap().contains(&endpoint.url),
            latency_ms: outcome.map(|(_, d, _)| d.as_millis() as u64),
            status_code: success.then_some(206),
        }
    }

    async fn fetch_sha256(
        &self,
        endpoint: &Endpoint,
        _cid: &str,
        _cancel: &CancellationToken,
    ) -> Result<String, GatewayError> {
        self.digests
            .lock()
            .unwrap()
            .get(&endpoint.url)
            .cloned()
            .ok_or_else(|| GatewayError::BadStatus {
                url: endpoint.url.clone(),
                status: 404,
            })
    }
}

/// [`KvStore`] that acknowledges every write but silently loses part of the
/// values written under one key.
#[derive(Debug)]
pub struct LossyStore {
    inner: MemoryStore,
    key: &'static str,
    drop_all: bool,
}

impl LossyStore {
    /// Keeps only the first half of each value written under `key`.
    pub fn truncating(key: &'static str) -> Self {
        Self {
            inner: MemoryStore::new(),
            key,
            drop_all: false,
        }
    }

    /// Discards every write to `key`.
    pub fn dropping(key: &'static str) -> Self {
        Self {
            drop_all: true,
            ..Self::truncating(key)
        }
    }
}

#[async_trait]
impl KvStore for LossyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, mut value: String) -> Result<(), StoreError> {
        if key != self.key {
            return self.inner.put(key, value).await;
        }
        if self.drop_all {
            return Ok(());
        }
        let mut cut = value.len() / 2;
        while !value.is_char_boundary(cut) {
            cut -= 1;
        }
        value.truncate(cut);
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }
}
