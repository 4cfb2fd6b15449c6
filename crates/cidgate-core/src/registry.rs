//! Endpoint catalogue: built-in defaults, discovered endpoints and
//! user-added ones, de-duplicated by canonical URL.

use std::collections::BTreeSet;

use cidgate_types::{Endpoint, EndpointDescriptor, EndpointOrigin, Region};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::GatewayError;
use crate::store::{self, KvStore, keys};

/// Content path appended to bare gateway origins.
const CONTENT_PATH: &str = "/ipfs/";

/// First priority handed to discovered endpoints without one.
const DISCOVERED_PRIORITY_BASE: u32 = 50;
/// First priority handed to user-added endpoints without one.
const USER_PRIORITY_BASE: u32 = 100;

/// Canonical form of a gateway URL: lower-case scheme and host, a content
/// path (defaulting to `/ipfs/`) and exactly one trailing slash.
pub fn canonicalize_url(raw: &str) -> Result<String, GatewayError> {
    let invalid = |reason: &str| GatewayError::InvalidUrl {
        url: raw.to_owned(),
        reason: reason.to_owned(),
    };

    let trimmed = raw.trim();
    let (scheme, rest) = trimmed.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
    let scheme = scheme.to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return Err(invalid("scheme must be http or https"));
    }
    if rest.contains(['?', '#']) {
        return Err(invalid("query strings and fragments are not allowed"));
    }

    let (host, path) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };
    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return Err(invalid("missing or malformed host"));
    }

    let path = path.trim_end_matches('/');
    let path = if path.is_empty() {
        CONTENT_PATH.to_owned()
    } else {
        format!("{path}/")
    };

    Ok(format!("{scheme}://{}{path}", host.to_ascii_lowercase()))
}

/// Built-in gateways. Their priorities sit inside the protected range.
pub fn default_endpoints() -> Vec<EndpointDescriptor> {
    let builtin = |name: &str, url: &str, region: Region, priority: u32| EndpointDescriptor {
        name: name.to_owned(),
        url: url.to_owned(),
        region,
        priority: Some(priority),
        icon: None,
    };
    vec![
        builtin("Crust Gateway", "https://gw.crustfiles.app/ipfs/", Region::Auto, 1),
        builtin("Crust IPFS", "https://crustipfs.xyz/ipfs/", Region::Cn, 2),
        builtin("IPFS.io", "https://ipfs.io/ipfs/", Region::Intl, 3),
        builtin("dweb.link", "https://dweb.link/ipfs/", Region::Intl, 4),
        builtin("Cloudflare", "https://cloudflare-ipfs.com/ipfs/", Region::Intl, 5),
        builtin("Pinata", "https://gateway.pinata.cloud/ipfs/", Region::Intl, 6),
        builtin("4EVERLAND", "https://4everland.io/ipfs/", Region::Cn, 7),
        builtin("NFT.Storage", "https://nftstorage.link/ipfs/", Region::Intl, 8),
    ]
}

/// What [`EndpointRegistry::merge`] did with a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Merged {
    Added(Endpoint),
    /// An entry of lower-precedence origin took the descriptor's fields.
    Updated(Endpoint),
    Kept,
}

/// Which origin wins when two sources describe the same URL.
fn precedence(origin: EndpointOrigin) -> u8 {
    match origin {
        EndpointOrigin::BuiltIn => 2,
        EndpointOrigin::Discovered => 1,
        EndpointOrigin::User => 0,
    }
}

fn display_name(name: &str, url: &str) -> String {
    match name.trim() {
        "" => url.to_owned(),
        name => name.to_owned(),
    }
}

/// The known endpoints, ordered by priority and then URL.
///
/// Removed built-ins are remembered so reloading the catalogue does not
/// bring them back.
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    endpoints: Vec<Endpoint>,
    removed_builtins: BTreeSet<String>,
}

impl EndpointRegistry {
    /// Registry holding only the built-in gateways.
    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.seed_builtins();
        registry
    }

    pub fn from_endpoints(endpoints: Vec<Endpoint>) -> Self {
        let mut registry = Self::default();
        for endpoint in endpoints {
            match canonicalize_url(&endpoint.url) {
                Ok(url) if registry.get(&url).is_none() => {
                    registry.endpoints.push(Endpoint { url, ..endpoint });
                }
                Ok(url) => debug!(url = %url, "dropping duplicate catalogue entry"),
                Err(e) => debug!(error = %e, "dropping malformed catalogue entry"),
            }
        }
        registry.sort();
        registry
    }

    /// Load the persisted catalogue and merge the built-ins into it.
    ///
    /// Built-ins win over stored entries for the same URL, except those the
    /// user removed. An absent or unreadable blob yields the built-ins alone.
    pub async fn load(store: &dyn KvStore) -> Self {
        let Some(endpoints) = store::load_json::<Vec<Endpoint>>(store, keys::CATALOGUE).await
        else {
            return Self::with_defaults();
        };
        let mut registry = Self::from_endpoints(endpoints);
        registry.removed_builtins = store::load_json(store, keys::REMOVED_BUILTINS)
            .await
            .unwrap_or_default();
        let seeded = registry.seed_builtins();
        if seeded > 0 {
            info!(seeded, total = registry.len(), "merged built-in endpoints into catalogue");
        }
        registry
    }

    pub async fn save(&self, store: &dyn KvStore) -> Result<(), GatewayError> {
        store::save_json(store, keys::CATALOGUE, &self.endpoints).await?;
        store::save_json(store, keys::REMOVED_BUILTINS, &self.removed_builtins).await
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn get(&self, url: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.url == url)
    }

    /// Add one endpoint. Fails on malformed or already-registered URLs.
    pub fn add(
        &mut self,
        descriptor: EndpointDescriptor,
        origin: EndpointOrigin,
    ) -> Result<Endpoint, GatewayError> {
        let url = canonicalize_url(&descriptor.url)?;
        if self.get(&url).is_some() {
            return Err(GatewayError::DuplicateEndpoint { url });
        }
        let priority = descriptor
            .priority
            .unwrap_or_else(|| self.next_priority(origin));

        let endpoint = Endpoint {
            name: display_name(&descriptor.name, &url),
            url,
            region: descriptor.region,
            priority,
            icon: descriptor.icon,
            origin,
        };
        self.removed_builtins.remove(&endpoint.url);
        self.endpoints.push(endpoint.clone());
        self.sort();
        Ok(endpoint)
    }

    /// Add `descriptor`, or let it overwrite the static fields of an entry
    /// whose origin ranks lower (user-added < discovered < built-in).
    pub fn merge(
        &mut self,
        descriptor: EndpointDescriptor,
        origin: EndpointOrigin,
    ) -> Result<Merged, GatewayError> {
        let url = canonicalize_url(&descriptor.url)?;
        let Some(idx) = self.endpoints.iter().position(|e| e.url == url) else {
            return self.add(descriptor, origin).map(Merged::Added);
        };
        if precedence(origin) <= precedence(self.endpoints[idx].origin) {
            return Ok(Merged::Kept);
        }

        let priority = descriptor
            .priority
            .unwrap_or_else(|| self.next_priority(origin));
        let existing = &mut self.endpoints[idx];
        existing.name = display_name(&descriptor.name, &url);
        existing.region = descriptor.region;
        existing.priority = priority;
        existing.icon = descriptor.icon;
        existing.origin = origin;
        let updated = existing.clone();
        self.sort();
        Ok(Merged::Updated(updated))
    }

    /// Merge a discovered list. Discovered fields replace those of
    /// user-added entries; built-ins keep theirs.
    ///
    /// Returns the number of endpoints added or updated.
    pub fn merge_discovered(&mut self, descriptors: Vec<EndpointDescriptor>) -> usize {
        let (mut added, mut updated) = (0, 0);
        for descriptor in descriptors {
            match self.merge(descriptor, EndpointOrigin::Discovered) {
                Ok(Merged::Added(_)) => added += 1,
                Ok(Merged::Updated(_)) => updated += 1,
                Ok(Merged::Kept) => {}
                Err(e) => debug!(error = %e, "skipping discovered endpoint"),
            }
        }
        if added + updated > 0 {
            info!(added, updated, total = self.endpoints.len(), "merged discovered endpoints");
        }
        added + updated
    }

    pub fn remove(&mut self, url: &str) -> Result<Endpoint, GatewayError> {
        let url = canonicalize_url(url)?;
        let idx = self
            .endpoints
            .iter()
            .position(|e| e.url == url)
            .ok_or(GatewayError::EndpointNotFound { url })?;
        let removed = self.endpoints.remove(idx);
        if removed.origin == EndpointOrigin::BuiltIn {
            self.removed_builtins.insert(removed.url.clone());
        }
        Ok(removed)
    }

    /// Short fingerprint of the catalogue's shape (its set of URLs).
    pub fn fingerprint(&self) -> String {
        let mut urls: Vec<&str> = self.endpoints.iter().map(|e| e.url.as_str()).collect();
        urls.sort_unstable();
        let mut hasher = Sha256::new();
        for url in urls {
            hasher.update(url.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(&hasher.finalize()[..6])
    }

    /// Merge every built-in the user has not removed. Returns how many were
    /// added or restored.
    fn seed_builtins(&mut self) -> usize {
        let mut seeded = 0;
        for descriptor in default_endpoints() {
            if self.removed_builtins.contains(&descriptor.url) {
                continue;
            }
            match self.merge(descriptor, EndpointOrigin::BuiltIn) {
                Ok(Merged::Added(_) | Merged::Updated(_)) => seeded += 1,
                Ok(Merged::Kept) => {}
                Err(e) => debug!(error = %e, "skipping built-in endpoint"),
            }
        }
        seeded
    }

    fn next_priority(&self, origin: EndpointOrigin) -> u32 {
        let base = match origin {
            EndpointOrigin::BuiltIn => 1,
            EndpointOrigin::Discovered => DISCOVERED_PRIORITY_BASE,
            EndpointOrigin::User => USER_PRIORITY_BASE,
        };
        self.endpoints
            .iter()
            .filter(|e| e.origin == origin)
            .map(|e| e.priority.saturating_add(1))
            .max()
            .unwrap_or(base)
            .max(base)
    }

    fn sort(&mut self) {
        self.endpoints
            .sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.url.cmp(&b.url)));
    }
}
