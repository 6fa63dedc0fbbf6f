//! Short-lived caches shared across resolutions.
//!
//! `TokenCache` holds access tokens keyed by device id. Concurrent refreshes
//! for the same device are serialized behind a per-key async mutex, so a
//! second caller waits for and reuses the first caller's token instead of
//! burning the single-use access code again.
//!
//! `EmbedOrigins` remembers which embed origin each upstream host was
//! reached under, so proxied keys and segments carry the same `Origin` as
//! the manifest request did.

use crate::error::Result;
use crate::hls::rewrite::authority;
use crate::token::AccessToken;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

/// Default validity window for a refreshed token.
pub const DEFAULT_TTL: Duration = Duration::from_secs(25);

/// How long an upstream host keeps its embed origin without being seen again.
pub const ORIGIN_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Debug)]
struct CachedToken {
    token: AccessToken,
    fetched_at: Instant,
}

type Slot = Arc<Mutex<Option<CachedToken>>>;

/// Injectable token cache with single-flight refresh.
#[derive(Clone, Debug)]
pub struct TokenCache {
    slots: Arc<DashMap<String, Slot>>,
    ttl: Duration,
}

impl TokenCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            ttl,
        }
    }

    fn slot(&self, device_id: &str) -> Slot {
        self.slots
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Return a fresh cached token for `device_id`, or run `refresh` while
    /// holding the key's lock and cache its result. Failed refreshes are
    /// not cached.
    pub async fn get_or_refresh<F, Fut>(&self, device_id: &str, refresh: F) -> Result<AccessToken>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AccessToken>>,
    {
        let slot = self.slot(device_id);
        let mut guard = slot.lock().await;

        if let Some(cached) = guard.as_ref()
            && cached.fetched_at.elapsed() < self.ttl
        {
            debug!("Token cache HIT for device {}", device_id);
            crate::metrics::record_token_cache(true);
            return Ok(cached.token.clone());
        }

        debug!("Token cache MISS for device {}", device_id);
        crate::metrics::record_token_cache(false);
        *guard = None;
        let token = refresh().await?;
        *guard = Some(CachedToken {
            token: token.clone(),
            fetched_at: Instant::now(),
        });
        Ok(token)
    }

    /// Forget `stale` if it is still the token cached for `device_id`.
    ///
    /// The slot stays in the map so callers already queued on its lock keep
    /// serializing with newcomers. A token that another caller refreshed in
    /// the meantime is left alone.
    pub async fn invalidate(&self, device_id: &str, stale: &AccessToken) {
        let Some(slot) = self.slots.get(device_id).map(|s| s.value().clone()) else {
            return;
        };
        let mut guard = slot.lock().await;
        if guard.as_ref().is_some_and(|c| c.token == *stale) {
            *guard = None;
            debug!("Invalidated cached token for device {}", device_id);
        }
    }

    /// Remove slots that are empty or expired and that nobody is refreshing.
    pub fn cleanup_expired(&self) {
        self.slots.retain(|_, slot| match slot.try_lock() {
            Ok(guard) => guard
                .as_ref()
                .is_some_and(|c| c.fetched_at.elapsed() < self.ttl),
            Err(_) => true,
        });
    }

    /// Validity window of a cached token.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of devices holding a token. Slots mid-refresh count as held.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().try_lock().map_or(true, |g| g.is_some()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

/// Upstream `host[:port]` → embed origin it was last reached under.
#[derive(Clone, Debug)]
pub struct EmbedOrigins {
    hosts: Arc<DashMap<String, (String, Instant)>>,
    ttl: Duration,
}

impl EmbedOrigins {
    pub fn new(ttl: Duration) -> Self {
        Self {
            hosts: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Bind every host in `hosts` to `origin`, replacing older bindings.
    pub fn record<'a>(&self, hosts: impl IntoIterator<Item = &'a str>, origin: &str) {
        for host in hosts {
            self.hosts
                .insert(host.to_string(), (origin.to_string(), Instant::now()));
        }
    }

    /// Embed origin recorded for the host of `url`, if still fresh.
    pub fn lookup(&self, url: &Url) -> Option<String> {
        let host = authority(url)?;
        let entry = self.hosts.get(&host)?;
        let (origin, seen_at) = entry.value();
        (seen_at.elapsed() < self.ttl).then(|| origin.clone())
    }

    pub fn cleanup_expired(&self) {
        self.hosts.retain(|_, (_, seen_at)| seen_at.elapsed() < self.ttl);
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl Default for EmbedOrigins {
    fn default() -> Self {
        Self::new(ORIGIN_TTL)
    }
}
