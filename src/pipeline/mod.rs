//! Per-playback resolution pipeline.
//!
//! `INIT → EXTRACTED → BOOTSTRAPPED → TOKEN_REFRESHED → MANIFEST_FETCHED →
//! REWRITTEN → SERVED`. Expiry-class failures (token rejected, manifest
//! 401/412) restart once from a fresh extraction; everything else is
//! terminal for the attempt. Nothing survives an attempt except the token
//! cache.

pub mod locator;

pub use locator::{FramedFetchLocator, LocatedManifest, ManifestLocator, TokenExchangeLocator};

use crate::cache::{EmbedOrigins, TokenCache};
use crate::config::{Config, ProviderProfile, ProviderVariant};
use crate::error::{EmbedError, ManifestError, Result};
use crate::extract::{EmbedSession, StrategyRegistry, fetch_embed_params};
use crate::hls::rewrite::{RewrittenManifest, authority, rewrite_manifest};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

/// One full pass plus one restart.
pub const MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Extracted,
    Bootstrapped,
    TokenRefreshed,
    ManifestFetched,
    Rewritten,
    Served,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Extracted => "extracted",
            Stage::Bootstrapped => "bootstrapped",
            Stage::TokenRefreshed => "token_refreshed",
            Stage::ManifestFetched => "manifest_fetched",
            Stage::Rewritten => "rewritten",
            Stage::Served => "served",
        }
    }

    /// The stage a failure prevented from being reached.
    fn blocked_by(err: &EmbedError) -> Stage {
        match err {
            EmbedError::Extraction(_) => Stage::Extracted,
            EmbedError::PageStatus { page: "event", .. } => Stage::Extracted,
            EmbedError::Decode(_) | EmbedError::PageStatus { .. } => Stage::Bootstrapped,
            EmbedError::TokenRejected(_) => Stage::TokenRefreshed,
            EmbedError::Manifest(_) | EmbedError::Codec(_) => Stage::ManifestFetched,
            _ => Stage::Init,
        }
    }
}

/// A resolved, rewritten manifest ready to serve.
#[derive(Debug, Clone)]
pub struct ResolvedStream {
    pub manifest_url: Url,
    pub manifest: RewrittenManifest,
    pub device_id: Option<String>,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct Pipeline {
    client: Client,
    profile: Arc<ProviderProfile>,
    registry: StrategyRegistry,
    locator: Arc<dyn ManifestLocator>,
    origins: EmbedOrigins,
    timeout: Duration,
}

impl Pipeline {
    pub fn new(
        client: Client,
        config: &Config,
        tokens: TokenCache,
        origins: EmbedOrigins,
    ) -> Result<Self> {
        let profile = Arc::new(config.provider.clone());
        let locator: Arc<dyn ManifestLocator> = match profile.variant {
            ProviderVariant::TokenExchange => Arc::new(TokenExchangeLocator::new(
                client.clone(),
                profile.clone(),
                tokens,
            )),
            ProviderVariant::FramedFetch => Arc::new(FramedFetchLocator::new(
                client.clone(),
                profile.clone(),
                profile.transform.build()?,
            )),
        };

        Ok(Self {
            client,
            profile,
            registry: StrategyRegistry::with_default_rules()?,
            locator,
            origins,
            timeout: Duration::from_secs(config.resolve_timeout_secs),
        })
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// Resolve `session` and rewrite its manifest through `proxy_base`.
    ///
    /// Honours `cancel` and the configured overall timeout.
    pub async fn resolve(
        &self,
        session: &EmbedSession,
        proxy_base: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedStream> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Resolution of {} cancelled", session.event_path);
                Err(EmbedError::Cancelled)
            }
            outcome = tokio::time::timeout(self.timeout, self.run(session, proxy_base)) => {
                outcome.map_err(|_| {
                    crate::metrics::record_stage_failure("timeout");
                    EmbedError::Timeout
                })?
            }
        }
    }

    async fn run(&self, session: &EmbedSession, proxy_base: &str) -> Result<ResolvedStream> {
        let mut attempt = 0;
        let located = loop {
            attempt += 1;
            match self.attempt(session).await {
                Ok(located) => break located,
                Err(e) if e.restarts_from_bootstrap() && attempt < MAX_ATTEMPTS => {
                    if matches!(e, EmbedError::Manifest(ManifestError::PreconditionFailed)) {
                        warn!("Manifest rejected our Referer; check provider origin settings");
                    }
                    warn!(
                        "Attempt {}/{} failed at {}: {}; restarting from extraction",
                        attempt,
                        MAX_ATTEMPTS,
                        Stage::blocked_by(&e).as_str(),
                        e
                    );
                    crate::metrics::record_restart();
                }
                Err(e) => {
                    crate::metrics::record_stage_failure(Stage::blocked_by(&e).as_str());
                    return Err(e);
                }
            }
        };
        info!("Stage {}", Stage::ManifestFetched.as_str());

        let manifest = rewrite_manifest(&located.manifest.body, &located.manifest.url, proxy_base);
        let manifest_host = authority(&located.manifest.url);
        self.origins.record(
            manifest_host
                .iter()
                .chain(&manifest.hosts)
                .map(String::as_str),
            &located.embed_origin,
        );
        info!(
            "Stage {}: {} keys, {} segments",
            Stage::Rewritten.as_str(),
            manifest.keys,
            manifest.segments
        );

        Ok(ResolvedStream {
            manifest_url: located.manifest.url,
            manifest,
            device_id: located.device_id,
            attempts: attempt,
        })
    }

    async fn attempt(&self, session: &EmbedSession) -> Result<LocatedManifest> {
        info!(
            "Stage {}: resolving {} link {} via {}",
            Stage::Init.as_str(),
            session.event_path,
            session.link_index,
            self.locator.name()
        );
        let params = fetch_embed_params(
            &self.client,
            &self.registry,
            &self.profile.provider_base,
            &self.profile.user_agent,
            session,
        )
        .await?;
        info!(
            "Stage {}: embed origin {}",
            Stage::Extracted.as_str(),
            params.embed_origin
        );

        self.locator.locate(session, &params).await
    }
}
