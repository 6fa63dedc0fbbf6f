use crate::bootstrap::fetch_bootstrap;
use crate::cache::TokenCache;
use crate::codec::{self, DecodeTransform, FetchRequest};
use crate::config::ProviderProfile;
use crate::error::{EmbedError, ManifestError, Result};
use crate::extract::{EmbedParams, EmbedSession};
use crate::manifest::{FetchedManifest, ManifestResolver, build_manifest_url};
use crate::token::{AccessToken, TokenClient};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode, header};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Output of a locator: the fetched playlist, the embed origin it was
/// requested under, and the device id if the variant has one.
#[derive(Debug, Clone)]
pub struct LocatedManifest {
    pub manifest: FetchedManifest,
    pub embed_origin: String,
    pub device_id: Option<String>,
}

/// Turns extracted embed parameters into a fetched manifest.
///
/// One implementation per provider variant. The orchestrator owns retries;
/// locators fail fast with typed errors.
#[async_trait]
pub trait ManifestLocator: Send + Sync {
    async fn locate(&self, session: &EmbedSession, params: &EmbedParams)
    -> Result<LocatedManifest>;

    fn name(&self) -> &'static str;
}

/// Bootstrap script → token refresh → signed manifest URL.
pub struct TokenExchangeLocator {
    client: Client,
    profile: Arc<ProviderProfile>,
    tokens: TokenClient,
    cache: TokenCache,
    resolver: ManifestResolver,
}

impl TokenExchangeLocator {
    pub fn new(client: Client, profile: Arc<ProviderProfile>, cache: TokenCache) -> Self {
        Self {
            tokens: TokenClient::new(client.clone(), profile.csrf_header.clone()),
            resolver: ManifestResolver::new(client.clone()),
            client,
            profile,
            cache,
        }
    }
}

#[async_trait]
impl ManifestLocator for TokenExchangeLocator {
    async fn locate(
        &self,
        _session: &EmbedSession,
        params: &EmbedParams,
    ) -> Result<LocatedManifest> {
        let bootstrap = fetch_bootstrap(
            &self.client,
            params,
            &self.profile.embed_path,
            &self.profile.user_agent,
            &self.profile.script_markers,
        )
        .await?;
        let now = Utc::now().timestamp();
        info!(
            "Bootstrapped stream {} on host {} (issued {}s ago)",
            bootstrap.stream_id,
            bootstrap.host_id,
            now - bootstrap.issued_at_epoch_secs
        );

        let token = if self.profile.refresh_tokens {
            self.cache
                .get_or_refresh(&bootstrap.device_id, || {
                    self.tokens.refresh(&bootstrap, &params.embed_origin)
                })
                .await?
        } else {
            let ttl = self.cache.ttl().as_secs() as i64;
            if !bootstrap.is_fresh(now, ttl) {
                // Signature likely expired already; the manifest call will say
                warn!(
                    "Bootstrap for device {} is older than {}s",
                    bootstrap.device_id, ttl
                );
            }
            AccessToken {
                access_code: bootstrap.initial_access_code.clone(),
                device_id: bootstrap.device_id.clone(),
                refreshed_at_epoch_secs: bootstrap.issued_at_epoch_secs,
            }
        };
        debug!("Using device id {} for manifest", token.device_id);

        let url = build_manifest_url(&bootstrap.manifest_url_template, &token.device_id)?;
        let manifest = match self.resolver.fetch(&url, &params.embed_origin).await {
            Ok(manifest) => manifest,
            Err(e) => {
                // Drop only the token that was just refused
                if e.restarts_from_bootstrap() && self.profile.refresh_tokens {
                    self.cache.invalidate(&bootstrap.device_id, &token).await;
                }
                return Err(e);
            }
        };

        Ok(LocatedManifest {
            manifest,
            embed_origin: params.embed_origin.clone(),
            device_id: Some(token.device_id),
        })
    }

    fn name(&self) -> &'static str {
        "token-exchange"
    }
}

/// Binary `/fetch` envelope whose decoded payload is the manifest URL.
pub struct FramedFetchLocator {
    client: Client,
    profile: Arc<ProviderProfile>,
    transform: Arc<dyn DecodeTransform>,
    resolver: ManifestResolver,
}

impl FramedFetchLocator {
    pub fn new(
        client: Client,
        profile: Arc<ProviderProfile>,
        transform: Arc<dyn DecodeTransform>,
    ) -> Self {
        Self {
            resolver: ManifestResolver::new(client.clone()),
            client,
            profile,
            transform,
        }
    }

    async fn fetch_manifest_url(&self, session: &EmbedSession, origin: &str) -> Result<String> {
        let request = FetchRequest {
            source: session.source_site_id.clone(),
            id: session.event_path.clone(),
            stream_number: session.link_index.to_string(),
        };
        let endpoint = format!("{}/fetch", origin.trim_end_matches('/'));
        info!("Posting framed fetch to {}", endpoint);

        let response = self
            .client
            .post(&endpoint)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::ORIGIN, origin)
            .header(header::REFERER, format!("{}/", origin.trim_end_matches('/')))
            .header(header::USER_AGENT, &self.profile.user_agent)
            .body(request.encode())
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => return Err(ManifestError::Unauthorized.into()),
            StatusCode::PRECONDITION_FAILED => {
                return Err(ManifestError::PreconditionFailed.into());
            }
            other => {
                warn!("Framed fetch returned {}", other);
                return Err(ManifestError::Status(other.as_u16()).into());
            }
        }

        let key_value = response
            .headers()
            .get(self.profile.key_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                EmbedError::Codec(codec::CodecError::InvalidKeyMaterial(format!(
                    "missing {} header",
                    self.profile.key_header
                )))
            })?;
        let key = codec::parse_key_material(&key_value)?;

        let body = response.bytes().await?;
        let ciphertext = codec::decode_response(&body)?;
        let plaintext = codec::decode_payload(ciphertext, &key, self.transform.as_ref());
        let decoded = String::from_utf8(plaintext).map_err(|_| codec::CodecError::InvalidUtf8)?;
        let decoded = decoded.trim();

        let is_url = (decoded.starts_with("https://") || decoded.starts_with("http://"))
            && Url::parse(decoded).is_ok();
        if !is_url {
            return Err(codec::CodecError::PayloadNotUrl.into());
        }
        Ok(decoded.to_string())
    }
}

#[async_trait]
impl ManifestLocator for FramedFetchLocator {
    async fn locate(
        &self,
        session: &EmbedSession,
        params: &EmbedParams,
    ) -> Result<LocatedManifest> {
        let url = self
            .fetch_manifest_url(session, &params.embed_origin)
            .await?;
        let manifest = self.resolver.fetch(&url, &params.embed_origin).await?;
        Ok(LocatedManifest {
            manifest,
            embed_origin: params.embed_origin.clone(),
            device_id: None,
        })
    }

    fn name(&self) -> &'static str {
        "framed-fetch"
    }
}
