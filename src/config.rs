use crate::codec::TransformSpec;
use std::env;

/// Browser UA sent on page fetches and proxied requests.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36";

/// How the provider hands out its manifest URL
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderVariant {
    /// Bootstrap script + token refresh + signed manifest URL
    TokenExchange,
    /// Binary `/fetch` envelope whose payload decodes to the manifest URL
    FramedFetch,
}

/// Provider-specific constants. Template drift is a config change.
#[derive(Clone, Debug)]
pub struct ProviderProfile {
    /// Base URL of the event pages, e.g. `https://provider.example`
    pub provider_base: String,
    /// Fixed Origin for proxied key/segment requests. When unset the proxy
    /// reuses the embed origin the manifest was fetched under.
    pub proxy_origin: Option<String>,
    /// Path of the embed bootstrap page on the embed host
    pub embed_path: String,
    pub user_agent: String,
    pub variant: ProviderVariant,
    /// Header carrying the bootstrap's CSRF value on token refresh
    pub csrf_header: String,
    /// Response header carrying framed-payload key material
    pub key_header: String,
    /// Identifiers that must all appear in the player script
    pub script_markers: Vec<String>,
    pub transform: TransformSpec,
    /// When false, the bootstrap's own access code and device id are used
    pub refresh_tokens: bool,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    /// Public base URL of this service; the proxy lives at `{base_url}/proxy`
    pub base_url: String,
    pub is_dev: bool,
    pub provider: ProviderProfile,
    /// Validity window of a refreshed access token
    pub token_ttl_secs: u64,
    /// Upper bound for one whole resolution (all attempts)
    pub resolve_timeout_secs: u64,
    /// Per-IP resolutions per minute; 0 disables limiting
    pub rate_limit_rpm: u32,
    /// Allow the proxy to reach loopback/private addresses (dev only)
    pub allow_private_targets: bool,
}

impl Config {
    pub fn proxy_base(&self) -> String {
        format!("{}/proxy", self.base_url.trim_end_matches('/'))
    }

    /// Load configuration from environment variables
    /// In DEV mode, provides sensible defaults. In PROD mode, PORT, BASE_URL
    /// and PROVIDER_BASE are required.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let is_dev = env::var("DEV_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        let port = if is_dev {
            env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?
        } else {
            env::var("PORT")
                .map_err(|_| "PORT is required in production")?
                .parse()?
        };

        let base_url = if is_dev {
            env::var("BASE_URL").unwrap_or_else(|_| format!("http://localhost:{}", port))
        } else {
            env::var("BASE_URL").map_err(|_| "BASE_URL is required in production")?
        };

        let provider_base = if is_dev {
            env::var("PROVIDER_BASE").unwrap_or_else(|_| "https://provider.example".to_string())
        } else {
            env::var("PROVIDER_BASE").map_err(|_| "PROVIDER_BASE is required in production")?
        };

        let proxy_origin = env::var("PROVIDER_ORIGIN")
            .ok()
            .filter(|o| !o.trim().is_empty());

        let variant = match env::var("PROVIDER_VARIANT")
            .unwrap_or_else(|_| "token".to_string())
            .to_lowercase()
            .as_str()
        {
            "token" | "token-exchange" => ProviderVariant::TokenExchange,
            "framed" | "fetch" => ProviderVariant::FramedFetch,
            other => {
                return Err(format!(
                    "PROVIDER_VARIANT must be `token` or `framed`, got `{}`",
                    other
                )
                .into());
            }
        };

        let script_markers: Vec<String> = env::var("SCRIPT_MARKERS")
            .unwrap_or_else(|_| "playerLoaded,scode".to_string())
            .split(',')
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        if script_markers.is_empty() {
            return Err("SCRIPT_MARKERS must name at least one marker".into());
        }

        let transform: TransformSpec = match env::var("FETCH_TRANSFORM") {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| format!("FETCH_TRANSFORM is not a valid transform: {}", e))?,
            Err(_) => TransformSpec::default(),
        };
        // Reject bad substitution tables at startup rather than per request
        transform.build()?;

        let provider = ProviderProfile {
            provider_base,
            proxy_origin,
            embed_path: env::var("EMBED_PATH").unwrap_or_else(|_| "/embed".to_string()),
            user_agent: env::var("USER_AGENT").unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            variant,
            csrf_header: env::var("CSRF_HEADER").unwrap_or_else(|_| "X-CSRF-Auth".to_string()),
            key_header: env::var("KEY_HEADER").unwrap_or_else(|_| "x-stream-key".to_string()),
            script_markers,
            transform,
            refresh_tokens: env::var("TOKEN_REFRESH")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
        };

        let token_ttl_secs = env::var("TOKEN_TTL_SECS")
            .unwrap_or_else(|_| "25".to_string())
            .parse()
            .unwrap_or(25);

        let resolve_timeout_secs = env::var("RESOLVE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "20".to_string())
            .parse()
            .unwrap_or(20);

        let rate_limit_rpm = env::var("RATE_LIMIT_RPM")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .unwrap_or(0);

        let allow_private_targets = env::var("ALLOW_PRIVATE_TARGETS")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        Ok(Config {
            port,
            base_url,
            is_dev,
            provider,
            token_ttl_secs,
            resolve_timeout_secs,
            rate_limit_rpm,
            allow_private_targets,
        })
    }
}
