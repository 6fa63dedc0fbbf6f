use crate::{
    cache::{EmbedOrigins, TokenCache},
    config::Config,
    error::{EmbedError, Result},
    pipeline::Pipeline,
    server::rate_limit::ResolveLimiter,
};
use metrics_exporter_prometheus::PrometheusHandle;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Shared HTTP client for connection pooling. No cookie store.
    pub http_client: Client,
    pub pipeline: Pipeline,
    pub tokens: TokenCache,
    /// Embed origin per upstream host, filled by resolutions, read by the proxy
    pub origins: EmbedOrigins,
    /// `None` when `rate_limit_rpm` is 0
    pub limiter: Option<ResolveLimiter>,
    pub metrics: PrometheusHandle,
    pub started_at: Instant,
    /// Cancelled on shutdown; in-flight resolutions hold child tokens.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let http_client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EmbedError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        let tokens = TokenCache::new(Duration::from_secs(config.token_ttl_secs));
        let origins = EmbedOrigins::default();
        let pipeline = Pipeline::new(
            http_client.clone(),
            &config,
            tokens.clone(),
            origins.clone(),
        )?;
        let limiter = (config.rate_limit_rpm > 0).then(|| ResolveLimiter::new(config.rate_limit_rpm));

        Ok(Self {
            config: Arc::new(config),
            http_client,
            pipeline,
            tokens,
            origins,
            limiter,
            metrics: crate::metrics::init(),
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
        })
    }
}
