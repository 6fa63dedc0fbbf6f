pub mod handlers;
pub mod rate_limit;
pub mod state;
pub mod url_validation;

use crate::{config::Config, error::Result};
use axum::{
    Router,
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use state::AppState;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

const VERSION_HEADER: &str = "x-embedgate-version";

/// How often expired tokens, origins and closed rate-limit windows are swept
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

async fn version_header(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    response.headers_mut().insert(
        VERSION_HEADER,
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

fn routes(state: AppState) -> Router {
    let resolve = Router::new()
        .route(
            "/play/{source}/{event_path}/{link_index}/playlist.m3u8",
            get(handlers::playlist::serve_playlist),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::limit_resolutions,
        ));

    Router::new()
        .route("/", get(handlers::health::health_check))
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::metrics))
        .route("/proxy", get(handlers::proxy::proxy_resource))
        .merge(resolve)
        .layer(middleware::from_fn(version_header))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Build the full router without binding a listener
pub async fn build_router(config: Config) -> Result<Router> {
    let state = AppState::new(config)?;
    Ok(routes(state))
}

/// Sweep expired tokens and rate-limit windows until shutdown
fn spawn_cleanup(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    state.tokens.cleanup_expired();
                    state.origins.cleanup_expired();
                    if let Some(ref limiter) = state.limiter {
                        limiter.cleanup();
                    }
                    state.metrics.run_upkeep();
                }
            }
        }
    });
}

async fn shutdown_signal(state: AppState) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested, cancelling in-flight resolutions");
    state.shutdown.cancel();
}

/// Start the Axum HTTP server
pub async fn start(config: Config) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", config.port);
    info!(
        "Provider {} via {:?}, proxy at {}",
        config.provider.provider_base,
        config.provider.variant,
        config.proxy_base()
    );

    let state = AppState::new(config)?;
    spawn_cleanup(state.clone());
    let app = routes(state.clone());

    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };

    info!("Server listening on http://{}", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
    {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}
