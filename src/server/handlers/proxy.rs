use crate::{
    error::{EmbedError, Result},
    hls::rewrite::{ResourceKind, rewrite_manifest},
    metrics,
    server::{state::AppState, url_validation::validate_proxy_target},
};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// AES-128 key length.
const KEY_LEN: usize = 16;

#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: ResourceKind,
}

fn default_content_type(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Key => "application/octet-stream",
        ResourceKind::Segment => "video/mp2t",
        ResourceKind::Playlist => "application/vnd.apple.mpegurl",
    }
}

/// `Origin` for a proxied request: the configured override, else the embed
/// origin the target's host was resolved under, else the provider base.
fn upstream_origin(state: &AppState, target: &Url) -> String {
    if let Some(fixed) = &state.config.provider.proxy_origin {
        return fixed.clone();
    }
    state.origins.lookup(target).unwrap_or_else(|| {
        debug!("No embed origin recorded for {}, using provider base", target);
        state.config.provider.provider_base.clone()
    })
}

/// Re-fetch a key, segment or child playlist with the provider's required
/// `Origin`/`Referer`, passing status and content type through.
///
/// Child playlists are rewritten again so their own references stay on the
/// proxy. Segments are streamed without buffering.
pub async fn proxy_resource(
    Query(query): Query<ProxyQuery>,
    State(state): State<AppState>,
) -> Result<Response> {
    let start = Instant::now();
    let endpoint = query.kind.as_str();
    let target = match validate_proxy_target(&query.url, state.config.allow_private_targets) {
        Ok(url) => url,
        Err(e) => {
            warn!("Rejected proxy target {}: {}", query.url, e);
            metrics::record_request(endpoint, 400);
            return Err(e);
        }
    };
    debug!("Proxying {} {}", endpoint, target);

    let provider = &state.config.provider;
    let origin = upstream_origin(&state, &target);
    let referer = format!("{}/", origin.trim_end_matches('/'));
    let response = match state
        .http_client
        .get(target.clone())
        .header(header::ORIGIN, origin.as_str())
        .header(header::REFERER, referer)
        .header(header::USER_AGENT, provider.user_agent.as_str())
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            metrics::record_upstream_error(endpoint);
            metrics::record_request(endpoint, 502);
            metrics::record_duration(endpoint, start);
            return Err(EmbedError::Http(e));
        }
    };

    let status = response.status();
    if !status.is_success() {
        warn!("Upstream returned {} for {} {}", status, endpoint, target);
        metrics::record_upstream_error(endpoint);
    }
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(default_content_type(query.kind))
        .to_string();

    let response = match query.kind {
        ResourceKind::Segment => (
            status,
            [(header::CONTENT_TYPE, content_type)],
            Body::from_stream(response.bytes_stream()),
        )
            .into_response(),
        ResourceKind::Key => {
            let bytes = response.bytes().await?;
            if status.is_success() && bytes.len() != KEY_LEN {
                warn!(
                    "Key response from {} is {} bytes, expected {}",
                    target,
                    bytes.len(),
                    KEY_LEN
                );
            }
            (status, [(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        ResourceKind::Playlist => {
            // Redirects may move the playlist; resolve against where it landed
            let final_url = response.url().clone();
            let body = response.text().await?;
            if !status.is_success() {
                (status, [(header::CONTENT_TYPE, content_type)], body).into_response()
            } else {
                let rewritten = rewrite_manifest(&body, &final_url, &state.config.proxy_base());
                // Grandchildren inherit the origin this playlist was fetched under
                state
                    .origins
                    .record(rewritten.hosts.iter().map(String::as_str), &origin);
                info!(
                    "Rewrote child playlist {} ({} keys, {} segments, {} playlists)",
                    final_url, rewritten.keys, rewritten.segments, rewritten.playlists
                );
                (
                    StatusCode::OK,
                    [
                        (header::CONTENT_TYPE, "application/vnd.apple.mpegurl".to_string()),
                        (header::CACHE_CONTROL, "no-cache".to_string()),
                    ],
                    rewritten.body,
                )
                    .into_response()
            }
        }
    };

    metrics::record_request(endpoint, status.as_u16());
    metrics::record_duration(endpoint, start);
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_type_parses_lowercase() {
        let query: ProxyQuery =
            serde_json::from_str(r#"{"url":"https://seg.example/1.ts","type":"segment"}"#).unwrap();
        assert_eq!(query.kind, ResourceKind::Segment);
    }

    #[test]
    fn defaults_follow_resource_kind() {
        assert_eq!(default_content_type(ResourceKind::Key), "application/octet-stream");
        assert_eq!(default_content_type(ResourceKind::Segment), "video/mp2t");
        assert_eq!(
            default_content_type(ResourceKind::Playlist),
            "application/vnd.apple.mpegurl"
        );
    }
}
