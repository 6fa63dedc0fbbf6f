use crate::{
    error::Result,
    extract::EmbedSession,
    metrics,
    pipeline::Stage,
    server::state::AppState,
};
use axum::{
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use std::time::Instant;
use tracing::info;

/// Resolve a provider stream and serve its manifest rewritten through the proxy
pub async fn serve_playlist(
    Path((source_site_id, event_path, link_index)): Path<(String, String, u32)>,
    State(state): State<AppState>,
) -> Result<Response> {
    let start = Instant::now();
    let session = EmbedSession {
        source_site_id,
        event_path,
        link_index,
    };
    info!(
        "Resolving playlist for {}/{} link {}",
        session.source_site_id, session.event_path, session.link_index
    );

    let cancel = state.shutdown.child_token();
    let resolved = match state
        .pipeline
        .resolve(&session, &state.config.proxy_base(), &cancel)
        .await
    {
        Ok(resolved) => resolved,
        Err(e) => {
            metrics::record_request("playlist", e.status().as_u16());
            metrics::record_duration("playlist", start);
            return Err(e);
        }
    };

    info!(
        "Stage {}: {} after {} attempt(s)",
        Stage::Served.as_str(),
        resolved.manifest_url,
        resolved.attempts
    );
    metrics::record_request("playlist", 200);
    metrics::record_duration("playlist", start);

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/vnd.apple.mpegurl"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        resolved.manifest.body,
    )
        .into_response())
}
