//! Access-code refresh against the provider's token endpoint.

use crate::bootstrap::EmbedBootstrap;
use crate::error::{EmbedError, Result};
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;
use tracing::{info, warn};

/// A renewed access grant. Supersedes the bootstrap's initial code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub access_code: String,
    pub device_id: String,
    pub refreshed_at_epoch_secs: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    scode: String,
    ts: i64,
    device_id: String,
    #[serde(default)]
    success: Option<bool>,
}

/// Calls `token_base_url` with the bootstrap's credentials.
#[derive(Debug, Clone)]
pub struct TokenClient {
    client: Client,
    csrf_header: String,
}

impl TokenClient {
    pub fn new(client: Client, csrf_header: impl Into<String>) -> Self {
        Self {
            client,
            csrf_header: csrf_header.into(),
        }
    }

    /// Exchange the bootstrap's access code for a fresh one.
    ///
    /// `embed_origin` is the embed domain, not the token domain; it is sent
    /// as both `Origin` and `Referer`.
    pub async fn refresh(&self, bootstrap: &EmbedBootstrap, embed_origin: &str) -> Result<AccessToken> {
        info!(
            "Refreshing access code for device {} (stream {})",
            bootstrap.device_id, bootstrap.stream_id
        );

        let expires = bootstrap.issued_at_epoch_secs.to_string();
        let response = self
            .client
            .get(&bootstrap.token_base_url)
            .query(&[
                ("scode", bootstrap.initial_access_code.as_str()),
                ("stream", bootstrap.stream_id.as_str()),
                ("expires", expires.as_str()),
                ("u_id", bootstrap.device_id.as_str()),
                ("host_id", bootstrap.host_id.as_str()),
            ])
            .header(header::ACCEPT, "application/json")
            .header(self.csrf_header.as_str(), &bootstrap.csrf_auth_value)
            .header(header::ORIGIN, embed_origin)
            .header(header::REFERER, format!("{}/", embed_origin.trim_end_matches('/')))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            warn!("Token refresh rejected with {}", status);
            return Err(EmbedError::TokenRejected(status.as_u16()));
        }

        let body: TokenResponse = response.json().await?;
        if body.success == Some(false) {
            warn!("Token refresh returned success=false");
            return Err(EmbedError::TokenRejected(status.as_u16()));
        }

        Ok(AccessToken {
            access_code: body.scode,
            device_id: body.device_id,
            refreshed_at_epoch_secs: body.ts,
        })
    }
}
