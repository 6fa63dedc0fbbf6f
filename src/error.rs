use crate::codec::CodecError;
use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

pub type Result<T> = std::result::Result<T, EmbedError>;

/// Manifest fetch failures that carry protocol meaning.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManifestError {
    /// 401: path signature expired, or `u_id` stale/absent.
    #[error("manifest request unauthorized (signature expired or stale u_id)")]
    Unauthorized,

    /// 412: `Referer` missing or wrong.
    #[error("manifest request failed precondition (missing or incorrect Referer)")]
    PreconditionFailed,

    #[error("manifest request returned unexpected status {0}")]
    Status(u16),

    #[error("manifest body is not an HLS playlist: {0}")]
    NotAPlaylist(String),
}

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("extraction failed: missing field `{0}`")]
    Extraction(String),

    #[error("bootstrap not found: {0}")]
    Decode(String),

    /// Event or embed page answered with a non-success status.
    #[error("{page} page returned status {status}")]
    PageStatus { page: &'static str, status: u16 },

    #[error("token refresh rejected with status {0}")]
    TokenRejected(u16),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("framed envelope error: {0}")]
    Codec(#[from] CodecError),

    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("proxy target rejected: {0}")]
    InvalidTarget(String),

    #[error("resolution timed out")]
    Timeout,

    #[error("resolution cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

/// What a failed playback attempt means to the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Token or signature expiry; retrying shortly is expected to work.
    TemporarilyUnavailable,
    /// Page template, script shape or envelope contract changed.
    UnsupportedProvider,
    BadRequest,
    Internal,
}

impl EmbedError {
    pub fn class(&self) -> FailureClass {
        match self {
            EmbedError::Extraction(_) | EmbedError::Decode(_) | EmbedError::Codec(_) => {
                FailureClass::UnsupportedProvider
            }
            EmbedError::Manifest(ManifestError::NotAPlaylist(_)) => {
                FailureClass::UnsupportedProvider
            }
            // Missing or forbidden pages mean the URL scheme moved; 408/429 and
            // 5xx are the provider being unwell
            EmbedError::PageStatus { status, .. }
                if (400..500).contains(status) && !matches!(status, 408 | 429) =>
            {
                FailureClass::UnsupportedProvider
            }
            EmbedError::PageStatus { .. } => FailureClass::TemporarilyUnavailable,
            EmbedError::TokenRejected(_)
            | EmbedError::Manifest(_)
            | EmbedError::Http(_)
            | EmbedError::Timeout => FailureClass::TemporarilyUnavailable,
            EmbedError::InvalidUrl(_) | EmbedError::InvalidTarget(_) => FailureClass::BadRequest,
            EmbedError::Cancelled | EmbedError::Internal(_) => FailureClass::Internal,
        }
    }

    /// HTTP status surfaced to the player.
    pub fn status(&self) -> StatusCode {
        match self.class() {
            FailureClass::TemporarilyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            FailureClass::UnsupportedProvider => StatusCode::BAD_GATEWAY,
            FailureClass::BadRequest => StatusCode::BAD_REQUEST,
            FailureClass::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the orchestrator may restart once from a fresh extraction.
    pub fn restarts_from_bootstrap(&self) -> bool {
        matches!(
            self,
            EmbedError::TokenRejected(_)
                | EmbedError::Manifest(ManifestError::Unauthorized)
                | EmbedError::Manifest(ManifestError::PreconditionFailed)
        )
    }
}

impl IntoResponse for EmbedError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self.class() {
            FailureClass::TemporarilyUnavailable => {
                warn!("Stream temporarily unavailable: {}", self);
                (
                    status,
                    [(header::RETRY_AFTER, "5")],
                    format!("Stream temporarily unavailable, retry shortly: {}\n", self),
                )
                    .into_response()
            }
            FailureClass::UnsupportedProvider => {
                error!("Provider unsupported or broken: {}", self);
                (
                    status,
                    format!("Unsupported or broken provider: {}\n", self),
                )
                    .into_response()
            }
            FailureClass::BadRequest => {
                (status, format!("{}\n", self)).into_response()
            }
            FailureClass::Internal => {
                error!("Internal error: {}", self);
                (status, "Internal error\n").into_response()
            }
        }
    }
}
