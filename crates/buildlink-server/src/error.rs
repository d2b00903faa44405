use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use buildlink_client::{SyncError, TransportError};

/// Why a build token was refused. Only ever logged; callers see
/// [`TokenError::PUBLIC_MESSAGE`].
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("no build token presented")]
    Missing,
    #[error("token is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("token has already been used")]
    Duplicate,
    #[error("token could not be opened with this executor's key")]
    Unsealed,
    #[error("token payload is malformed: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("token was issued for builder {got:?}, not {want:?}")]
    BuilderMismatch { want: String, got: String },
    #[error("token issued at {issued} is outside the freshness window")]
    Expired { issued: time::OffsetDateTime },
    #[error("invalid key: {0}")]
    Key(String),
    #[error("sealing token failed")]
    Seal,
}

impl TokenError {
    pub const PUBLIC_MESSAGE: &'static str = "invalid build token";
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("invalid image reference {0:?}")]
    Reference(String),
    #[error("manifest {0} not found")]
    NotFound(String),
    #[error("no images to assemble")]
    Empty,
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("connection closed while waiting for credentials for {0}")]
    CredentialsUnavailable(String),
    #[error("failed to build {image}: {reason}")]
    Failed { image: String, reason: String },
    #[error("no push repository configured for build {0}")]
    MissingPushRepo(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Unauthorized(#[from] TokenError),
    #[error("upgrade failed: {0}")]
    Upgrade(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        match self {
            ServerError::Unauthorized(e) => {
                tracing::error!(error = %e, "invalid token");
                (StatusCode::UNAUTHORIZED, TokenError::PUBLIC_MESSAGE).into_response()
            }
            ServerError::Upgrade(reason) => {
                tracing::error!(%reason, "websocket upgrade failed");
                (StatusCode::INTERNAL_SERVER_ERROR, reason).into_response()
            }
        }
    }
}
