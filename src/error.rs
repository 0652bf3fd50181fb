use std::time::Duration;
use thiserror::Error;

use crate::eventstream::DecodeError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("api error: {0}")]
    Api(#[from] ApiError),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("upstream unreachable: {0}")]
    Upstream(String),

    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),

    #[error("stream decode error: {0}")]
    StreamDecode(#[from] DecodeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Failures between the proxy and Bedrock. These are reported to clients
    /// as a uniform bad gateway error; the details only go to the log.
    pub fn is_gateway_failure(&self) -> bool {
        matches!(
            self,
            Error::Auth(_) | Error::Upstream(_) | Error::Timeout(_) | Error::StreamDecode(_)
        )
    }
}

/// Outbound request signing failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing AWS credentials: {0}")]
    MissingCredentials(String),

    #[error("request signing failed: {0}")]
    Signing(String),
}

/// Problems with the inbound request that the client can fix.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("request body too large: {size} bytes (max: {max} bytes)")]
    RequestTooLarge { size: usize, max: usize },

    #[error("method {method} not allowed")]
    MethodNotAllowed { method: String },

    #[error("invalid or missing API key")]
    Unauthorized,
}

pub type Result<T> = std::result::Result<T, Error>;
