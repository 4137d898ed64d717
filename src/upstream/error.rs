use std::time::SystemTime;

use thiserror::Error;

pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Classified upstream failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// The upstream asked callers to back off until `resume_at`.
    #[error("upstream rate limit in effect")]
    RateLimited { resume_at: SystemTime },
    /// The upstream blocked this client or is down for maintenance.
    #[error("upstream service unavailable: {message}")]
    ServiceUnavailable { message: String },
    /// The access or refresh token was rejected.
    #[error("upstream rejected authorization: {message}")]
    Unauthorized { message: String },
    #[error("upstream target not found: {message}")]
    NotFound { message: String },
    /// Request rejected for a reason retrying cannot fix.
    #[error("upstream rejected request with status {status}: {message}")]
    Permanent { status: u16, message: String },
    /// Network failure, timeout or server error.
    #[error("upstream transient failure: {message}")]
    Transient { message: String },
}

impl UpstreamError {
    /// Whether the error reports a rejected credential.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, UpstreamError::Unauthorized { .. })
    }
}
