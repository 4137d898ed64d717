//! Boundary with the rate-limited upstream record system.
//!
//! The relay treats "read the current value, write the new value" as an opaque two-call
//! primitive. Implementations classify every failure into [`UpstreamError`] so the retry policy
//! never inspects transport details.

mod error;
mod fake;
mod http;

use std::time::Duration;

use futures::future::BoxFuture;

pub use error::{UpstreamError, UpstreamResult};
pub use fake::{FakeUpstream, RecordedWrite};
pub use http::{HttpTokenExchanger, HttpUpstream, classify_response};

/// Value read from the upstream for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetValue {
    /// Current score.
    pub value: i64,
    /// Display name reported by the upstream, when it sends one.
    pub label: Option<String>,
}

/// Token material returned by a refresh-token exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Rotated refresh token. Some providers reuse the previous one.
    pub refresh_token: Option<String>,
    pub expires_in: Duration,
}

/// Read/write access to target values on behalf of one actor.
pub trait UpstreamApi: Send + Sync {
    fn read_value(
        &self,
        access_token: String,
        group_id: i64,
        target_id: String,
    ) -> BoxFuture<'static, UpstreamResult<TargetValue>>;

    fn write_value(
        &self,
        access_token: String,
        group_id: i64,
        target_id: String,
        value: i64,
    ) -> BoxFuture<'static, UpstreamResult<()>>;
}

/// OAuth refresh-token grant.
pub trait TokenExchanger: Send + Sync {
    fn refresh(&self, refresh_token: String) -> BoxFuture<'static, UpstreamResult<TokenGrant>>;
}
