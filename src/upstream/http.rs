use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use reqwest::{Client, Response, StatusCode, Url, header::HeaderMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{TargetValue, TokenExchanger, TokenGrant, UpstreamApi, UpstreamError, UpstreamResult};
use crate::config::UpstreamSettings;

/// Header the upstream sets when this client is blocked as a whole.
const BLOCKED_HEADER: &str = "x-blocked";
const RETRY_AFTER_HEADER: &str = "retry-after";
const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";
/// Back-off used when a 429 carries no usable hint.
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);
/// Longest error body kept in an error message.
const MAX_BODY_IN_ERROR: usize = 200;

/// Map a response status and headers onto the failure taxonomy. `None` means success.
pub fn classify_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    now: SystemTime,
) -> Option<UpstreamError> {
    let message = summarize(body, status);

    if let Some(blocked) = headers.get(BLOCKED_HEADER) {
        let reason = blocked.to_str().unwrap_or("blocked").to_owned();
        return Some(UpstreamError::ServiceUnavailable { message: reason });
    }
    if status.is_success() {
        return None;
    }

    let error = match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let wait = seconds_header(headers, RETRY_AFTER_HEADER)
                .or_else(|| seconds_header(headers, RATE_LIMIT_RESET_HEADER))
                .map(|secs| Duration::from_secs(secs.max(1)))
                .unwrap_or(DEFAULT_RATE_LIMIT_WAIT);
            UpstreamError::RateLimited {
                resume_at: now + wait,
            }
        }
        StatusCode::SERVICE_UNAVAILABLE => UpstreamError::ServiceUnavailable { message },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => UpstreamError::Unauthorized { message },
        StatusCode::NOT_FOUND => UpstreamError::NotFound { message },
        status if status.is_client_error() => UpstreamError::Permanent {
            status: status.as_u16(),
            message,
        },
        _ => UpstreamError::Transient { message },
    };
    Some(error)
}

fn seconds_header(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

fn summarize(body: &str, status: StatusCode) -> String {
    let body = body.trim();
    if body.is_empty() {
        return status.to_string();
    }
    let mut cut = body.len().min(MAX_BODY_IN_ERROR);
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{status}: {}", &body[..cut])
}

fn transport_error(err: reqwest::Error) -> UpstreamError {
    UpstreamError::Transient {
        message: err.to_string(),
    }
}

/// Turn a response into its body, or the classified failure.
async fn check(response: Response) -> UpstreamResult<String> {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.text().await.map_err(transport_error)?;
    match classify_response(status, &headers, &body, SystemTime::now()) {
        Some(err) => Err(err),
        None => Ok(body),
    }
}

fn build_client(settings: &UpstreamSettings) -> Client {
    Client::builder()
        .timeout(settings.request_timeout())
        .build()
        .unwrap_or_else(|err| {
            warn!(error = %err, "failed to build configured HTTP client; using defaults");
            Client::new()
        })
}

#[derive(Deserialize)]
struct ValueBody {
    value: i64,
    #[serde(default)]
    label: Option<String>,
}

#[derive(Serialize)]
struct WriteBody {
    value: i64,
}

/// reqwest-backed [`UpstreamApi`].
#[derive(Clone)]
pub struct HttpUpstream {
    client: Client,
    base_url: String,
}

impl HttpUpstream {
    pub fn new(settings: &UpstreamSettings) -> Self {
        Self {
            client: build_client(settings),
            base_url: settings.base_url.trim_end_matches('/').to_owned(),
        }
    }

    /// `{base}/groups/{group}/targets/{target}/score`, with the target id escaped as one segment.
    fn target_url(&self, group_id: i64, target_id: &str) -> UpstreamResult<Url> {
        if matches!(target_id, "" | "." | "..") {
            return Err(UpstreamError::Permanent {
                status: 400,
                message: format!("target id {target_id:?} is not a valid path segment"),
            });
        }
        let mut url = Url::parse(&self.base_url).map_err(|err| {
            UpstreamError::ServiceUnavailable {
                message: format!("invalid upstream base URL: {err}"),
            }
        })?;
        let group = group_id.to_string();
        url.path_segments_mut()
            .map_err(|()| UpstreamError::ServiceUnavailable {
                message: "upstream base URL cannot carry a path".into(),
            })?
            .pop_if_empty()
            .extend(["groups", group.as_str(), "targets", target_id, "score"]);
        Ok(url)
    }
}

impl UpstreamApi for HttpUpstream {
    fn read_value(
        &self,
        access_token: String,
        group_id: i64,
        target_id: String,
    ) -> BoxFuture<'static, UpstreamResult<TargetValue>> {
        let this = self.clone();
        Box::pin(async move {
            let url = this.target_url(group_id, &target_id)?;
            debug!(group_id, %target_id, "reading upstream value");
            let response = this
                .client
                .get(url)
                .bearer_auth(access_token)
                .send()
                .await
                .map_err(transport_error)?;
            let body = check(response).await?;
            let parsed: ValueBody =
                serde_json::from_str(&body).map_err(|err| UpstreamError::Transient {
                    message: format!("malformed value response: {err}"),
                })?;
            Ok(TargetValue {
                value: parsed.value,
                label: parsed.label.filter(|label| !label.is_empty()),
            })
        })
    }

    fn write_value(
        &self,
        access_token: String,
        group_id: i64,
        target_id: String,
        value: i64,
    ) -> BoxFuture<'static, UpstreamResult<()>> {
        let this = self.clone();
        Box::pin(async move {
            let url = this.target_url(group_id, &target_id)?;
            debug!(group_id, %target_id, value, "writing upstream value");
            let response = this
                .client
                .put(url)
                .bearer_auth(access_token)
                .json(&WriteBody { value })
                .send()
                .await
                .map_err(transport_error)?;
            check(response).await.map(|_| ())
        })
    }
}

#[derive(Deserialize)]
struct TokenBody {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: u64,
}

/// Refresh-token grant against the upstream OAuth endpoint.
#[derive(Clone)]
pub struct HttpTokenExchanger {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl HttpTokenExchanger {
    pub fn new(settings: &UpstreamSettings) -> Self {
        Self {
            client: build_client(settings),
            token_url: settings.token_url.clone(),
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
        }
    }
}

impl TokenExchanger for HttpTokenExchanger {
    fn refresh(&self, refresh_token: String) -> BoxFuture<'static, UpstreamResult<TokenGrant>> {
        let this = self.clone();
        Box::pin(async move {
            let form = [
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", this.client_id.as_str()),
                ("client_secret", this.client_secret.as_str()),
            ];
            let response = this
                .client
                .post(&this.token_url)
                .form(&form)
                .send()
                .await
                .map_err(transport_error)?;
            let body = check(response).await?;
            let parsed: TokenBody =
                serde_json::from_str(&body).map_err(|err| UpstreamError::Transient {
                    message: format!("malformed token response: {err}"),
                })?;
            Ok(TokenGrant {
                access_token: parsed.access_token,
                refresh_token: parsed.refresh_token.filter(|token| !token.is_empty()),
                expires_in: Duration::from_secs(parsed.expires_in),
            })
        })
    }
}
