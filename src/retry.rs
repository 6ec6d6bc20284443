//! Shared HTTP retry loop
//!
//! One retry policy serves both the auth driver and the blocking
//! transmitter: retry-eligible response statuses, request timeouts and
//! connection errors back off exponentially until `max_retries` is
//! exhausted, everything else is returned to the caller as-is. The request
//! is rebuilt on every attempt so that a fresh authorization header can be
//! attached.

use reqwest::{RequestBuilder, Response};
use tracing::warn;

use crate::auth::AuthProvider;
use crate::config::RetryPolicy;
use crate::error::{Error, Result};

/// Send a request, retrying per `policy`.
///
/// When `auth` is set, each attempt bears a freshly evaluated
/// `Authorization` header. The final response is returned regardless of its
/// status; callers decide what a success looks like.
pub async fn send_with_retry<F>(
    policy: &RetryPolicy,
    auth: Option<&dyn AuthProvider>,
    build: F,
) -> Result<Response>
where
    F: Fn() -> RequestBuilder + Send + Sync,
{
    let mut retry_nr: u32 = 0;
    loop {
        let mut request = build();
        if let Some(auth) = auth {
            request = request.header(
                reqwest::header::AUTHORIZATION,
                auth.authorization_header().await?,
            );
        }
        match request.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if policy.should_retry_status(status) && retry_nr + 1 <= policy.max_retries {
                    let body = resp.text().await.unwrap_or_default();
                    warn!(status, body = %body, "Retrying request after retry-eligible response");
                    tokio::time::sleep(policy.backoff(retry_nr)).await;
                    retry_nr += 1;
                } else {
                    return Ok(resp);
                }
            }
            Err(e) if (e.is_timeout() || e.is_connect()) && retry_nr + 1 <= policy.max_retries => {
                warn!(error = %e, "Retrying request after transport error");
                tokio::time::sleep(policy.backoff(retry_nr)).await;
                retry_nr += 1;
            }
            Err(e) => return Err(Error::Transport(e)),
        }
    }
}
