//! Authentication driver
//!
//! Implements the two-tier token scheme of the backend: a long-lived refresh
//! token obtained by username/password login, and a short-lived access token
//! obtained with the refresh token. Both are cached in memory with the
//! wall-clock time they were obtained; every accessor re-validates the age
//! of its cache before use.
//!
//! Lifetimes: an access token is re-fetched after 2 minutes. A refresh token
//! forces a fresh login after 13 days; between 7 and 13 days it is
//! proactively rotated (best effort, failures only log a warning). Logout is
//! attempted only while the refresh token can still be server-side
//! invalidated (14 days).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::AuthConfig;
use crate::error::{Error, Result};
use crate::retry::send_with_retry;
use crate::time::{Clock, SystemClock};

const REFRESH_TOKEN_LIFETIME_S: i64 = 13 * 24 * 3600;
const REFRESH_TOKEN_FRESHNESS_S: i64 = 7 * 24 * 3600;
const REFRESH_TOKEN_LOGOUT_WINDOW_S: i64 = 14 * 24 * 3600;
const ACCESS_TOKEN_LIFETIME_S: i64 = 2 * 60;

/// Source of `Authorization` header values.
///
/// The transmitters take any provider, so they can be pointed at an
/// [`ApiDriver`], a static token, or a test double.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// A ready-to-send header value, e.g. `Bearer <token>`
    async fn authorization_header(&self) -> Result<String>;
}

type CachedToken = Option<(DateTime<Utc>, String)>;

/// Thread-safe interface to the backend API with automatic token handling
pub struct ApiDriver {
    config: AuthConfig,
    client: Client,
    clock: Arc<dyn Clock>,
    refresh: Mutex<CachedToken>,
    access: Mutex<CachedToken>,
}

impl ApiDriver {
    pub fn new(config: AuthConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: AuthConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout_s))
            .build()?;
        Ok(Self {
            config,
            client,
            clock,
            refresh: Mutex::new(None),
            access: Mutex::new(None),
        })
    }

    /// Reuse an existing client (shared connection pool)
    pub fn with_client(config: AuthConfig, client: Client) -> Self {
        Self {
            config,
            client,
            clock: Arc::new(SystemClock),
            refresh: Mutex::new(None),
            access: Mutex::new(None),
        }
    }

    fn age_s(cache: &CachedToken, now: DateTime<Utc>) -> Option<i64> {
        cache.as_ref().map(|(dt, _)| (now - *dt).num_seconds())
    }

    /// `Bearer <refresh token>`, logging in or rotating as needed
    pub async fn refresh_token_bearer(&self) -> Result<String> {
        let mut cache = self.refresh.lock().await;
        let now = self.clock.now();
        let age = Self::age_s(&cache, now);
        let needs_login = match age {
            None => true,
            Some(age) => age > REFRESH_TOKEN_LIFETIME_S,
        };
        if needs_login {
            let body = serde_json::json!({
                "username": self.config.username,
                "password": self.config.password,
            });
            let url = format!("{}/auth/login", self.config.auth_url);
            let resp = send_with_retry(&self.config.retry, None, || {
                self.client.post(&url).json(&body)
            })
            .await
            .map_err(|e| Error::Authentication(format!("Unable to login: {e}")))?;
            if resp.status().as_u16() != 200 {
                let text = resp.text().await.unwrap_or_default();
                return Err(Error::Authentication(format!("Unable to login: {text}")));
            }
            let token = resp
                .text()
                .await
                .map_err(|e| Error::Authentication(format!("Unable to login: {e}")))?;
            *cache = Some((now, token));
        } else if age.map(|a| a > REFRESH_TOKEN_FRESHNESS_S).unwrap_or(false) {
            // Best-effort rotation, no retries: the current token stays
            // valid for a while either way.
            if let Some((_, token)) = cache.as_ref() {
                let url = format!("{}/auth/refreshtoken", self.config.auth_url);
                let result = self
                    .client
                    .get(&url)
                    .header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"))
                    .send()
                    .await;
                match result {
                    Ok(resp) if resp.status().as_u16() == 200 => match resp.text().await {
                        Ok(token) => *cache = Some((now, token)),
                        Err(e) => warn!(error = %e, "Unable to renew the refresh token"),
                    },
                    Ok(resp) => {
                        let text = resp.text().await.unwrap_or_default();
                        warn!(body = %text, "Unable to renew the refresh token");
                    }
                    Err(e) => warn!(error = %e, "Unable to renew the refresh token"),
                }
            }
        }
        match cache.as_ref() {
            Some((_, token)) => Ok(format!("Bearer {token}")),
            None => Err(Error::Authentication("No refresh token available".to_string())),
        }
    }

    /// `Bearer <access token>`, re-fetching after two minutes
    pub async fn access_token_bearer(&self) -> Result<String> {
        let mut cache = self.access.lock().await;
        let now = self.clock.now();
        let stale = match Self::age_s(&cache, now) {
            None => true,
            Some(age) => age > ACCESS_TOKEN_LIFETIME_S,
        };
        if stale {
            let url = format!("{}/auth/accesstoken", self.config.auth_url);
            let refresh = RefreshTokenProvider(self);
            let resp = send_with_retry(&self.config.retry, Some(&refresh), || {
                self.client.get(&url)
            })
            .await
            .map_err(|e| match e {
                Error::Authentication(_) => e,
                other => Error::Authentication(format!("Unable to collect an access token: {other}")),
            })?;
            if resp.status().as_u16() != 200 {
                let text = resp.text().await.unwrap_or_default();
                return Err(Error::Authentication(format!(
                    "Unable to collect an access token: {text}"
                )));
            }
            let token = resp.text().await.map_err(|e| {
                Error::Authentication(format!("Unable to collect an access token: {e}"))
            })?;
            *cache = Some((now, token));
        }
        match cache.as_ref() {
            Some((_, token)) => Ok(format!("Bearer {token}")),
            None => Err(Error::Authentication("No access token available".to_string())),
        }
    }

    /// Log out from the API, invalidating the refresh token server-side.
    /// A refresh token older than 14 days has already expired, so no request
    /// is made for it.
    pub async fn close(&self) -> Result<()> {
        let mut refresh = self.refresh.lock().await;
        let now = self.clock.now();
        let token = match (Self::age_s(&refresh, now), refresh.as_ref()) {
            (Some(age), Some((_, token))) if age <= REFRESH_TOKEN_LOGOUT_WINDOW_S => token.clone(),
            _ => return Ok(()),
        };
        let url = format!("{}/auth/logout", self.config.auth_url);
        let resp = send_with_retry(&self.config.retry, None, || {
            self.client
                .post(&url)
                .header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"))
        })
        .await
        .map_err(|e| Error::Authentication(format!("Unable to logout: {e}")))?;
        match resp.status().as_u16() {
            // Either the token joined the deny list or it was already invalid
            204 | 401 => {
                *refresh = None;
                // Release the refresh lock before taking the access lock:
                // access_token_bearer acquires them in the opposite order.
                drop(refresh);
                *self.access.lock().await = None;
                Ok(())
            }
            _ => {
                let text = resp.text().await.unwrap_or_default();
                Err(Error::Authentication(format!("Unable to logout: {text}")))
            }
        }
    }

    fn absolute_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.config.api_url, path)
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        json: Option<serde_json::Value>,
        params: &[(String, String)],
    ) -> Result<Response> {
        let url = self.absolute_url(path);
        send_with_retry(&self.config.retry, Some(self), || {
            let mut request = self.client.request(method.clone(), &url).query(params);
            if let Some(body) = &json {
                request = request.json(body);
            }
            request
        })
        .await
    }

    /// API GET call to `path` (relative to the api url, or absolute)
    pub async fn get(&self, path: &str, params: &[(String, String)]) -> Result<Response> {
        self.request(Method::GET, path, None, params).await
    }

    /// API POST call with an optional JSON body
    pub async fn post(
        &self,
        path: &str,
        json: Option<serde_json::Value>,
        params: &[(String, String)],
    ) -> Result<Response> {
        self.request(Method::POST, path, json, params).await
    }

    /// API PUT call with an optional JSON body
    pub async fn put(
        &self,
        path: &str,
        json: Option<serde_json::Value>,
        params: &[(String, String)],
    ) -> Result<Response> {
        self.request(Method::PUT, path, json, params).await
    }

    /// API DELETE call
    pub async fn delete(&self, path: &str, params: &[(String, String)]) -> Result<Response> {
        self.request(Method::DELETE, path, None, params).await
    }
}

/// Borrows the driver's refresh token for the access-token request
struct RefreshTokenProvider<'a>(&'a ApiDriver);

#[async_trait]
impl AuthProvider for RefreshTokenProvider<'_> {
    async fn authorization_header(&self) -> Result<String> {
        self.0.refresh_token_bearer().await
    }
}

#[async_trait]
impl AuthProvider for ApiDriver {
    async fn authorization_header(&self) -> Result<String> {
        self.access_token_bearer().await
    }
}

/// A fixed header value, for deployments with a pre-provisioned token
pub struct StaticAuthProvider(pub String);

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn authorization_header(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_url_joins_relative_paths() {
        let config = AuthConfig::new("u", "p", "https://auth.example.com", "https://api.example.com");
        let driver = ApiDriver::new(config).expect("client");
        assert_eq!(
            driver.absolute_url("/v1/devices"),
            "https://api.example.com/v1/devices"
        );
        assert_eq!(
            driver.absolute_url("https://elsewhere.example.com/x"),
            "https://elsewhere.example.com/x"
        );
    }
}
