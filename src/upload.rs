//! Blocking telemessage transmission
//!
//! The inline counterpart to the background transmitter: the retry loop runs
//! on the caller's task and the call does not return until the message was
//! accepted, a permanent error was received, or the retries ran out.

use async_trait::async_trait;
use reqwest::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::AuthProvider;
use crate::config::TransmitterConfig;
use crate::error::{Error, Result};
use crate::retry::send_with_retry;
use crate::telemessage::Telemessage;
use crate::writer::TelemessageWriter;

/// Posts each telemessage synchronously, retrying inline
pub struct DirectTelemessageWriter {
    config: TransmitterConfig,
    client: Client,
    auth: Option<Arc<dyn AuthProvider>>,
}

impl DirectTelemessageWriter {
    pub fn new(config: TransmitterConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout_s))
            .build()?;
        Ok(Self {
            config,
            client,
            auth: None,
        })
    }

    /// Attach an authorization source; every attempt bears a fresh header
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Reuse an existing client (shared connection pool)
    pub fn with_client(config: TransmitterConfig, client: Client) -> Self {
        Self {
            config,
            client,
            auth: None,
        }
    }
}

#[async_trait]
impl TelemessageWriter for DirectTelemessageWriter {
    /// Blocks until the message is accepted (204). Any other final status is
    /// surfaced as [`Error::UnexpectedResponse`].
    async fn write_telemessage(&self, message: Telemessage) -> Result<()> {
        let mut params: BTreeMap<&str, &str> = self
            .config
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        for (k, v) in &message.parameters {
            params.insert(k, v);
        }
        let params: Vec<(&str, &str)> = params.into_iter().collect();

        let resp = send_with_retry(&self.config.retry, self.auth.as_deref(), || {
            let mut request = self
                .client
                .post(&self.config.url)
                .query(&params)
                .body(message.data.clone());
            for (key, value) in &message.headers {
                request = request.header(key.as_str(), value.as_str());
            }
            request
        })
        .await?;

        let status = resp.status().as_u16();
        if status != 204 {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::UnexpectedResponse { status, body });
        }
        Ok(())
    }
}
