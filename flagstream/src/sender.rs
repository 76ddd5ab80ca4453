//! HTTP sender used to ship event payloads to the flag-control service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::Error;
use crate::protocol;

/// Failure of a send after all retries.
#[derive(Debug, Clone, Error)]
#[error("send failed: {0}")]
pub struct SendError(pub String);

/// A component that POSTs JSON to the flag-control service.
#[async_trait]
pub trait Sender: Send + Sync {
    /// POST `body` to `url`. On success the response body is returned only
    /// when `fetch_response` is set.
    async fn post_json(
        &self,
        url: &str,
        body: String,
        fetch_response: bool,
    ) -> Result<Option<String>, SendError>;

    /// Release the underlying connections.
    async fn stop(&self);
}

/// The default sender: synchronous retrying POST over a shared
/// `reqwest::Client`.
pub struct HttpEventSender {
    name: &'static str,
    client: reqwest::Client,
    retry_interval: Duration,
    max_retries: u32,
}

impl HttpEventSender {
    pub fn new(name: &'static str, config: &Config) -> Result<Self, Error> {
        let http = config.http();
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(config.env_secret())
                .map_err(|_| Error::InvalidEnvSecret)?,
        );
        headers.insert(USER_AGENT, HeaderValue::from_static(protocol::USER_AGENT));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs_f64(http.connect_timeout))
            .timeout(Duration::from_secs_f64(http.read_timeout))
            .danger_accept_invalid_certs(http.disable_ssl_verification);

        if let Some(proxy_url) = &http.proxy_url {
            let mut proxy = reqwest::Proxy::all(proxy_url).map_err(transport_error)?;
            if let Some((user, password)) = &http.proxy_auth {
                proxy = proxy.basic_auth(user, password);
            }
            builder = builder.proxy(proxy);
        }
        if let Some(path) = &http.ca_certs {
            let pem = std::fs::read(path).map_err(transport_error)?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(transport_error)?;
            builder = builder.add_root_certificate(certificate);
        }
        if let (Some(cert), Some(key)) = (&http.cert_file, &http.cert_key_file) {
            let cert = std::fs::read(cert).map_err(transport_error)?;
            let key = std::fs::read(key).map_err(transport_error)?;
            let identity =
                reqwest::Identity::from_pkcs8_pem(&cert, &key).map_err(transport_error)?;
            builder = builder.identity(identity);
        }

        Ok(Self {
            name,
            client: builder.build().map_err(transport_error)?,
            retry_interval: Duration::from_secs_f64(config.events_retry_interval()),
            max_retries: config.events_max_retries(),
        })
    }
}

fn transport_error(error: impl std::fmt::Display) -> Error {
    Error::InvalidHttpTransport(error.to_string())
}

#[async_trait]
impl Sender for HttpEventSender {
    async fn post_json(
        &self,
        url: &str,
        body: String,
        fetch_response: bool,
    ) -> Result<Option<String>, SendError> {
        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_interval).await;
            }
            match self.client.post(url).body(body.clone()).send().await {
                Ok(response) if response.status() == StatusCode::OK => {
                    debug!(sender = self.name, "sending ok");
                    if fetch_response {
                        return Ok(response.text().await.ok());
                    }
                    return Ok(None);
                }
                Ok(response) => {
                    last_error = format!("unexpected status {}", response.status());
                    warn!(sender = self.name, status = %response.status(), "sending failed");
                }
                Err(error) => {
                    last_error = error.to_string();
                    warn!(sender = self.name, error = %error, "sending error");
                }
            }
        }
        Err(SendError(last_error))
    }

    async fn stop(&self) {
        debug!(sender = self.name, "sender is stopping");
    }
}
