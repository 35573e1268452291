//! HTTP client for the collector
//!
//! [`HttpSender`] is the seam between the delivery logic and the network:
//! one POST of a JSON body, answering with the response status. Everything
//! above it (status classification, retries, transport choice) is shared
//! between the production [`ReqwestSender`] and test doubles.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use url::Url;

use crate::error::{Error, Result};

/// Request timeout used when none is configured
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying the site's client id
pub const CLIENT_ID_HEADER: &str = "x-sightline-client-id";

/// Posts JSON bodies to the collector
#[async_trait]
pub trait HttpSender: Send + Sync {
    /// POST `body` (already-encoded JSON) to `url`.
    ///
    /// Any response, success or not, is `Ok(status)`; `Err` means no
    /// response was received.
    async fn post_json(&self, url: &Url, body: &str) -> Result<u16>;
}

/// [`HttpSender`] over a shared `reqwest::Client`
#[derive(Clone)]
pub struct ReqwestSender {
    http_client: reqwest::Client,
}

impl ReqwestSender {
    /// Client sending `client_id` with every request
    pub fn new(client_id: &str, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            CLIENT_ID_HEADER,
            HeaderValue::from_str(client_id)
                .map_err(|e| Error::Config(format!("invalid clientId: {}", e)))?,
        );

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }
}

#[async_trait]
impl HttpSender for ReqwestSender {
    async fn post_json(&self, url: &Url, body: &str) -> Result<u16> {
        let response = self
            .http_client
            .post(url.clone())
            .body(body.to_string())
            .send()
            .await?;
        Ok(response.status().as_u16())
    }
}

/// Map a response status to the delivery outcome
pub fn check_status(status: u16) -> Result<()> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(Error::Http { status })
    }
}
