//! HTTP client for services registered through the legacy API

use std::time::Duration;

use async_trait::async_trait;
use covhub_transport::{TransportError, TransportResult};
use reqwest::Client;
use tracing::debug;

use crate::connection::ProfileSource;

const PROFILE_PATH: &str = "/v1/cover/profile";
const CLEAR_PATH: &str = "/v1/cover/clear";

/// A legacy service reached over plain HTTP
#[derive(Debug, Clone)]
pub struct ServiceClient {
    address: String,
    http: Client,
    timeout: Duration,
}

impl ServiceClient {
    /// `address` is a normalized `scheme://host[:port]`
    pub fn new(address: impl Into<String>, http: Client, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            http,
            timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn post(&self, path: &str) -> TransportResult<String> {
        let url = format!("{}{}", self.address, path);
        debug!(url = %url, "Calling service");

        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.request_error(e))?;
        if !status.is_success() {
            return Err(TransportError::Rejected(format!(
                "{} returned {}: {}",
                url,
                status,
                body.trim()
            )));
        }
        Ok(body)
    }

    fn request_error(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            TransportError::Io(std::io::Error::other(err))
        }
    }
}

#[async_trait]
impl ProfileSource for ServiceClient {
    fn label(&self) -> String {
        self.address.clone()
    }

    async fn fetch_profile(&self) -> TransportResult<String> {
        self.post(PROFILE_PATH).await
    }

    async fn clear_profile(&self) -> TransportResult<String> {
        self.post(CLEAR_PATH).await.map(|body| body.trim().to_string())
    }
}
