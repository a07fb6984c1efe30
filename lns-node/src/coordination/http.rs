use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use super::{BundledCoordinationResult, CoordinationEndpoint, CoordinationRequest};
use crate::error::{CoordinationError, LnsError, Result};

/// Bundled endpoint reached over HTTP.
///
/// `POST {base}/api/FunctionBundler/{DevEUI}` with the request as JSON and the
/// function key as the `code` query parameter.
#[derive(Debug, Clone)]
pub struct HttpCoordinationEndpoint {
    client: Client,
    base_url: String,
    auth_code: Option<String>,
}

impl HttpCoordinationEndpoint {
    /// `timeout` bounds the whole exchange; the coordination client applies
    /// its own per-attempt timeout on top.
    pub fn new(base_url: &str, auth_code: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LnsError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_code,
        })
    }

    fn url(&self, request: &CoordinationRequest) -> String {
        format!("{}/api/FunctionBundler/{}", self.base_url, request.dev_eui)
    }
}

/// Map a non-success status to its failure class
fn classify_status(status: StatusCode, body: &str) -> CoordinationError {
    let reason = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body.chars().take(256).collect::<String>())
    };

    if status.is_server_error() {
        CoordinationError::transient(reason)
    } else {
        CoordinationError::non_transient(Some(status.as_u16()), reason)
    }
}

fn classify_transport(err: reqwest::Error) -> CoordinationError {
    if err.is_builder() || err.is_decode() {
        CoordinationError::non_transient(err.status().map(|s| s.as_u16()), err.to_string())
    } else {
        // connect, timeout, reset, body read
        CoordinationError::transient(err.to_string())
    }
}

#[async_trait]
impl CoordinationEndpoint for HttpCoordinationEndpoint {
    async fn call(
        &self,
        request: &CoordinationRequest,
    ) -> std::result::Result<BundledCoordinationResult, CoordinationError> {
        let mut builder = self.client.post(self.url(request)).json(request);
        if let Some(code) = &self.auth_code {
            builder = builder.query(&[("code", code)]);
        }

        let response = builder.send().await.map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let bytes = response.bytes().await.map_err(classify_transport)?;
        let result: BundledCoordinationResult = serde_json::from_slice(&bytes).map_err(|e| {
            CoordinationError::non_transient(
                Some(status.as_u16()),
                format!("malformed coordination response: {}", e),
            )
        })?;

        debug!(
            dev_eui = %request.dev_eui,
            status = status.as_u16(),
            duplicate = result.dedup.is_duplicate,
            "Coordination endpoint answered"
        );
        Ok(result)
    }
}
