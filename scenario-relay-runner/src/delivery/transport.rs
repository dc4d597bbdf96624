// Copyright (c) The scenario-relay Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::TransportError;
use http::StatusCode;
use std::time::Duration;

/// Extra request headers, as `(name, value)` pairs.
pub type Headers = [(&'static str, String)];

/// Blocking access to the collector over HTTP.
///
/// The [`DeliveryPipeline`](super::DeliveryPipeline) only calls this from
/// blocking tasks, so implementations are free to block.
pub trait CollectorTransport: Send + Sync + 'static {
    /// Posts `body` as JSON to `url` and returns the parsed JSON response.
    ///
    /// Any status other than 200 is an error.
    fn post_json(
        &self,
        url: &str,
        headers: &Headers,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, TransportError>;

    /// Uploads `bytes` to a pre-signed `url`.
    fn put_bytes(&self, url: &str, bytes: &[u8]) -> Result<(), TransportError>;
}

/// A [`CollectorTransport`] backed by `ureq`.
#[derive(Debug)]
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    /// Creates a transport whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self { agent }
    }
}

impl CollectorTransport for UreqTransport {
    fn post_json(
        &self,
        url: &str,
        headers: &Headers,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let body = serde_json::to_string(body)
            .map_err(|error| TransportError::InvalidJson { error })?;
        let mut request = self.agent.post(url).content_type("application/json");
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }

        let mut response = request.send(body).map_err(request_error)?;
        let status = response.status();
        let text = response.body_mut().read_to_string().map_err(request_error)?;
        if status != StatusCode::OK {
            return Err(TransportError::Status {
                status,
                body: Some(text),
            });
        }
        serde_json::from_str(&text).map_err(|error| TransportError::InvalidJson { error })
    }

    fn put_bytes(&self, url: &str, bytes: &[u8]) -> Result<(), TransportError> {
        let mut response = self
            .agent
            .put(url)
            .content_type("application/octet-stream")
            .send(bytes)
            .map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.body_mut().read_to_string().ok();
            return Err(TransportError::Status { status, body });
        }
        Ok(())
    }
}

fn request_error(error: ureq::Error) -> TransportError {
    TransportError::Request {
        error: Box::new(error),
    }
}
