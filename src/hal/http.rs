//! `reqwest`-backed [`HttpClient`].

use std::time::Duration;

use crate::error::TransportError;
use crate::traits::{HttpClient, HttpRequest, HttpResponse};

/// Connect and read timeout applied to every request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// [`HttpClient`] over a shared `reqwest::Client` (rustls).
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Client with the default timeouts.
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::new(e.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpClient for ReqwestClient {
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value.as_str());
        }
        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::new(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::new(e.to_string()))?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}
