//! reqwest-backed transport to the upstream API.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::{Result, Transport, UpstreamError, UpstreamRequest, UpstreamResponse};
use crate::config::UpstreamConfig;

/// HTTP transport. Holds a pooled `reqwest::Client`.
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| UpstreamError::Transient(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &UpstreamRequest) -> Result<UpstreamResponse> {
        let response = self
            .client
            .get(self.url(&request.path))
            .query(&request.query)
            .send()
            .await
            .map_err(|e| UpstreamError::Transient(e.to_string()))?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::Transient(format!("Failed to read body: {}", e)))?
            .to_vec();

        debug!(path = %request.path, status, bytes = body.len(), "Upstream response");

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        let config = UpstreamConfig {
            base_url: "https://api.example.com/latest/".to_string(),
            ..Default::default()
        };
        let transport = HttpTransport::new(&config).unwrap();

        assert_eq!(
            transport.url("/alliances/1/"),
            "https://api.example.com/latest/alliances/1/"
        );
        assert_eq!(
            transport.url("alliances/"),
            "https://api.example.com/latest/alliances/"
        );
    }
}
