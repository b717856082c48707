//! HTTP POST transport for the monitoring RPC endpoint.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::debug;

use crate::error::TransportError;

/// Posts a request body and returns the raw response body.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn post(&self, body: Vec<u8>) -> Result<Vec<u8>, TransportError>;
}

/// Monitoring endpoint of an experiment, reached through the resource API.
pub struct HttpTransport {
    client: Client,
    url: String,
    username: String,
    password: String,
}

impl HttpTransport {
    pub fn new(
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .build()
            .map_err(|e| TransportError::Request(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            username: username.into(),
            password: password.into(),
        })
    }

    /// Endpoint for `experiment` under the API base URL.
    pub fn for_experiment(
        base_url: &str,
        experiment: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let url = format!(
            "{}/experiments/{experiment}/zabbix",
            base_url.trim_end_matches('/')
        );
        Self::new(url, username, password)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn post(&self, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        debug!(url = %self.url, bytes = body.len(), "monitoring rpc post");
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }
        // The body is JSON whatever the declared content type.
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn experiment_endpoint_url() {
        let t = HttpTransport::for_experiment("https://api.example.org/", "42", "alice", "pw")
            .unwrap();
        assert_eq!(t.url(), "https://api.example.org/experiments/42/zabbix");
    }
}
