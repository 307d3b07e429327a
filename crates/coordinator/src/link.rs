use async_trait::async_trait;
use farm_core::{Error, Result};
use std::time::Duration;
use tracing::debug;

use crate::protocol::{PingReport, PingResponse};

/// Transport to the coordinator service.
#[async_trait]
pub trait CoordinatorLink: Send + Sync {
    async fn register(&self, report: &PingReport) -> Result<PingResponse>;
    async fn ping(&self, report: &PingReport) -> Result<PingResponse>;
}

/// JSON over HTTP: `POST {url}/v1/agents/register` and `/v1/agents/ping`.
pub struct HttpCoordinator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCoordinator {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Coordinator(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, path: &str, report: &PingReport) -> Result<PingResponse> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(report)
            .send()
            .await
            .map_err(|e| Error::Coordinator(format!("Coordinator request failed: {}", e)))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::Coordinator(format!("Coordinator returned {}: {}", status, body)));
        }
        debug!(url = %url, "Coordinator responded");
        if body.trim().is_empty() {
            return Ok(PingResponse::default());
        }
        serde_json::from_str(&body)
            .map_err(|e| Error::Coordinator(format!("Invalid JSON from coordinator: {}", e)))
    }
}

#[async_trait]
impl CoordinatorLink for HttpCoordinator {
    async fn register(&self, report: &PingReport) -> Result<PingResponse> {
        self.post("/v1/agents/register", report).await
    }

    async fn ping(&self, report: &PingReport) -> Result<PingResponse> {
        self.post("/v1/agents/ping", report).await
    }
}
