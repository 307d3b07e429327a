use async_trait::async_trait;
use farm_agent::{JobSnapshot, JobSpec, PeerLink};
use farm_core::{ChannelKey, ConnectionHandle, Error, PushMessage, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::RpcClient;

/// Reaches other Agents over their network transport. Each call opens a
/// fresh session; peers are contacted rarely enough that pooling buys
/// nothing.
pub struct RpcPeerLink {
    timeout: Duration,
}

impl RpcPeerLink {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn connect(&self, peer: &str) -> Result<RpcClient> {
        RpcClient::connect(peer, self.timeout).await
    }

    async fn open(&self, client: &RpcClient) -> Result<ConnectionHandle> {
        client.call_as("openConnection", Value::Null).await
    }
}

#[async_trait]
impl PeerLink for RpcPeerLink {
    async fn execute_job(&self, peer: &str, spec: &JobSpec, origin: &str) -> Result<bool> {
        let client = self.connect(peer).await?;
        client
            .call_as("executeJob", json!({ "job": spec, "origin": origin }))
            .await
    }

    async fn query_job(&self, peer: &str, job_guid: Uuid) -> Result<Option<JobSnapshot>> {
        let client = self.connect(peer).await?;
        client.call_as("queryJob", json!({ "jobGuid": job_guid })).await
    }

    async fn cancel_job(&self, peer: &str, job_guid: Uuid) -> Result<bool> {
        let client = self.connect(peer).await?;
        let handle = self.open(&client).await?;
        let cancelled = client
            .call_as("cancelJob", json!({ "handle": handle, "jobGuid": job_guid }))
            .await;
        let _ = client.call("closeConnection", json!({ "handle": handle })).await;
        cancelled
    }

    async fn fetch_channel(&self, peer: &str, key: &ChannelKey) -> Result<Option<Vec<u8>>> {
        let client = self.connect(peer).await?;
        let mut pushes = client
            .take_pushes()
            .await
            .ok_or_else(|| Error::Transport("push stream unavailable".into()))?;
        let handle = self.open(&client).await?;

        let job_guid = (!key.is_shared()).then_some(key.job_guid);
        let found: bool = client
            .call_as(
                "requestChannel",
                json!({ "handle": handle, "jobGuid": job_guid, "name": key.name }),
            )
            .await?;
        if !found {
            let _ = client.call("closeConnection", json!({ "handle": handle })).await;
            return Ok(None);
        }

        let mut data = Vec::new();
        let expected = loop {
            let message = tokio::time::timeout(self.timeout, pushes.recv())
                .await?
                .ok_or_else(|| Error::Transport(format!("{} closed mid-transfer of {}", peer, key)))?;
            match message {
                PushMessage::ChannelChunk {
                    job_guid,
                    name,
                    offset,
                    hash,
                    data: chunk,
                    last,
                    ..
                } if job_guid == key.job_guid && name == key.name => {
                    if offset != data.len() as u64 {
                        return Err(Error::Protocol(format!(
                            "chunk of {} at offset {} but {} bytes received",
                            key,
                            offset,
                            data.len()
                        )));
                    }
                    data.extend_from_slice(&chunk);
                    if last {
                        break hash;
                    }
                }
                other => debug!(job = %other.job_guid(), "Ignoring unrelated push during fetch"),
            }
        };
        let _ = client.call("closeConnection", json!({ "handle": handle })).await;

        let actual = farm_storage::content_hash(&data);
        if actual != expected {
            warn!(peer, channel = %key, expected = %expected, actual = %actual, "Fetched channel failed verification");
            return Err(Error::Validation(format!("hash mismatch for {} from {}", key, peer)));
        }
        Ok(Some(data))
    }
}
