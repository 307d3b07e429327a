use farm_agent::Agent;
use farm_core::{Error, PushMessage, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::Frame;
use crate::registry::CommandRegistry;
use crate::session::{spawn_in_process, PUSH_QUEUE};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// Client side of the RPC surface, used by `farmd` subcommands and by
/// Agents talking to each other.
///
/// Addresses are either a socket path (`unix:/run/farm/agent.sock` or a
/// bare absolute path), `host:port`, or a full `ws://` URL.
pub struct RpcClient {
    outbound: mpsc::Sender<String>,
    pending: Pending,
    next_id: AtomicU64,
    pushes: Mutex<Option<mpsc::Receiver<PushMessage>>>,
    timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl RpcClient {
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self> {
        if let Some(path) = address.strip_prefix("unix:") {
            return Self::connect_local(path, timeout).await;
        }
        if address.starts_with('/') {
            return Self::connect_local(address, timeout).await;
        }
        Self::connect_network(address, timeout).await
    }

    pub fn in_process(agent: Arc<Agent>, registry: Arc<CommandRegistry>, timeout: Duration) -> Self {
        let (outbound, inbound) = spawn_in_process(agent, registry, "in-process");
        Self::from_channels(outbound, inbound, timeout, Vec::new())
    }

    #[cfg(unix)]
    async fn connect_local(path: &str, timeout: Duration) -> Result<Self> {
        use futures::{SinkExt, StreamExt};

        let stream = tokio::time::timeout(timeout, tokio::net::UnixStream::connect(path))
            .await?
            .map_err(|e| Error::Transport(format!("connect {}: {}", path, e)))?;
        let (mut sink, mut lines) = crate::local::unix::framed(stream).split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(PUSH_QUEUE);
        let (in_tx, in_rx) = mpsc::channel::<String>(PUSH_QUEUE);

        let writer = tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                if sink.send(line).await.is_err() {
                    break;
                }
            }
        });
        let reader = tokio::spawn(async move {
            while let Some(Ok(line)) = lines.next().await {
                if in_tx.send(line).await.is_err() {
                    break;
                }
            }
        });
        Ok(Self::from_channels(out_tx, in_rx, timeout, vec![writer, reader]))
    }

    #[cfg(not(unix))]
    async fn connect_local(path: &str, _timeout: Duration) -> Result<Self> {
        Err(Error::Transport(format!(
            "local transport at {} is not supported on this platform",
            path
        )))
    }

    async fn connect_network(address: &str, timeout: Duration) -> Result<Self> {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let url = if address.starts_with("ws://") {
            address.to_string()
        } else {
            format!("ws://{}/v1/rpc", address)
        };
        let (ws_stream, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str()))
            .await?
            .map_err(|e| Error::Transport(format!("WebSocket connection to {} failed: {}", url, e)))?;
        let (mut write, mut read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(PUSH_QUEUE);
        let (in_tx, in_rx) = mpsc::channel::<String>(PUSH_QUEUE);

        let writer = tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                if write.send(WsMessage::Text(line)).await.is_err() {
                    break;
                }
            }
            let _ = write.send(WsMessage::Close(None)).await;
        });
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        if in_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "WebSocket read failed");
                        break;
                    }
                }
            }
        });
        Ok(Self::from_channels(out_tx, in_rx, timeout, vec![writer, reader]))
    }

    fn from_channels(
        outbound: mpsc::Sender<String>,
        mut inbound: mpsc::Receiver<String>,
        timeout: Duration,
        mut tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (push_tx, push_rx) = mpsc::channel::<PushMessage>(PUSH_QUEUE);

        let table = Arc::clone(&pending);
        tasks.push(tokio::spawn(async move {
            while let Some(line) = inbound.recv().await {
                match Frame::parse(&line) {
                    Ok(Frame::Response { id, result, error }) => {
                        let outcome = match error {
                            Some(message) => Err(Error::Other(message)),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        match table.lock().await.remove(&id) {
                            Some(waiter) => {
                                let _ = waiter.send(outcome);
                            }
                            None => warn!(id, "Reply for unknown request"),
                        }
                    }
                    Ok(Frame::Push { message }) => {
                        if push_tx.try_send(message).is_err() {
                            debug!("Push dropped, receiver full or gone");
                        }
                    }
                    Ok(Frame::Request { .. }) => warn!("Server sent a request frame"),
                    Err(e) => warn!(error = %e, "Malformed frame from server"),
                }
            }
            // Waiters see their sender dropped and fail with a transport error.
            table.lock().await.clear();
        }));

        Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            pushes: Mutex::new(Some(push_rx)),
            timeout,
            tasks,
        }
    }

    /// Hands out the push stream. Only the first caller gets it.
    pub async fn take_pushes(&self) -> Option<mpsc::Receiver<PushMessage>> {
        self.pushes.lock().await.take()
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let line = Frame::request(id, method, params).encode()?;
        if self.outbound.send(line).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(Error::Transport("connection closed".into()));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::Transport(format!("connection closed during {}", method))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::Timeout(format!("{} got no reply within {:?}", method, self.timeout)))
            }
        }
    }

    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self.call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farm_agent::AgentDeps;
    use farm_core::{Config, Paths};
    use serde_json::json;
    use tempfile::TempDir;

    async fn agent(dir: &TempDir) -> Arc<Agent> {
        let mut config = Config::default();
        config.agent.tick_interval_ms = 60_000;
        let agent = Agent::new(
            config,
            Paths::with_base(dir.path().to_path_buf()),
            AgentDeps::standalone(),
        );
        agent.init(None).await.unwrap();
        agent
    }

    #[tokio::test]
    async fn test_in_process_round_trip() {
        let dir = TempDir::new().unwrap();
        let client = RpcClient::in_process(
            agent(&dir).await,
            Arc::new(CommandRegistry::with_defaults()),
            Duration::from_secs(5),
        );
        let handle: u64 = client.call_as("openConnection", Value::Null).await.unwrap();
        let alive: bool = client
            .call_as("testConnection", json!({ "handle": handle }))
            .await
            .unwrap();
        assert!(alive);
        assert!(client.call("noSuchMethod", Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn test_request_channel_streams_pushes() {
        let dir = TempDir::new().unwrap();
        let client = RpcClient::in_process(
            agent(&dir).await,
            Arc::new(CommandRegistry::with_defaults()),
            Duration::from_secs(5),
        );
        let mut pushes = client.take_pushes().await.unwrap();
        assert!(client.take_pushes().await.is_none());

        let handle: u64 = client.call_as("openConnection", Value::Null).await.unwrap();
        let sent: bool = client
            .call_as(
                "sendChannel",
                json!({ "handle": handle, "name": "frames", "data": "AQID" }),
            )
            .await
            .unwrap();
        assert!(sent);

        let found: bool = client
            .call_as("requestChannel", json!({ "handle": handle, "name": "frames" }))
            .await
            .unwrap();
        assert!(found);

        let mut received = Vec::new();
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), pushes.recv())
                .await
                .unwrap()
                .unwrap();
            if let PushMessage::ChannelChunk { data, last, .. } = message {
                received.extend_from_slice(&data);
                if last {
                    break;
                }
            }
        }
        assert_eq!(received, vec![1, 2, 3]);
    }
}
