use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use farm_agent::Agent;
use farm_core::{Error, RemoteIdentity, Result};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::registry::CommandRegistry;
use crate::session::{Session, PUSH_QUEUE};
use crate::transport::Listener;

/// WebSocket transport. One text message carries one frame.
pub struct NetworkListener {
    listener: TcpListener,
    addr: SocketAddr,
}

impl NetworkListener {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Transport(format!("bind {}: {}", addr, e)))?;
        let addr = listener.local_addr()?;
        Ok(Self { listener, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[derive(Clone)]
struct NetworkState {
    agent: Arc<Agent>,
    registry: Arc<CommandRegistry>,
}

#[async_trait]
impl Listener for NetworkListener {
    fn describe(&self) -> String {
        format!("network:{}", self.addr)
    }

    async fn serve(
        self: Box<Self>,
        agent: Arc<Agent>,
        registry: Arc<CommandRegistry>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let state = NetworkState { agent, registry };
        let app = Router::new()
            .route("/v1/rpc", get(handle_rpc_upgrade))
            .route("/v1/health", get(handle_health))
            .with_state(state);

        info!(addr = %self.addr, "Network transport listening");
        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
        info!(addr = %self.addr, "Network transport stopped");
        Ok(())
    }
}

async fn handle_health(State(state): State<NetworkState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "state": state.agent.state(),
        "agentId": state.agent.agent_id(),
    }))
}

async fn handle_rpc_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<NetworkState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_rpc_socket(socket, state, addr))
}

async fn handle_rpc_socket(socket: WebSocket, state: NetworkState, addr: SocketAddr) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (in_tx, in_rx) = mpsc::channel::<String>(PUSH_QUEUE);
    let (out_tx, mut out_rx) = mpsc::channel::<String>(PUSH_QUEUE);

    let send_task = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if ws_sender.send(WsMessage::Text(line)).await.is_err() {
                break;
            }
        }
    });

    let session = Session::new(state.agent, state.registry, RemoteIdentity::network(addr.to_string()));
    let session_task = tokio::spawn(session.run(in_rx, out_tx));

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %addr, error = %e, "WebSocket receive error");
                break;
            }
        };
        match msg {
            WsMessage::Text(text) => {
                if in_tx.send(text).await.is_err() {
                    break;
                }
            }
            WsMessage::Close(_) => {
                debug!(peer = %addr, "WebSocket closed by peer");
                break;
            }
            _ => {}
        }
    }

    drop(in_tx);
    let _ = session_task.await;
    send_task.abort();
}
