use farm_agent::Agent;
use farm_core::{ConnectionHandle, PushMessage, RemoteIdentity, TransportKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::Frame;
use crate::registry::CommandRegistry;

/// Pushes queued per session before notices start being dropped.
pub const PUSH_QUEUE: usize = 256;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Per-session state handed to every handler.
pub struct SessionContext {
    pub agent: Arc<Agent>,
    pub remote: RemoteIdentity,
    push: mpsc::Sender<PushMessage>,
}

impl SessionContext {
    /// Every context gets a fresh session id, stamped on `remote`.
    pub fn new(agent: Arc<Agent>, remote: RemoteIdentity, push: mpsc::Sender<PushMessage>) -> Self {
        let remote = remote.with_session(NEXT_SESSION.fetch_add(1, Ordering::Relaxed));
        Self { agent, remote, push }
    }

    pub fn session_id(&self) -> Option<u64> {
        self.remote.session
    }

    /// Handles opened on another session are treated as unknown.
    pub async fn owns(&self, handle: ConnectionHandle) -> bool {
        self.agent.owns_connection(handle, &self.remote).await
    }

    /// Admin commands are only honoured for callers on this machine.
    pub fn is_local(&self) -> bool {
        matches!(
            self.remote.transport,
            TransportKind::Local | TransportKind::InProcess
        )
    }

    pub fn push_sender(&self) -> mpsc::Sender<PushMessage> {
        self.push.clone()
    }
}

/// Transport-independent request loop. The transport feeds decoded lines
/// into `inbound` and writes whatever arrives on `outbound`.
pub struct Session {
    agent: Arc<Agent>,
    registry: Arc<CommandRegistry>,
    remote: RemoteIdentity,
}

impl Session {
    pub fn new(agent: Arc<Agent>, registry: Arc<CommandRegistry>, remote: RemoteIdentity) -> Self {
        Self {
            agent,
            registry,
            remote,
        }
    }

    /// Runs until `inbound` closes. Each request is handled on its own task
    /// so a slow call never holds up the rest of the session.
    pub async fn run(self, mut inbound: mpsc::Receiver<String>, outbound: mpsc::Sender<String>) {
        let remote = self.remote.clone();
        info!(transport = %remote.transport, address = %remote.address, pid = ?remote.process_id, "Session opened");

        let (push_tx, mut push_rx) = mpsc::channel::<PushMessage>(PUSH_QUEUE);
        let ctx = Arc::new(SessionContext::new(self.agent, remote.clone(), push_tx));

        let push_out = outbound.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(message) = push_rx.recv().await {
                let line = match (Frame::Push { message }).encode() {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode push");
                        continue;
                    }
                };
                if push_out.send(line).await.is_err() {
                    break;
                }
            }
        });

        while let Some(line) = inbound.recv().await {
            if line.trim().is_empty() {
                continue;
            }
            match Frame::parse(&line) {
                Ok(Frame::Request { id, method, params }) => {
                    let ctx = Arc::clone(&ctx);
                    let registry = Arc::clone(&self.registry);
                    let out = outbound.clone();
                    tokio::spawn(async move {
                        debug!(id, method = %method, "RPC request");
                        let outcome = registry.dispatch(ctx, &method, params).await;
                        if let Err(e) = &outcome {
                            debug!(id, method = %method, error = %e, "RPC request failed");
                        }
                        match Frame::reply(id, outcome).encode() {
                            Ok(reply) => {
                                let _ = out.send(reply).await;
                            }
                            Err(e) => warn!(id, error = %e, "Failed to encode reply"),
                        }
                    });
                }
                Ok(_) => warn!("Ignoring non-request frame from client"),
                Err(e) => {
                    warn!(error = %e, "Malformed frame");
                    if let Ok(reply) = Frame::reply(0, Err(e)).encode() {
                        let _ = outbound.send(reply).await;
                    }
                }
            }
        }

        // Dropping the receiver closes the push link; the connection
        // manager reclaims this session's connections from there.
        forwarder.abort();
        info!(transport = %remote.transport, address = %remote.address, "Session closed");
    }
}

/// Wires a session to in-memory channels. Returns the caller's ends.
pub fn spawn_in_process(
    agent: Arc<Agent>,
    registry: Arc<CommandRegistry>,
    label: &str,
) -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
    let (in_tx, in_rx) = mpsc::channel(PUSH_QUEUE);
    let (out_tx, out_rx) = mpsc::channel(PUSH_QUEUE);
    let session = Session::new(agent, registry, RemoteIdentity::in_process(label));
    tokio::spawn(session.run(in_rx, out_tx));
    (in_tx, out_rx)
}
