use async_trait::async_trait;
use farm_agent::Agent;
use farm_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::registry::CommandRegistry;
use crate::transport::Listener;

/// Unix-socket transport for callers on this machine. Frames are
/// newline-delimited JSON.
pub struct LocalListener {
    path: PathBuf,
    #[cfg(unix)]
    listener: tokio::net::UnixListener,
}

#[cfg(unix)]
impl LocalListener {
    /// A socket file with a live listener behind it means another Agent
    /// owns it. A file nobody answers on is left over from a crash and is
    /// removed.
    pub async fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            match tokio::net::UnixStream::connect(path).await {
                Ok(_) => {
                    return Err(Error::Transport(format!(
                        "{} already in use by another agent",
                        path.display()
                    )))
                }
                Err(_) => {
                    tracing::info!(socket = %path.display(), "Removing stale socket");
                    std::fs::remove_file(path)?;
                }
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = tokio::net::UnixListener::bind(path)
            .map_err(|e| Error::Transport(format!("bind {}: {}", path.display(), e)))?;
        Ok(Self {
            path: path.to_path_buf(),
            listener,
        })
    }
}

#[cfg(not(unix))]
impl LocalListener {
    pub async fn bind(path: &Path) -> Result<Self> {
        Err(Error::Transport(format!(
            "local transport at {} is not supported on this platform",
            path.display()
        )))
    }
}

#[async_trait]
impl Listener for LocalListener {
    fn describe(&self) -> String {
        format!("local:{}", self.path.display())
    }

    #[cfg(unix)]
    async fn serve(
        self: Box<Self>,
        agent: Arc<Agent>,
        registry: Arc<CommandRegistry>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        tracing::info!(socket = %self.path.display(), "Local transport listening");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let pid = stream
                                .peer_cred()
                                .ok()
                                .and_then(|c| c.pid())
                                .and_then(|p| u32::try_from(p).ok());
                            let remote = farm_core::RemoteIdentity::local(pid);
                            tokio::spawn(unix::drive(stream, Arc::clone(&agent), Arc::clone(&registry), remote));
                        }
                        Err(e) => tracing::warn!(error = %e, "Local accept failed"),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        let _ = std::fs::remove_file(&self.path);
        tracing::info!("Local transport stopped");
        Ok(())
    }

    #[cfg(not(unix))]
    async fn serve(
        self: Box<Self>,
        _agent: Arc<Agent>,
        _registry: Arc<CommandRegistry>,
        _shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
pub(crate) mod unix {
    use farm_agent::Agent;
    use farm_core::RemoteIdentity;
    use futures::{SinkExt, StreamExt};
    use std::sync::Arc;
    use tokio::net::UnixStream;
    use tokio::sync::mpsc;
    use tokio_util::codec::{Framed, LinesCodec};
    use tracing::debug;

    use crate::protocol::MAX_FRAME_LEN;
    use crate::registry::CommandRegistry;
    use crate::session::{Session, PUSH_QUEUE};

    pub fn framed(stream: UnixStream) -> Framed<UnixStream, LinesCodec> {
        Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN))
    }

    pub async fn drive(
        stream: UnixStream,
        agent: Arc<Agent>,
        registry: Arc<CommandRegistry>,
        remote: RemoteIdentity,
    ) {
        let (mut sink, mut lines) = framed(stream).split();
        let (in_tx, in_rx) = mpsc::channel::<String>(PUSH_QUEUE);
        let (out_tx, mut out_rx) = mpsc::channel::<String>(PUSH_QUEUE);

        let writer = tokio::spawn(async move {
            while let Some(line) = out_rx.recv().await {
                if sink.send(line).await.is_err() {
                    break;
                }
            }
        });
        let session = tokio::spawn(Session::new(agent, registry, remote).run(in_rx, out_tx));

        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    if in_tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Local session read failed");
                    break;
                }
            }
        }
        drop(in_tx);
        let _ = session.await;
        writer.abort();
    }
}
