use async_trait::async_trait;
use farm_agent::Agent;
use farm_core::{Config, Paths, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::local::LocalListener;
use crate::network::NetworkListener;
use crate::registry::CommandRegistry;

/// Upper bound for the background rebind delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// A bound transport endpoint. Both implementations serve the same
/// command table.
#[async_trait]
pub trait Listener: Send {
    fn describe(&self) -> String;

    async fn serve(
        self: Box<Self>,
        agent: Arc<Agent>,
        registry: Arc<CommandRegistry>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<()>;
}

/// Calls `bind` up to `attempts` times, doubling the delay after each
/// failure.
pub async fn bind_with_retry<T, F, Fut>(
    label: &str,
    attempts: u32,
    initial_backoff: Duration,
    mut bind: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut backoff = initial_backoff;
    let mut attempt = 1;
    loop {
        match bind().await {
            Ok(bound) => return Ok(bound),
            Err(e) if attempt >= attempts => {
                warn!(transport = label, attempts, error = %e, "Bind failed, giving up");
                return Err(e);
            }
            Err(e) => {
                warn!(transport = label, attempt, error = %e, backoff_ms = backoff.as_millis() as u64, "Bind failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                attempt += 1;
            }
        }
    }
}

/// Running listeners, one task each.
pub struct Transports {
    pub endpoints: Vec<String>,
    pub tasks: Vec<JoinHandle<()>>,
}

fn spawn_listener(
    listener: Box<dyn Listener>,
    agent: &Arc<Agent>,
    registry: &Arc<CommandRegistry>,
) -> (String, JoinHandle<()>) {
    let name = listener.describe();
    let label = name.clone();
    let shutdown = agent.subscribe_shutdown();
    let task = tokio::spawn(listener.serve(Arc::clone(agent), Arc::clone(registry), shutdown));
    let handle = tokio::spawn(async move {
        match task.await {
            Ok(Ok(())) => info!(transport = %label, "Listener stopped"),
            Ok(Err(e)) => error!(transport = %label, error = %e, "Listener failed"),
            Err(e) => error!(transport = %label, error = %e, "Listener task panicked"),
        }
    });
    (name, handle)
}

/// Binds the local transport, then the network one. A local bind that
/// keeps failing is not fatal: the Agent continues network-only. A network
/// bind that keeps failing is retried in the background for as long as the
/// Agent runs.
pub async fn start(
    agent: Arc<Agent>,
    registry: Arc<CommandRegistry>,
    config: &Config,
    paths: &Paths,
) -> Result<Transports> {
    let retries = config.transport.bind_retries;
    let backoff = Duration::from_millis(config.transport.bind_backoff_ms.max(1));
    let mut endpoints = Vec::new();
    let mut tasks = Vec::new();

    let socket = config.local_socket(paths);
    match bind_with_retry("local", retries, backoff, || LocalListener::bind(&socket)).await {
        Ok(listener) => {
            let (name, task) = spawn_listener(Box::new(listener), &agent, &registry);
            endpoints.push(name);
            tasks.push(task);
        }
        Err(e) => {
            warn!(socket = %socket.display(), error = %e, "Local transport unavailable, falling back to network only");
        }
    }

    let addr = config.network_bind();
    match bind_with_retry("network", retries, backoff, || NetworkListener::bind(&addr)).await {
        Ok(listener) => {
            let (name, task) = spawn_listener(Box::new(listener), &agent, &registry);
            endpoints.push(name);
            tasks.push(task);
        }
        Err(e) => {
            error!(addr = %addr, error = %e, "Network transport unavailable, retrying in background");
            tasks.push(tokio::spawn(rebind_network(
                Arc::clone(&agent),
                Arc::clone(&registry),
                addr,
                backoff,
            )));
        }
    }

    agent.set_transports(endpoints.clone()).await;
    Ok(Transports { endpoints, tasks })
}

async fn rebind_network(agent: Arc<Agent>, registry: Arc<CommandRegistry>, addr: String, initial: Duration) {
    let mut shutdown = agent.subscribe_shutdown();
    let mut backoff = initial;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.recv() => return,
        }
        match NetworkListener::bind(&addr).await {
            Ok(listener) => {
                let (name, task) = spawn_listener(Box::new(listener), &agent, &registry);
                info!(transport = %name, "Network transport bound");
                let mut endpoints = agent.status().await.transports;
                endpoints.push(name);
                agent.set_transports(endpoints).await;
                let _ = task.await;
                return;
            }
            Err(e) => {
                error!(addr = %addr, error = %e, "Network transport still unavailable");
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farm_core::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result = bind_with_retry("t", 5, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Transport("in use".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = bind_with_retry("t", 3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Transport("in use".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
