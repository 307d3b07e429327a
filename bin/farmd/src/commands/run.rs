use farm_agent::{Agent, AgentDeps};
use farm_core::{Config, Paths};
use farm_rpc::{CommandRegistry, RpcPeerLink};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Time allowed for listeners to release their endpoints before exit.
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Command-line values that take precedence over the config file for this
/// run only. They are never written back.
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub local_socket: Option<PathBuf>,
    pub dedicated: bool,
}

impl Overrides {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.transport.host = host;
        }
        if let Some(port) = self.port {
            config.transport.port = port;
        }
        if let Some(socket) = self.local_socket {
            config.transport.local_socket = Some(socket);
        }
        if self.dedicated {
            config.agent.dedicated = true;
        }
    }
}

pub async fn run(paths: &Paths, owner_pid: Option<u32>, overrides: Overrides) -> anyhow::Result<()> {
    paths.ensure_dirs()?;
    let config_path = paths.config_file();
    let mut config = Config::load_or_default(paths)?;
    let (agent_id, generated) = config.ensure_agent_id();
    if generated {
        config.save(&config_path)?;
        info!(agent_id = %agent_id, path = %config_path.display(), "Generated agent id");
    }
    overrides.apply(&mut config);
    config.validate()?;

    let peer_timeout = Duration::from_secs(config.transport.request_timeout_secs.max(1));
    let deps = AgentDeps::from_config(&config).with_peers(Arc::new(RpcPeerLink::new(peer_timeout)));
    let agent = Agent::new(config.clone(), paths.clone(), deps);
    agent.init(owner_pid).await?;

    let registry = Arc::new(CommandRegistry::with_defaults());
    let transports = farm_rpc::start(Arc::clone(&agent), registry, &config, paths).await?;
    info!(
        agent_id = %agent.agent_id(),
        endpoints = ?transports.endpoints,
        owner_pid = ?owner_pid,
        "Agent running"
    );

    tokio::select! {
        _ = agent.wait_closed() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, draining (interrupt again to stop now)");
            agent.request_shutdown();
            tokio::select! {
                _ = agent.wait_closed() => {}
                _ = tokio::signal::ctrl_c() => {
                    warn!("Second interrupt, stopping without drain");
                    agent.destroy().await;
                }
            }
        }
    }

    for task in transports.tasks {
        if tokio::time::timeout(LISTENER_STOP_TIMEOUT, task).await.is_err() {
            warn!("Listener did not stop in time");
        }
    }

    if agent.restarting() {
        relaunch()?;
    }
    info!("Agent exited");
    Ok(())
}

/// Starts a fresh copy of this binary with the same arguments.
fn relaunch() -> anyhow::Result<()> {
    let exe = std::env::current_exe()?;
    let args: Vec<_> = std::env::args_os().skip(1).collect();
    let child = std::process::Command::new(&exe).args(&args).spawn()?;
    info!(pid = child.id(), exe = %exe.display(), "Restarted agent");
    Ok(())
}
