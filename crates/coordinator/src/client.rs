use farm_core::config::CoordinatorConfig;
use farm_core::{AgentState, PeerInfo, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::link::CoordinatorLink;
use crate::protocol::{CoordinatorCommand, PingReport, PingResponse};

#[derive(Default)]
struct ClientState {
    roster: Vec<PeerInfo>,
    last_ping: Option<Instant>,
    last_reported: Option<AgentState>,
    failures: u32,
    registered: bool,
    pending: Option<CoordinatorCommand>,
}

/// Heartbeat client for the coordinator. Keeps the last known peer roster.
pub struct CoordinatorClient {
    link: Option<Arc<dyn CoordinatorLink>>,
    agent_id: String,
    interval: Duration,
    timeout: Duration,
    max_failures: u32,
    state: Mutex<ClientState>,
    in_flight: AtomicBool,
}

impl CoordinatorClient {
    pub fn new(
        link: Option<Arc<dyn CoordinatorLink>>,
        agent_id: impl Into<String>,
        config: &CoordinatorConfig,
    ) -> Self {
        Self {
            link,
            agent_id: agent_id.into(),
            interval: Duration::from_secs(config.ping_interval_secs.max(1)),
            timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
            max_failures: config.max_failures.max(1),
            state: Mutex::new(ClientState::default()),
            in_flight: AtomicBool::new(false),
        }
    }

    /// No coordinator: pings are no-ops and the roster stays empty.
    pub fn standalone(agent_id: impl Into<String>) -> Self {
        Self::new(None, agent_id, &CoordinatorConfig::default())
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Announces this Agent. A coordinator outage is not fatal; the next
    /// ping retries registration.
    pub async fn register(&self, report: &PingReport) {
        let Some(link) = &self.link else {
            debug!("No coordinator configured, running standalone");
            return;
        };
        match tokio::time::timeout(self.timeout, link.register(report)).await {
            Ok(Ok(resp)) => {
                info!(agent_id = %self.agent_id, peers = resp.peers.len(), "Registered with coordinator");
                let mut state = self.state.lock().await;
                state.registered = true;
                self.absorb(&mut state, report.state, resp);
            }
            Ok(Err(e)) => warn!(error = %e, "Coordinator registration failed"),
            Err(_) => warn!("Coordinator registration timed out"),
        }
    }

    /// True when a ping should go out now: forced, state changed since the
    /// last successful report, or the interval elapsed.
    pub async fn is_due(&self, current: AgentState, force: bool) -> bool {
        if self.link.is_none() {
            return false;
        }
        let state = self.state.lock().await;
        force
            || state.last_reported != Some(current)
            || state
                .last_ping
                .map(|t| t.elapsed() >= self.interval)
                .unwrap_or(true)
    }

    /// Sends a ping in the background if one is due. Only one ping is in
    /// flight at a time. Returns true if a ping was started.
    pub async fn ping_coordinator(self: &Arc<Self>, report: PingReport, force: bool) -> bool {
        if !self.is_due(report.state, force).await {
            return false;
        }
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return false;
        }
        let client = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = client.ping_now(&report).await {
                debug!(error = %e, "Coordinator ping failed");
            }
            client.in_flight.store(false, Ordering::Release);
        });
        true
    }

    /// Sends one ping and waits for the answer.
    pub async fn ping_now(&self, report: &PingReport) -> Result<()> {
        let Some(link) = &self.link else {
            return Ok(());
        };

        let needs_register = !self.state.lock().await.registered;
        let call = async {
            if needs_register {
                link.register(report).await
            } else {
                link.ping(report).await
            }
        };
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(r) => r,
            Err(e) => Err(e.into()),
        };

        let mut state = self.state.lock().await;
        state.last_ping = Some(Instant::now());
        match result {
            Ok(resp) => {
                if state.failures >= self.max_failures {
                    info!(failures = state.failures, "Coordinator reachable again");
                }
                state.failures = 0;
                state.registered = true;
                self.absorb(&mut state, report.state, resp);
                Ok(())
            }
            Err(e) => {
                state.failures += 1;
                if state.failures == self.max_failures {
                    error!(
                        failures = state.failures,
                        error = %e,
                        "Coordinator unreachable, dropping peer roster"
                    );
                    state.roster.clear();
                } else if state.failures > self.max_failures {
                    state.roster.clear();
                } else {
                    warn!(failures = state.failures, error = %e, "Coordinator ping failed");
                }
                Err(e)
            }
        }
    }

    fn absorb(&self, state: &mut ClientState, reported: AgentState, resp: PingResponse) {
        state.last_reported = Some(reported);
        state.roster = resp.peers;
        if let Some(command) = resp.command {
            info!(?command, "Coordinator issued command");
            state.pending = Some(command);
        }
    }

    /// Tells the coordinator to stop routing work here. Bounded by the
    /// request timeout.
    pub async fn report_closed(&self, mut report: PingReport) {
        let Some(link) = &self.link else {
            return;
        };
        report.state = AgentState::Closed;
        match tokio::time::timeout(self.timeout, link.ping(&report)).await {
            Ok(Ok(_)) => info!(agent_id = %self.agent_id, "Reported Closed to coordinator"),
            Ok(Err(e)) => warn!(error = %e, "Failed to report Closed to coordinator"),
            Err(_) => warn!("Timed out reporting Closed to coordinator"),
        }
        self.state.lock().await.last_reported = Some(AgentState::Closed);
    }

    pub async fn roster(&self) -> Vec<PeerInfo> {
        self.state.lock().await.roster.clone()
    }

    /// Peers currently able to take work, excluding this Agent.
    pub async fn available_peers(&self) -> Vec<PeerInfo> {
        self.state
            .lock()
            .await
            .roster
            .iter()
            .filter(|p| p.state == AgentState::Available && p.agent_id != self.agent_id)
            .cloned()
            .collect()
    }

    pub async fn take_command(&self) -> Option<CoordinatorCommand> {
        self.state.lock().await.pending.take()
    }

    pub async fn failures(&self) -> u32 {
        self.state.lock().await.failures
    }

    pub async fn last_reported(&self) -> Option<AgentState> {
        self.state.lock().await.last_reported
    }
}
