use farm_coordinator::{CoordinatorClient, CoordinatorCommand, CoordinatorLink, HttpCoordinator, PingReport};
use farm_core::{
    AgentState, ChannelKey, Config, ConnectionHandle, Error, Paths, PushMessage, RemoteIdentity,
    Result, TrustStatus, VERSION,
};
use farm_monitor::{CpuSampler, FixedSampler, LoadSnapshot, LoadVerdict, PerformanceMonitor, SysinfoSampler};
use farm_security::SecurityGate;
use farm_storage::{CacheCommand, CacheStats, ChannelStore};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, mpsc, watch, Mutex, OnceCell, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connections::{Connection, ConnectionInfo, ConnectionManager};
use crate::executor::{JobExecutor, NoExecutor, ProcessExecutor};
use crate::jobs::{JobManager, JobSnapshot, JobSpec, JobSummary};
use crate::peer::{NoPeers, PeerLink};
use crate::process::{OsProcessProbe, ProcessProbe};

/// Requests from the local control surface. Queued and handled by the
/// maintenance loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    CacheClear,
    CacheValidate,
    CacheRelocate(PathBuf),
    Restart,
}

/// Everything the Agent talks to outside its own state.
pub struct AgentDeps {
    pub sampler: Box<dyn CpuSampler>,
    pub coordinator: Option<Arc<dyn CoordinatorLink>>,
    pub peers: Arc<dyn PeerLink>,
    pub executor: Arc<dyn JobExecutor>,
    pub process_probe: Arc<dyn ProcessProbe>,
    pub gate: SecurityGate,
    /// Binary whose signing identity is checked at init.
    pub binary: Option<PathBuf>,
}

impl AgentDeps {
    pub fn from_config(config: &Config) -> Self {
        let coordinator: Option<Arc<dyn CoordinatorLink>> = match config.coordinator.url.as_deref() {
            Some(url) if !url.trim().is_empty() => {
                let timeout = Duration::from_secs(config.coordinator.request_timeout_secs.max(1));
                match HttpCoordinator::new(url, timeout) {
                    Ok(link) => Some(Arc::new(link)),
                    Err(e) => {
                        warn!(error = %e, "Coordinator link unavailable, running standalone");
                        None
                    }
                }
            }
            _ => None,
        };
        let executor: Arc<dyn JobExecutor> = match ProcessExecutor::from_config(&config.jobs.executor) {
            Some(exec) => Arc::new(exec),
            None => Arc::new(NoExecutor),
        };
        Self {
            sampler: Box::new(SysinfoSampler::new()),
            coordinator,
            peers: Arc::new(NoPeers),
            executor,
            process_probe: Arc::new(OsProcessProbe),
            gate: SecurityGate::from_config(&config.security),
            binary: std::env::current_exe().ok(),
        }
    }

    /// No coordinator, no peers, no executor and no load gating. For
    /// embedding an Agent in another process and for tests.
    pub fn standalone() -> Self {
        Self {
            sampler: Box::new(FixedSampler(0.0)),
            coordinator: None,
            peers: Arc::new(NoPeers),
            executor: Arc::new(NoExecutor),
            process_probe: Arc::new(OsProcessProbe),
            gate: SecurityGate::unconfigured(),
            binary: None,
        }
    }

    pub fn with_peers(mut self, peers: Arc<dyn PeerLink>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn JobExecutor>) -> Self {
        self.executor = executor;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub agent_id: String,
    pub version: String,
    pub state: AgentState,
    pub working_for: Option<String>,
    pub trust: TrustStatus,
    pub address: String,
    pub owner_pid: Option<u32>,
    pub connections: Vec<ConnectionInfo>,
    pub jobs: JobSummary,
    pub cache: Option<CacheStats>,
    pub load: LoadSnapshot,
    pub transports: Vec<String>,
    pub coordinator_failures: u32,
    pub uptime_secs: u64,
}

struct Runtime {
    store: Arc<ChannelStore>,
    jobs: Arc<JobManager>,
}

struct CoreInfo {
    trust: TrustStatus,
    owner_pid: Option<u32>,
    drain_started: Option<Instant>,
}

/// The per-machine farm service. One instance per process, shared by
/// every transport session as an `Arc`.
pub struct Agent {
    config: Config,
    paths: Paths,
    agent_id: String,
    state: watch::Sender<AgentState>,
    info: RwLock<CoreInfo>,
    runtime: OnceCell<Runtime>,
    init_lock: Mutex<()>,
    connections: Arc<ConnectionManager>,
    coordinator: Arc<CoordinatorClient>,
    monitor: Arc<PerformanceMonitor>,
    peers: Arc<dyn PeerLink>,
    executor: Arc<dyn JobExecutor>,
    process_probe: Arc<dyn ProcessProbe>,
    gate: Arc<SecurityGate>,
    binary: Option<PathBuf>,
    admin: Mutex<VecDeque<AdminCommand>>,
    shutdown_requested: AtomicBool,
    restart_requested: AtomicBool,
    closing: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    transports: RwLock<Vec<String>>,
    started: Instant,
}

impl Agent {
    pub fn new(config: Config, paths: Paths, deps: AgentDeps) -> Arc<Self> {
        let agent_id = config
            .agent
            .agent_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (state, _) = watch::channel(AgentState::Initializing);
        let (shutdown_tx, _) = broadcast::channel(4);
        let connections = Arc::new(ConnectionManager::new(
            &config.connections,
            Arc::clone(&deps.process_probe),
        ));
        let coordinator = Arc::new(CoordinatorClient::new(
            deps.coordinator,
            agent_id.clone(),
            &config.coordinator,
        ));
        let monitor = Arc::new(PerformanceMonitor::new(&config.performance, deps.sampler));

        Arc::new(Self {
            config,
            paths,
            agent_id,
            state,
            info: RwLock::new(CoreInfo {
                trust: TrustStatus::Unchecked,
                owner_pid: None,
                drain_started: None,
            }),
            runtime: OnceCell::new(),
            init_lock: Mutex::new(()),
            connections,
            coordinator,
            monitor,
            peers: deps.peers,
            executor: deps.executor,
            process_probe: deps.process_probe,
            gate: Arc::new(deps.gate),
            binary: deps.binary,
            admin: Mutex::new(VecDeque::new()),
            shutdown_requested: AtomicBool::new(false),
            restart_requested: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            shutdown_tx,
            transports: RwLock::new(Vec::new()),
            started: Instant::now(),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Fires once the Agent has reached `Closed`.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub async fn set_transports(&self, transports: Vec<String>) {
        *self.transports.write().await = transports;
    }

    fn set_state(&self, next: AgentState) {
        let previous = *self.state.borrow();
        if previous == next || previous == AgentState::Closed {
            return;
        }
        self.state.send_replace(next);
        info!(from = %previous, to = %next, "Agent state changed");
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.runtime.get().ok_or(Error::NotInitialized)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Brings the Agent up. Repeated calls are no-ops until shutdown starts,
    /// after which every call fails. Nothing is left half-built if a step
    /// fails: the cache is opened first and the runtime is only published
    /// after every step succeeded.
    pub async fn init(self: &Arc<Self>, owner_pid: Option<u32>) -> Result<bool> {
        let _guard = self.init_lock.lock().await;
        if self.shutdown_requested.load(Ordering::Acquire) || self.state() == AgentState::Closed {
            return Err(Error::ShuttingDown);
        }
        if self.runtime.initialized() {
            if let Some(pid) = owner_pid {
                let mut info = self.info.write().await;
                if info.owner_pid.is_none() {
                    info.owner_pid = Some(pid);
                }
            }
            return Ok(true);
        }

        let cache_root = self.config.cache_dir(&self.paths);
        let store = Arc::new(ChannelStore::open(cache_root.clone(), &self.config.cache).await?);
        std::fs::create_dir_all(self.paths.jobs_dir())?;

        let trust = match &self.binary {
            Some(binary) => {
                let gate = Arc::clone(&self.gate);
                let binary = binary.clone();
                let components = self.config.security.components.clone();
                tokio::task::spawn_blocking(move || gate.check(&binary, &components))
                    .await
                    .map_err(|e| Error::Other(format!("trust check aborted: {}", e)))?
            }
            None => TrustStatus::Unchecked,
        };

        let jobs = Arc::new(JobManager::new(
            self.config.jobs.clone(),
            self.paths.clone(),
            self.config.advertise_address(),
            Arc::clone(&store),
            Arc::clone(&self.connections),
            Arc::clone(&self.coordinator),
            Arc::clone(&self.peers),
            Arc::clone(&self.executor),
        ));

        {
            let mut info = self.info.write().await;
            info.trust = trust;
            info.owner_pid = owner_pid;
        }
        if self.runtime.set(Runtime { store, jobs }).is_err() {
            return Err(Error::Other("agent runtime already set".into()));
        }

        self.set_state(AgentState::Available);
        self.coordinator.register(&self.report().await).await;

        tokio::spawn(Arc::clone(&self.monitor).run_loop(self.shutdown_tx.subscribe()));
        tokio::spawn(Arc::clone(self).run_loop(self.shutdown_tx.subscribe()));

        info!(
            agent_id = %self.agent_id,
            cache = %cache_root.display(),
            owner_pid = ?owner_pid,
            "Agent initialized"
        );
        Ok(true)
    }

    /// Sets the shutdown flag. The next tick starts draining.
    pub fn request_shutdown(&self) {
        if !self.shutdown_requested.swap(true, Ordering::AcqRel) {
            info!("Shutdown requested");
        }
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire) || self.state().is_draining()
    }

    pub fn restarting(&self) -> bool {
        self.restart_requested.load(Ordering::Acquire)
    }

    /// Tears the Agent down immediately. Safe to call repeatedly; always
    /// leaves the Agent `Closed`.
    pub async fn destroy(&self) {
        self.request_shutdown();
        match self.runtime() {
            Ok(rt) => {
                rt.jobs.abandon_all("agent destroyed").await;
                self.close_down(rt).await;
            }
            Err(_) => {
                self.set_state(AgentState::Closed);
                let _ = self.shutdown_tx.send(());
            }
        }
    }

    pub async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == AgentState::Closed).await;
    }

    // ------------------------------------------------------------------
    // Maintenance loop
    // ------------------------------------------------------------------

    pub async fn run_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.tick_interval();
        info!(interval_ms = period.as_millis() as u64, "Maintenance loop started");

        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let agent = Arc::clone(&self);
                    match tokio::spawn(async move { agent.maintain_once().await }).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!(error = %e, "Maintenance tick failed"),
                        Err(e) => error!(error = %e, "Maintenance tick panicked"),
                    }
                    if self.state() == AgentState::Closed {
                        break;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        info!("Maintenance loop stopped");
    }

    /// One tick: connections, cache, jobs, agent state, then the
    /// coordinator ping. Bounded local work only; network calls are
    /// spawned.
    pub async fn maintain_once(self: &Arc<Self>) -> Result<()> {
        let rt = self.runtime()?;
        if self.state() == AgentState::Closed {
            return Ok(());
        }
        let before = self.state();

        self.forward_admin(rt).await;

        for (conn, _) in self.connections.maintain().await {
            self.release_connection(rt, conn).await;
        }

        match rt.store.maintain().await {
            Ok(report) => {
                if report.evicted + report.expired_transfers + report.cleared + report.dropped_corrupt > 0 {
                    debug!(?report, "Cache maintenance");
                }
            }
            Err(e) => error!(error = %e, "Cache maintenance failed"),
        }

        rt.jobs.maintain(!before.is_draining()).await;

        self.maintain_agent(rt).await;

        let after = self.state();
        if after != AgentState::Closed {
            self.coordinator
                .ping_coordinator(self.report().await, after != before)
                .await;
        }
        Ok(())
    }

    async fn forward_admin(&self, rt: &Runtime) {
        let commands: Vec<AdminCommand> = self.admin.lock().await.drain(..).collect();
        for command in commands {
            info!(?command, "Handling admin command");
            match command {
                AdminCommand::CacheClear => rt.store.enqueue(CacheCommand::Clear).await,
                AdminCommand::CacheValidate => rt.store.enqueue(CacheCommand::ValidateAll).await,
                AdminCommand::CacheRelocate(path) => rt.store.enqueue(CacheCommand::Relocate(path)).await,
                AdminCommand::Restart => {
                    self.restart_requested.store(true, Ordering::Release);
                    self.request_shutdown();
                }
            }
        }
    }

    async fn maintain_agent(&self, rt: &Runtime) {
        match self.coordinator.take_command().await {
            Some(CoordinatorCommand::Shutdown) => self.request_shutdown(),
            Some(CoordinatorCommand::Restart) => {
                self.restart_requested.store(true, Ordering::Release);
                self.request_shutdown();
            }
            None => {}
        }

        let owner_pid = self.info.read().await.owner_pid;
        if let Some(pid) = owner_pid {
            if !self.shutdown_requested.load(Ordering::Acquire) && !self.process_probe.is_alive(pid) {
                info!(owner_pid = pid, "Owning process exited");
                self.request_shutdown();
            }
        }

        if self.shutdown_requested.load(Ordering::Acquire) {
            self.drain(rt).await;
            return;
        }

        let state = self.state();
        if !matches!(state, AgentState::Available | AgentState::Busy) {
            return;
        }
        let next = if self.config.agent.dedicated {
            AgentState::Available
        } else {
            match self.monitor.verdict().await {
                LoadVerdict::Available => AgentState::Available,
                LoadVerdict::Busy => AgentState::Busy,
            }
        };
        self.set_state(next);
    }

    async fn drain(&self, rt: &Runtime) {
        let started = {
            let mut info = self.info.write().await;
            *info.drain_started.get_or_insert_with(Instant::now)
        };
        self.set_state(AgentState::Blocked);

        let active = rt.jobs.active_count().await;
        if active > 0 {
            let limit = Duration::from_secs(self.config.agent.drain_timeout_secs);
            if started.elapsed() < limit {
                debug!(active, "Draining jobs");
                return;
            }
            warn!(active, "Drain timeout elapsed, abandoning jobs");
            rt.jobs.abandon_all("agent shutting down").await;
        }
        self.close_down(rt).await;
    }

    async fn close_down(&self, rt: &Runtime) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(AgentState::Blocked);
        for conn in self.connections.close_all().await {
            self.release_connection(rt, conn).await;
        }
        self.coordinator.report_closed(self.report().await).await;
        if let Err(e) = rt.store.flush().await {
            error!(error = %e, "Failed to flush cache index");
        }
        self.set_state(AgentState::Closed);
        let _ = self.shutdown_tx.send(());
        info!(restart = self.restarting(), "Agent closed");
    }

    async fn release_connection(&self, rt: &Runtime, conn: Connection) {
        let released = rt.jobs.release_owner(conn.handle).await;
        let aborted = rt.store.abort_transfers_for(conn.handle).await;
        if released + aborted > 0 {
            debug!(handle = %conn.handle, jobs = released, transfers = aborted, "Released connection resources");
        }
    }

    async fn report(&self) -> PingReport {
        let working_for = match self.runtime() {
            Ok(rt) => rt.jobs.working_for().await,
            Err(_) => None,
        };
        PingReport {
            agent_id: self.agent_id.clone(),
            state: self.state(),
            working_for,
            version: VERSION.to_string(),
            address: self.config.advertise_address(),
            trusted: self.info.read().await.trust.is_trusted(),
            load: Some(self.monitor.snapshot().await.average),
        }
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Opens a connection. A full table is pruned of dead entries once
    /// before the request is refused.
    pub async fn open_connection(
        &self,
        remote: RemoteIdentity,
        push: Option<mpsc::Sender<PushMessage>>,
    ) -> Result<ConnectionHandle> {
        if self.shutting_down() {
            return Err(Error::ShuttingDown);
        }
        match self.connections.open(remote.clone(), push.clone()).await {
            Err(Error::Capacity(_)) => {
                let reclaimed = self.connections.maintain().await;
                info!(reclaimed = reclaimed.len(), "Connection table full, pruned dead entries");
                for (conn, _) in reclaimed {
                    match self.runtime() {
                        Ok(rt) => self.release_connection(rt, conn).await,
                        Err(_) => drop(conn),
                    }
                }
                self.connections.open(remote, push).await
            }
            other => other,
        }
    }

    pub async fn close_connection(&self, handle: ConnectionHandle) -> bool {
        let Some(conn) = self.connections.close(handle).await else {
            return false;
        };
        if let Ok(rt) = self.runtime() {
            self.release_connection(rt, conn).await;
        }
        true
    }

    pub async fn test_connection(&self, handle: ConnectionHandle) -> bool {
        self.connections.test(handle).await
    }

    /// Whether `caller` may act on `handle`. A handle belongs to the RPC
    /// session that opened it.
    pub async fn owns_connection(&self, handle: ConnectionHandle, caller: &RemoteIdentity) -> bool {
        let owned = self.connections.owned_by(handle, caller.session).await;
        if !owned && self.connections.test(handle).await {
            warn!(handle = %handle, transport = %caller.transport, address = %caller.address, "Handle used outside its session");
        }
        owned
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    pub async fn send_channel(
        &self,
        handle: ConnectionHandle,
        job_guid: Option<Uuid>,
        name: &str,
        data: &[u8],
    ) -> bool {
        let Ok(rt) = self.runtime() else {
            return false;
        };
        if !self.connections.test(handle).await {
            return false;
        }
        let key = ChannelKey::new(job_guid.unwrap_or_else(Uuid::nil), name);
        match rt.store.put(key.clone(), data).await {
            Ok(hash) => {
                debug!(handle = %handle, channel = %key, hash = %hash, size = data.len(), "Channel received");
                self.connections.associate_channel(handle, key).await;
                true
            }
            Err(e) => {
                warn!(handle = %handle, channel = %key, error = %e, "Channel rejected");
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn send_channel_chunk(
        &self,
        handle: ConnectionHandle,
        job_guid: Option<Uuid>,
        name: &str,
        offset: u64,
        data: &[u8],
        last: bool,
        hash: Option<&str>,
    ) -> bool {
        let Ok(rt) = self.runtime() else {
            return false;
        };
        if !self.connections.test(handle).await {
            return false;
        }
        let key = ChannelKey::new(job_guid.unwrap_or_else(Uuid::nil), name);
        match rt
            .store
            .write_chunk(Some(handle), key.clone(), offset, data, last, hash)
            .await
        {
            Ok(published) => {
                if published.is_some() {
                    self.connections.associate_channel(handle, key).await;
                }
                true
            }
            Err(e) => {
                warn!(handle = %handle, channel = %key, offset, error = %e, "Chunk rejected");
                false
            }
        }
    }

    /// Streams a stored channel to the connection's push link as
    /// `ChannelChunk` frames. Returns false if the channel is absent here
    /// or the connection cannot receive pushes.
    pub async fn request_channel(
        &self,
        handle: ConnectionHandle,
        job_guid: Option<Uuid>,
        name: &str,
    ) -> bool {
        let Ok(rt) = self.runtime() else {
            return false;
        };
        let Some(sender) = self.connections.push_sender(handle).await else {
            return false;
        };
        let candidates = match job_guid.filter(|g| !g.is_nil()) {
            Some(guid) => vec![ChannelKey::new(guid, name), ChannelKey::shared(name)],
            None => vec![ChannelKey::shared(name)],
        };
        let mut found = None;
        for key in candidates {
            if let Some(hash) = rt.store.pin(&key).await {
                found = Some((key, hash));
                break;
            }
        }
        let Some((key, pinned)) = found else {
            debug!(handle = %handle, channel = %name, "Requested channel not held here");
            return false;
        };
        let blob = match rt.store.open_channel(&key).await {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                rt.store.unpin(&pinned).await;
                return false;
            }
            Err(e) => {
                rt.store.unpin(&pinned).await;
                warn!(channel = %key, error = %e, "Failed to open channel");
                return false;
            }
        };
        self.connections.associate_channel(handle, key.clone()).await;

        let store = Arc::clone(&rt.store);
        let chunk_size = self.config.cache.chunk_size.max(1);
        // The reply carries the caller's job guid so it can match the
        // frames to its request even when the agent-wide copy was served.
        let reply_guid = job_guid.unwrap_or_else(Uuid::nil);
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = stream_blob(blob, reply_guid, &name, chunk_size, &sender).await {
                warn!(channel = %key, error = %e, "Channel push aborted");
            }
            store.unpin(&pinned).await;
        });
        true
    }

    /// Compares a caller-side hash with the stored channel. Without a job
    /// GUID the name is looked up among the connection's own channels and
    /// jobs, then among agent-wide channels.
    pub async fn validate_channel(
        &self,
        handle: ConnectionHandle,
        job_guid: Option<Uuid>,
        name: &str,
        remote_hash: &str,
    ) -> bool {
        let Ok(rt) = self.runtime() else {
            return false;
        };
        let Some(key) = self.resolve_for(rt, handle, job_guid, name).await else {
            debug!(handle = %handle, channel = %name, "Nothing to validate");
            return false;
        };
        match rt.store.validate(&key, remote_hash).await {
            Ok(matches) => {
                if !matches {
                    warn!(channel = %key, remote_hash, "Channel hash mismatch");
                }
                matches
            }
            Err(e) => {
                warn!(channel = %key, error = %e, "Channel validation failed");
                false
            }
        }
    }

    async fn resolve_for(
        &self,
        rt: &Runtime,
        handle: ConnectionHandle,
        job_guid: Option<Uuid>,
        name: &str,
    ) -> Option<ChannelKey> {
        if let Some(guid) = job_guid {
            let key = ChannelKey::new(guid, name);
            return rt.store.contains(&key).await.then_some(key);
        }
        let (channels, jobs) = self.connections.scope_of(handle).await?;
        let mut candidates: Vec<ChannelKey> = channels.into_iter().filter(|k| k.name == name).collect();
        candidates.extend(jobs.into_iter().map(|g| ChannelKey::new(g, name)));
        candidates.push(ChannelKey::shared(name));
        for key in candidates {
            if rt.store.contains(&key).await {
                return Some(key);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    pub async fn add_job(&self, handle: ConnectionHandle, spec: JobSpec) -> bool {
        let Ok(rt) = self.runtime() else {
            return false;
        };
        if self.shutting_down() || !self.connections.test(handle).await {
            return false;
        }
        rt.jobs.add(handle, spec).await
    }

    pub async fn query_job(&self, job_guid: Uuid) -> Option<JobSnapshot> {
        self.runtime().ok()?.jobs.query(job_guid).await
    }

    pub async fn cancel_job(&self, handle: ConnectionHandle, job_guid: Uuid) -> bool {
        let Ok(rt) = self.runtime() else {
            return false;
        };
        rt.jobs.cancel(Some(handle), job_guid).await
    }

    /// A peer hands a job over. Refused unless this Agent is Available.
    pub async fn execute_job(&self, spec: JobSpec, origin: String) -> bool {
        let Ok(rt) = self.runtime() else {
            return false;
        };
        let state = self.state();
        if !state.accepts_work() || self.shutting_down() {
            info!(job = %spec.guid, state = %state, "Refusing job hand-off");
            return false;
        }
        rt.jobs.host(spec, origin).await
    }

    // ------------------------------------------------------------------
    // Status and admin
    // ------------------------------------------------------------------

    pub async fn enqueue_admin(&self, command: AdminCommand) {
        debug!(?command, "Admin command queued");
        self.admin.lock().await.push_back(command);
    }

    pub async fn status(&self) -> AgentStatus {
        let (jobs, cache) = match self.runtime() {
            Ok(rt) => (rt.jobs.summary().await, Some(rt.store.stats().await)),
            Err(_) => (JobSummary::default(), None),
        };
        let working_for = match self.runtime() {
            Ok(rt) => rt.jobs.working_for().await,
            Err(_) => None,
        };
        let (trust, owner_pid) = {
            let info = self.info.read().await;
            (info.trust.clone(), info.owner_pid)
        };
        AgentStatus {
            agent_id: self.agent_id.clone(),
            version: VERSION.to_string(),
            state: self.state(),
            working_for,
            trust,
            address: self.config.advertise_address(),
            owner_pid,
            connections: self.connections.list().await,
            jobs,
            cache,
            load: self.monitor.snapshot().await,
            transports: self.transports.read().await.clone(),
            coordinator_failures: self.coordinator.failures().await,
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

async fn stream_blob(
    mut blob: farm_storage::ChannelBlob,
    job_guid: Uuid,
    name: &str,
    chunk_size: usize,
    sender: &mpsc::Sender<PushMessage>,
) -> Result<()> {
    let total = blob.size;
    let mut offset = 0u64;
    let mut buf = vec![0u8; chunk_size];
    loop {
        let mut filled = 0;
        while filled < buf.len() {
            let n = blob.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let last = offset + filled as u64 >= total || filled < buf.len();
        let frame = PushMessage::ChannelChunk {
            job_guid,
            name: name.to_string(),
            offset,
            total,
            hash: if last { blob.hash.clone() } else { String::new() },
            data: buf[..filled].to_vec(),
            last,
        };
        sender
            .send(frame)
            .await
            .map_err(|_| Error::Transport("push link closed".into()))?;
        offset += filled as u64;
        if last {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farm_core::{JobFailure, JobState};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeProbe(StdMutex<HashSet<u32>>);

    impl FakeProbe {
        fn kill(&self, pid: u32) {
            self.0.lock().unwrap().insert(pid);
        }
    }

    impl ProcessProbe for FakeProbe {
        fn is_alive(&self, pid: u32) -> bool {
            !self.0.lock().unwrap().contains(&pid)
        }
    }

    fn deps(load: f32, probe: Arc<FakeProbe>) -> AgentDeps {
        AgentDeps {
            sampler: Box::new(FixedSampler(load)),
            process_probe: probe,
            ..AgentDeps::standalone()
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.agent.agent_id = Some("test-agent".into());
        config.agent.tick_interval_ms = 60_000;
        config.agent.drain_timeout_secs = 0;
        config.cache.chunk_size = 4;
        config
    }

    async fn agent_with(dir: &TempDir, config: Config, load: f32, probe: Arc<FakeProbe>) -> Arc<Agent> {
        let agent = Agent::new(config, Paths::with_base(dir.path().to_path_buf()), deps(load, probe));
        assert!(agent.init(None).await.unwrap());
        agent
    }

    async fn agent(dir: &TempDir) -> Arc<Agent> {
        agent_with(dir, config(), 0.0, Arc::new(FakeProbe::default())).await
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir).await;
        assert_eq!(agent.state(), AgentState::Available);
        assert!(agent.init(Some(42)).await.unwrap());
        assert_eq!(agent.status().await.owner_pid, Some(42));
    }

    #[tokio::test]
    async fn test_init_fails_cleanly_on_unusable_cache() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let mut config = config();
        config.cache.dir = Some(blocker);
        let agent = Agent::new(
            config,
            Paths::with_base(dir.path().to_path_buf()),
            deps(0.0, Arc::new(FakeProbe::default())),
        );
        let err = agent.init(None).await.unwrap_err();
        assert!(matches!(err, Error::Cache(_)));
        assert_eq!(agent.state(), AgentState::Initializing);
        assert!(agent.maintain_once().await.is_err());
    }

    #[tokio::test]
    async fn test_send_then_validate() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir).await;
        let h = agent.open_connection(RemoteIdentity::in_process("c"), None).await.unwrap();
        let guid = Uuid::new_v4();
        assert!(agent.send_channel(h, Some(guid), "scene", b"vertices").await);

        let hash = farm_storage::content_hash(b"vertices");
        assert!(agent.validate_channel(h, Some(guid), "scene", &hash).await);
        assert!(agent.validate_channel(h, None, "scene", &hash).await);
        assert!(!agent.validate_channel(h, Some(guid), "scene", &"0".repeat(64)).await);
    }

    #[tokio::test]
    async fn test_concurrent_sends_on_two_connections() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir).await;
        let a = agent.open_connection(RemoteIdentity::in_process("a"), None).await.unwrap();
        let b = agent.open_connection(RemoteIdentity::in_process("b"), None).await.unwrap();
        let (ga, gb) = (Uuid::new_v4(), Uuid::new_v4());
        let (ra, rb) = tokio::join!(
            agent.send_channel(a, Some(ga), "x", b"first"),
            agent.send_channel(b, Some(gb), "y", b"second"),
        );
        assert!(ra && rb);

        let (tx, mut rx) = mpsc::channel(16);
        let reader = agent
            .open_connection(RemoteIdentity::in_process("r"), Some(tx))
            .await
            .unwrap();
        assert!(agent.request_channel(reader, Some(ga), "x").await);
        assert!(agent.request_channel(reader, Some(gb), "y").await);

        let mut received: HashMap<String, Vec<u8>> = HashMap::new();
        let mut finished = 0;
        while finished < 2 {
            match rx.recv().await.unwrap() {
                PushMessage::ChannelChunk { name, data, last, .. } => {
                    received.entry(name).or_default().extend(data);
                    if last {
                        finished += 1;
                    }
                }
                other => panic!("unexpected push {:?}", other),
            }
        }
        assert_eq!(received["x"], b"first");
        assert_eq!(received["y"], b"second");
    }

    #[tokio::test]
    async fn test_request_absent_channel() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir).await;
        let (tx, _rx) = mpsc::channel(4);
        let h = agent.open_connection(RemoteIdentity::in_process("c"), Some(tx)).await.unwrap();
        assert!(!agent.request_channel(h, Some(Uuid::new_v4()), "ghost").await);
        assert_eq!(agent.status().await.cache.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_chunks_carry_hash_on_last_frame() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir).await;
        let (tx, mut rx) = mpsc::channel(16);
        let h = agent.open_connection(RemoteIdentity::in_process("c"), Some(tx)).await.unwrap();
        let guid = Uuid::new_v4();
        assert!(agent.send_channel(h, Some(guid), "tex", b"0123456789").await);
        assert!(agent.request_channel(h, Some(guid), "tex").await);

        let mut frames = Vec::new();
        loop {
            let PushMessage::ChannelChunk { offset, hash, last, data, .. } = rx.recv().await.unwrap() else {
                panic!("expected chunk");
            };
            frames.push((offset, data.len(), hash, last));
            if last {
                break;
            }
        }
        assert_eq!(
            frames.iter().map(|f| (f.0, f.1)).collect::<Vec<_>>(),
            vec![(0, 4), (4, 4), (8, 2)]
        );
        assert_eq!(frames[2].2, farm_storage::content_hash(b"0123456789"));
        assert!(frames[0].2.is_empty());
    }

    #[tokio::test]
    async fn test_chunked_upload_publishes_on_last() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir).await;
        let h = agent.open_connection(RemoteIdentity::in_process("c"), None).await.unwrap();
        let guid = Uuid::new_v4();
        let hash = farm_storage::content_hash(b"abcdef");
        assert!(agent.send_channel_chunk(h, Some(guid), "f", 0, b"abc", false, None).await);
        assert!(!agent.validate_channel(h, Some(guid), "f", &hash).await);
        assert!(!agent.send_channel_chunk(h, Some(guid), "f", 5, b"zz", false, None).await);
        assert!(agent.send_channel_chunk(h, Some(guid), "f", 0, b"abc", false, None).await);
        assert!(agent.send_channel_chunk(h, Some(guid), "f", 3, b"def", true, Some(hash.as_str())).await);
        assert!(agent.validate_channel(h, Some(guid), "f", &hash).await);
    }

    #[tokio::test]
    async fn test_dead_owner_reclaimed_and_pins_released() {
        let dir = TempDir::new().unwrap();
        let probe = Arc::new(FakeProbe::default());
        let agent = agent_with(&dir, config(), 0.0, probe.clone()).await;
        let h = agent
            .open_connection(RemoteIdentity::local(Some(777)), None)
            .await
            .unwrap();
        let job = JobSpec {
            guid: Uuid::new_v4(),
            inputs: vec!["scene".into()],
            outputs: vec![],
            payload: serde_json::Value::Null,
        };
        let key = ChannelKey::new(job.guid, "scene");
        assert!(agent.send_channel(h, Some(job.guid), "scene", b"mesh").await);
        assert!(agent.add_job(h, job.clone()).await);
        agent.maintain_once().await.unwrap();
        let store = &agent.runtime().unwrap().store;
        assert_eq!(store.pin_count(&key).await, 1);

        probe.kill(777);
        agent.maintain_once().await.unwrap();
        assert!(!agent.test_connection(h).await);
        assert_eq!(store.pin_count(&key).await, 0);
        assert!(agent.query_job(job.guid).await.is_none());
    }

    #[tokio::test]
    async fn test_full_table_reclaims_dead_connection() {
        let dir = TempDir::new().unwrap();
        let probe = Arc::new(FakeProbe::default());
        let mut config = config();
        config.connections.max_connections = 1;
        let agent = agent_with(&dir, config, 0.0, probe.clone()).await;
        let first = agent.open_connection(RemoteIdentity::local(Some(9)), None).await.unwrap();
        assert!(agent.open_connection(RemoteIdentity::in_process("x"), None).await.is_err());
        probe.kill(9);
        let second = agent.open_connection(RemoteIdentity::in_process("x"), None).await.unwrap();
        assert!(!agent.test_connection(first).await);
        assert!(agent.test_connection(second).await);
    }

    #[tokio::test]
    async fn test_cancel_job_by_owner() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir).await;
        let owner = agent.open_connection(RemoteIdentity::in_process("o"), None).await.unwrap();
        let other = agent.open_connection(RemoteIdentity::in_process("p"), None).await.unwrap();
        let job = JobSpec {
            guid: Uuid::new_v4(),
            inputs: vec![],
            outputs: vec![],
            payload: serde_json::Value::Null,
        };
        assert!(agent.add_job(owner, job.clone()).await);
        assert!(!agent.add_job(owner, job.clone()).await);
        assert!(!agent.cancel_job(other, job.guid).await);
        assert!(agent.cancel_job(owner, job.guid).await);
        let snap = agent.query_job(job.guid).await.unwrap();
        assert_eq!(snap.state, JobState::Failed);
        assert_eq!(snap.failure, Some(JobFailure::Cancelled));
    }

    #[tokio::test]
    async fn test_busy_machine_refuses_work_unless_dedicated() {
        let dir = TempDir::new().unwrap();
        let mut config = config();
        config.performance.sample_interval_ms = 5;
        let agent = agent_with(&dir, config.clone(), 99.0, Arc::new(FakeProbe::default())).await;
        for _ in 0..100 {
            agent.maintain_once().await.unwrap();
            if agent.state() == AgentState::Busy {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(agent.state(), AgentState::Busy);
        let job = JobSpec {
            guid: Uuid::new_v4(),
            inputs: vec![],
            outputs: vec![],
            payload: serde_json::Value::Null,
        };
        assert!(!agent.execute_job(job, "peer:1".into()).await);

        let dir2 = TempDir::new().unwrap();
        config.agent.dedicated = true;
        let dedicated = agent_with(&dir2, config, 99.0, Arc::new(FakeProbe::default())).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        dedicated.maintain_once().await.unwrap();
        assert_eq!(dedicated.state(), AgentState::Available);
    }

    #[tokio::test]
    async fn test_admin_clear_runs_on_next_tick() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir).await;
        let h = agent.open_connection(RemoteIdentity::in_process("c"), None).await.unwrap();
        assert!(agent.send_channel(h, None, "lut", b"table").await);
        agent.enqueue_admin(AdminCommand::CacheClear).await;
        let hash = farm_storage::content_hash(b"table");
        assert!(agent.validate_channel(h, None, "lut", &hash).await);

        agent.maintain_once().await.unwrap();
        assert!(!agent.validate_channel(h, None, "lut", &hash).await);
    }

    #[tokio::test]
    async fn test_shutdown_drains_to_closed() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir).await;
        let h = agent.open_connection(RemoteIdentity::in_process("c"), None).await.unwrap();
        assert!(!agent.shutting_down());
        agent.request_shutdown();
        assert!(agent.shutting_down());
        assert!(agent.open_connection(RemoteIdentity::in_process("d"), None).await.is_err());

        agent.maintain_once().await.unwrap();
        agent.wait_closed().await;
        assert_eq!(agent.state(), AgentState::Closed);
        assert!(!agent.test_connection(h).await);
        assert!(!agent.restarting());
    }

    #[tokio::test]
    async fn test_init_refused_once_shutdown_starts() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir).await;
        agent.request_shutdown();
        assert!(matches!(agent.init(None).await, Err(Error::ShuttingDown)));

        agent.maintain_once().await.unwrap();
        agent.wait_closed().await;
        assert!(matches!(agent.init(Some(7)).await, Err(Error::ShuttingDown)));
        assert_eq!(agent.state(), AgentState::Closed);
    }

    #[tokio::test]
    async fn test_restart_admin_command() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir).await;
        agent.enqueue_admin(AdminCommand::Restart).await;
        agent.maintain_once().await.unwrap();
        assert!(agent.restarting());
        assert_eq!(agent.state(), AgentState::Closed);
    }

    #[tokio::test]
    async fn test_owner_exit_requests_shutdown() {
        let dir = TempDir::new().unwrap();
        let probe = Arc::new(FakeProbe::default());
        let agent = Agent::new(
            config(),
            Paths::with_base(dir.path().to_path_buf()),
            deps(0.0, probe.clone()),
        );
        agent.init(Some(31337)).await.unwrap();
        agent.maintain_once().await.unwrap();
        assert!(!agent.shutting_down());
        probe.kill(31337);
        agent.maintain_once().await.unwrap();
        assert!(agent.shutting_down());
    }

    #[tokio::test]
    async fn test_destroy_twice() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir).await;
        agent.destroy().await;
        agent.destroy().await;
        assert_eq!(agent.state(), AgentState::Closed);
        assert!(matches!(agent.init(None).await, Err(Error::ShuttingDown)));

        let never_started = Agent::new(
            config(),
            Paths::with_base(dir.path().join("other")),
            deps(0.0, Arc::new(FakeProbe::default())),
        );
        never_started.destroy().await;
        never_started.destroy().await;
        assert_eq!(never_started.state(), AgentState::Closed);
    }
}
