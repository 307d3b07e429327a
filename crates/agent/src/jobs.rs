use chrono::{DateTime, Utc};
use farm_coordinator::CoordinatorClient;
use farm_core::config::JobsConfig;
use farm_core::{
    ChannelKey, ConnectionHandle, Error, JobFailure, JobState, Paths, PeerInfo, PushMessage, Result,
};
use farm_storage::ChannelStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connections::ConnectionManager;
use crate::executor::{ExecutionRequest, JobExecutor};
use crate::peer::PeerLink;

/// Consecutive unanswered polls before the assigned peer is given up on.
const MAX_POLL_FAILURES: u32 = 3;

/// A unit of distributable work as submitted by a client or handed over
/// by a peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub guid: Uuid,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub payload: Value,
}

impl JobSpec {
    /// Channel names double as file names in the executor workspace.
    pub fn validate(&self) -> Result<()> {
        if self.guid.is_nil() {
            return Err(Error::Validation("job guid must not be nil".into()));
        }
        for name in self.inputs.iter().chain(self.outputs.iter()) {
            if !is_safe_name(name) {
                return Err(Error::Validation(format!("invalid channel name {:?}", name)));
            }
        }
        Ok(())
    }
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobRole {
    /// Submitted here, executed on a peer.
    Delegated,
    /// Received from a peer, executed here.
    Hosted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub guid: Uuid,
    pub role: JobRole,
    pub state: JobState,
    #[serde(default)]
    pub failure: Option<JobFailure>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub missing_inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub pending: usize,
    pub distributed: usize,
    pub executing: usize,
    pub completed: usize,
    pub failed: usize,
    pub hosted: usize,
}

#[derive(Debug, Clone)]
enum Origin {
    Client(ConnectionHandle),
    Peer(String),
}

#[derive(Debug)]
struct Job {
    spec: JobSpec,
    origin: Origin,
    state: JobState,
    failure: Option<JobFailure>,
    attempts: u32,
    assigned: Option<PeerInfo>,
    excluded: HashSet<String>,
    pins: HashMap<ChannelKey, String>,
    requested: HashSet<String>,
    missing: Vec<String>,
    busy: bool,
    generation: u64,
    redispatch: bool,
    last_poll: Option<Instant>,
    poll_failures: u32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished: Option<Instant>,
}

impl Job {
    fn new(spec: JobSpec, origin: Origin) -> Self {
        let now = Utc::now();
        Self {
            missing: spec.inputs.clone(),
            spec,
            origin,
            state: JobState::Pending,
            failure: None,
            attempts: 0,
            assigned: None,
            excluded: HashSet::new(),
            pins: HashMap::new(),
            requested: HashSet::new(),
            busy: false,
            generation: 0,
            redispatch: false,
            last_poll: None,
            poll_failures: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            finished: None,
        }
    }

    fn guid(&self) -> Uuid {
        self.spec.guid
    }

    fn role(&self) -> JobRole {
        match self.origin {
            Origin::Client(_) => JobRole::Delegated,
            Origin::Peer(_) => JobRole::Hosted,
        }
    }

    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            guid: self.guid(),
            role: self.role(),
            state: self.state,
            failure: self.failure.clone(),
            attempts: self.attempts,
            assigned_to: self.assigned.as_ref().map(|p| p.agent_id.clone()),
            missing_inputs: self.missing.clone(),
            outputs: self.spec.outputs.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

enum PollOutcome {
    Progress(JobState),
    Completed,
    RemoteFailed(String),
    Unreachable(String),
}

/// Per-job state machines for delegated and hosted work.
///
/// All transitions go through `set_state`, which refuses to move a job
/// backwards. Network steps run on spawned tasks and report back with the
/// generation they were started under; stale reports are ignored.
pub struct JobManager {
    jobs: Mutex<HashMap<Uuid, Job>>,
    store: Arc<ChannelStore>,
    connections: Arc<ConnectionManager>,
    coordinator: Arc<CoordinatorClient>,
    peers: Arc<dyn PeerLink>,
    executor: Arc<dyn JobExecutor>,
    paths: Paths,
    config: JobsConfig,
    self_address: String,
}

impl JobManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: JobsConfig,
        paths: Paths,
        self_address: String,
        store: Arc<ChannelStore>,
        connections: Arc<ConnectionManager>,
        coordinator: Arc<CoordinatorClient>,
        peers: Arc<dyn PeerLink>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            store,
            connections,
            coordinator,
            peers,
            executor,
            paths,
            config,
            self_address,
        }
    }

    pub fn can_host(&self) -> bool {
        self.executor.is_available()
    }

    /// Registers a job submitted over `owner`. Returns false if the job is
    /// invalid or the GUID is already known.
    pub async fn add(&self, owner: ConnectionHandle, spec: JobSpec) -> bool {
        if let Err(e) = spec.validate() {
            warn!(job = %spec.guid, error = %e, "Rejected job");
            return false;
        }
        let guid = spec.guid;
        {
            let mut jobs = self.jobs.lock().await;
            if jobs.contains_key(&guid) {
                warn!(job = %guid, "Duplicate job guid");
                return false;
            }
            jobs.insert(guid, Job::new(spec, Origin::Client(owner)));
        }
        self.connections.associate_job(owner, guid).await;
        info!(job = %guid, owner = %owner, "Job added");
        true
    }

    /// Accepts a job handed over by the peer at `origin`.
    pub async fn host(&self, spec: JobSpec, origin: String) -> bool {
        if !self.can_host() {
            info!(job = %spec.guid, "Refusing hosted job: no executor");
            return false;
        }
        if let Err(e) = spec.validate() {
            warn!(job = %spec.guid, error = %e, "Rejected hosted job");
            return false;
        }
        let guid = spec.guid;
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&guid) {
            return false;
        }
        info!(job = %guid, origin = %origin, "Hosting job");
        jobs.insert(guid, Job::new(spec, Origin::Peer(origin)));
        true
    }

    pub async fn query(&self, guid: Uuid) -> Option<JobSnapshot> {
        self.jobs.lock().await.get(&guid).map(Job::snapshot)
    }

    /// `requester` must own a delegated job. Hosted jobs may be cancelled
    /// by any connection, since the origin reaches us through its own.
    pub async fn cancel(&self, requester: Option<ConnectionHandle>, guid: Uuid) -> bool {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&guid) else {
            return false;
        };
        if let (Origin::Client(owner), Some(req)) = (&job.origin, requester) {
            if *owner != req {
                warn!(job = %guid, requester = %req, "Cancel refused: not the owner");
                return false;
            }
        }
        self.fail(job, JobFailure::Cancelled).await
    }

    /// Called when `owner` goes away: its live jobs fail, every pin they
    /// hold is released and the jobs are forgotten.
    pub async fn release_owner(&self, owner: ConnectionHandle) -> usize {
        let mut jobs = self.jobs.lock().await;
        let owned: Vec<Uuid> = jobs
            .values()
            .filter(|j| matches!(j.origin, Origin::Client(h) if h == owner))
            .map(Job::guid)
            .collect();
        for guid in &owned {
            if let Some(mut job) = jobs.remove(guid) {
                self.fail(&mut job, JobFailure::OwnerClosed).await;
                self.release_pins(&mut job).await;
            }
        }
        if !owned.is_empty() {
            info!(owner = %owner, jobs = owned.len(), "Released jobs of closed connection");
        }
        owned.len()
    }

    /// Fails every live job. Used when draining runs out of time. Peers
    /// still working on delegated jobs are told to stop.
    pub async fn abandon_all(&self, reason: &str) {
        let mut jobs = self.jobs.lock().await;
        for job in jobs.values_mut() {
            let failed = self
                .fail(
                    job,
                    JobFailure::Execution {
                        reason: reason.to_string(),
                    },
                )
                .await;
            if failed {
                if let Some(peer) = job.assigned.take() {
                    self.cancel_on_peer(peer, job.guid());
                }
            }
        }
    }

    pub async fn active_count(&self) -> usize {
        self.jobs
            .lock()
            .await
            .values()
            .filter(|j| !j.state.is_terminal())
            .count()
    }

    pub async fn summary(&self) -> JobSummary {
        let jobs = self.jobs.lock().await;
        let mut summary = JobSummary::default();
        for job in jobs.values() {
            match job.state {
                JobState::Pending => summary.pending += 1,
                JobState::Distributed => summary.distributed += 1,
                JobState::Executing => summary.executing += 1,
                JobState::Completed => summary.completed += 1,
                JobState::Failed => summary.failed += 1,
            }
            if job.role() == JobRole::Hosted {
                summary.hosted += 1;
            }
        }
        summary
    }

    /// What this Agent is currently doing for others, reported to the
    /// coordinator: `<origin>/<guid>` of a running hosted job.
    pub async fn working_for(&self) -> Option<String> {
        let jobs = self.jobs.lock().await;
        jobs.values()
            .filter(|j| !j.state.is_terminal())
            .find_map(|j| match &j.origin {
                Origin::Peer(origin) => Some(format!("{}/{}", origin, j.guid())),
                Origin::Client(_) => None,
            })
    }

    /// One pass over every job. `dispatch` is false while draining, so no
    /// new work leaves this machine.
    pub async fn maintain(self: &Arc<Self>, dispatch: bool) {
        let peers = if dispatch {
            self.coordinator.available_peers().await
        } else {
            Vec::new()
        };
        let retention = Duration::from_secs(self.config.hosted_retention_secs);

        let mut jobs = self.jobs.lock().await;
        let mut expired = Vec::new();
        for job in jobs.values_mut() {
            match job.origin.clone() {
                Origin::Client(owner) => self.step_delegated(job, owner, &peers).await,
                Origin::Peer(origin) => {
                    if job.finished.map(|t| t.elapsed() >= retention).unwrap_or(false) {
                        expired.push(job.guid());
                    } else {
                        self.step_hosted(job, origin);
                    }
                }
            }
        }
        for guid in expired {
            if let Some(mut job) = jobs.remove(&guid) {
                debug!(job = %guid, "Hosted job retention elapsed");
                self.release_pins(&mut job).await;
                let workspace = self.paths.job_workspace(&guid);
                tokio::spawn(async move {
                    let _ = tokio::fs::remove_dir_all(workspace).await;
                });
            }
        }
    }

    // ----------------------------------------------------------------------
    // Delegated jobs
    // ----------------------------------------------------------------------

    async fn step_delegated(self: &Arc<Self>, job: &mut Job, owner: ConnectionHandle, peers: &[PeerInfo]) {
        if job.state.is_terminal() || job.busy {
            return;
        }

        if job.state == JobState::Pending {
            self.pin_inputs(job).await;
            if !job.missing.is_empty() {
                for name in job.missing.clone() {
                    if job.requested.insert(name.clone()) {
                        debug!(job = %job.guid(), channel = %name, "Requesting missing input from owner");
                        self.connections
                            .notify(
                                owner,
                                PushMessage::ChannelWanted {
                                    job_guid: job.guid(),
                                    name,
                                },
                            )
                            .await;
                    }
                }
                return;
            }
            self.dispatch(job, peers);
            return;
        }

        if job.redispatch {
            self.dispatch(job, peers);
            return;
        }

        let poll_due = job
            .last_poll
            .map(|t| t.elapsed() >= Duration::from_millis(self.config.poll_interval_ms))
            .unwrap_or(true);
        if poll_due {
            self.poll(job);
        }
    }

    fn dispatch(self: &Arc<Self>, job: &mut Job, peers: &[PeerInfo]) {
        let mut candidates: Vec<&PeerInfo> = peers
            .iter()
            .filter(|p| !job.excluded.contains(&p.agent_id))
            .collect();
        if candidates.is_empty() && !job.excluded.is_empty() {
            // Every known peer has been tried; start over with the roster.
            job.excluded.clear();
            candidates = peers.iter().collect();
        }
        let Some(peer) = candidates.get(job.attempts as usize % candidates.len().max(1)) else {
            debug!(job = %job.guid(), "No available peer yet");
            return;
        };
        let peer = (*peer).clone();

        job.attempts += 1;
        job.generation += 1;
        job.busy = true;
        let generation = job.generation;
        let spec = job.spec.clone();
        info!(job = %spec.guid, peer = %peer.agent_id, attempt = job.attempts, "Dispatching job");

        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            let result = mgr
                .peers
                .execute_job(&peer.address, &spec, &mgr.self_address)
                .await;
            mgr.apply_dispatch(spec.guid, generation, peer, result).await;
        });
    }

    async fn apply_dispatch(&self, guid: Uuid, generation: u64, peer: PeerInfo, result: Result<bool>) {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&guid) else {
            return;
        };
        if job.generation != generation {
            return;
        }
        job.busy = false;
        if job.state.is_terminal() {
            return;
        }
        match result {
            Ok(true) => {
                job.redispatch = false;
                job.last_poll = Some(Instant::now());
                job.poll_failures = 0;
                job.assigned = Some(peer);
                self.set_state(job, JobState::Distributed).await;
            }
            Ok(false) => {
                let reason = format!("{} refused the job", peer.agent_id);
                self.attempt_failed(job, &peer, reason).await;
            }
            Err(e) => {
                let reason = format!("{}: {}", peer.agent_id, e);
                self.attempt_failed(job, &peer, reason).await;
            }
        }
    }

    fn poll(self: &Arc<Self>, job: &mut Job) {
        let Some(peer) = job.assigned.clone() else {
            job.redispatch = true;
            return;
        };
        job.busy = true;
        job.last_poll = Some(Instant::now());
        let generation = job.generation;
        let guid = job.guid();
        let outputs = job.spec.outputs.clone();

        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = mgr.query_remote(&peer, guid, &outputs).await;
            mgr.apply_poll(guid, generation, peer, outcome).await;
        });
    }

    async fn query_remote(&self, peer: &PeerInfo, guid: Uuid, outputs: &[String]) -> PollOutcome {
        let snapshot = match self.peers.query_job(&peer.address, guid).await {
            Ok(Some(s)) => s,
            Ok(None) => return PollOutcome::RemoteFailed("peer has no record of the job".into()),
            Err(e) => return PollOutcome::Unreachable(e.to_string()),
        };
        match snapshot.state {
            JobState::Completed => {
                for name in outputs {
                    let key = ChannelKey::new(guid, name.clone());
                    if self.store.contains(&key).await {
                        continue;
                    }
                    match self.peers.fetch_channel(&peer.address, &key).await {
                        Ok(Some(data)) => {
                            if let Err(e) = self.store.put(key, &data).await {
                                return PollOutcome::Unreachable(format!("storing output {}: {}", name, e));
                            }
                        }
                        Ok(None) => {
                            return PollOutcome::RemoteFailed(format!("output {} missing on peer", name))
                        }
                        Err(e) => return PollOutcome::Unreachable(e.to_string()),
                    }
                }
                PollOutcome::Completed
            }
            JobState::Failed => PollOutcome::RemoteFailed(
                snapshot
                    .failure
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "failed on peer".into()),
            ),
            other => PollOutcome::Progress(other),
        }
    }

    async fn apply_poll(&self, guid: Uuid, generation: u64, peer: PeerInfo, outcome: PollOutcome) {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&guid) else {
            return;
        };
        if job.generation != generation {
            return;
        }
        job.busy = false;
        if job.state.is_terminal() {
            return;
        }
        match outcome {
            PollOutcome::Progress(remote) => {
                job.poll_failures = 0;
                if remote == JobState::Executing {
                    self.set_state(job, JobState::Executing).await;
                }
            }
            PollOutcome::Completed => {
                self.pin_outputs(job).await;
                if self.set_state(job, JobState::Completed).await {
                    job.finished = Some(Instant::now());
                    info!(job = %guid, peer = %peer.agent_id, "Job completed");
                }
            }
            PollOutcome::RemoteFailed(reason) => {
                self.attempt_failed(job, &peer, reason).await;
            }
            PollOutcome::Unreachable(reason) => {
                job.poll_failures += 1;
                warn!(job = %guid, peer = %peer.agent_id, failures = job.poll_failures, error = %reason, "Job poll failed");
                if job.poll_failures >= MAX_POLL_FAILURES {
                    let peers = Arc::clone(&self.peers);
                    let address = peer.address.clone();
                    tokio::spawn(async move {
                        let _ = peers.cancel_job(&address, guid).await;
                    });
                    self.attempt_failed(job, &peer, reason).await;
                }
            }
        }
    }

    /// One attempt on `peer` is over. Retry elsewhere without moving the
    /// public state back, or give up once the retry budget is spent.
    async fn attempt_failed(&self, job: &mut Job, peer: &PeerInfo, reason: String) {
        warn!(job = %job.guid(), peer = %peer.agent_id, attempt = job.attempts, reason = %reason, "Job attempt failed");
        job.excluded.insert(peer.agent_id.clone());
        job.assigned = None;
        job.poll_failures = 0;
        job.last_error = Some(reason.clone());
        if job.attempts > self.config.max_retries {
            self.fail(
                job,
                JobFailure::Exhausted {
                    attempts: job.attempts,
                    last_error: reason,
                },
            )
            .await;
        } else {
            job.redispatch = true;
        }
    }

    // ----------------------------------------------------------------------
    // Hosted jobs
    // ----------------------------------------------------------------------

    fn step_hosted(self: &Arc<Self>, job: &mut Job, origin: String) {
        if job.state != JobState::Pending || job.busy {
            return;
        }
        job.busy = true;
        job.generation += 1;
        job.attempts += 1;
        let generation = job.generation;
        let spec = job.spec.clone();

        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            let guid = spec.guid;
            let result = mgr.run_hosted(&spec, &origin, generation).await;
            mgr.finish_hosted(guid, generation, result).await;
        });
    }

    async fn run_hosted(&self, spec: &JobSpec, origin: &str, generation: u64) -> Result<()> {
        for name in &spec.inputs {
            if self.resolve(spec.guid, name).await.is_some() {
                continue;
            }
            let key = ChannelKey::new(spec.guid, name.clone());
            debug!(job = %spec.guid, channel = %name, origin = %origin, "Fetching input from origin");
            match self.peers.fetch_channel(origin, &key).await? {
                Some(data) => {
                    self.store.put(key, &data).await?;
                }
                None => {
                    return Err(Error::Job(format!("input {} unavailable at {}", name, origin)));
                }
            }
        }

        if !self.begin_execution(spec.guid, generation).await {
            return Err(Error::Job("job no longer runnable".into()));
        }

        let workspace = self.paths.job_workspace(&spec.guid);
        let request = ExecutionRequest {
            job_guid: spec.guid,
            input_dir: workspace.join("input"),
            output_dir: workspace.join("output"),
            payload: spec.payload.clone(),
        };
        tokio::fs::create_dir_all(&request.input_dir).await?;
        tokio::fs::create_dir_all(&request.output_dir).await?;
        for name in &spec.inputs {
            let Some(key) = self.resolve(spec.guid, name).await else {
                return Err(Error::Job(format!("input {} was evicted", name)));
            };
            self.store.export(&key, &request.input_dir.join(name)).await?;
        }

        self.executor.execute(&request).await?;

        for name in &spec.outputs {
            let path = request.output_dir.join(name);
            if !path.exists() {
                return Err(Error::Job(format!("executor did not produce {}", name)));
            }
            self.store
                .put_file(ChannelKey::new(spec.guid, name.clone()), &path)
                .await?;
        }
        Ok(())
    }

    async fn begin_execution(&self, guid: Uuid, generation: u64) -> bool {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&guid) else {
            return false;
        };
        if job.generation != generation || job.state.is_terminal() {
            return false;
        }
        self.pin_inputs(job).await;
        if !job.missing.is_empty() {
            return false;
        }
        self.set_state(job, JobState::Executing).await
    }

    async fn finish_hosted(&self, guid: Uuid, generation: u64, result: Result<()>) {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(&guid) else {
            return;
        };
        if job.generation != generation {
            return;
        }
        job.busy = false;
        match result {
            Ok(()) => {
                self.pin_outputs(job).await;
                if self.set_state(job, JobState::Completed).await {
                    info!(job = %guid, "Hosted job completed");
                }
            }
            Err(e) => {
                self.fail(job, JobFailure::Execution { reason: e.to_string() }).await;
            }
        }
        job.finished = Some(Instant::now());
    }

    // ----------------------------------------------------------------------
    // Shared helpers
    // ----------------------------------------------------------------------

    /// A job input resolves to its job-scoped channel first, then to an
    /// agent-wide channel of the same name.
    async fn resolve(&self, guid: Uuid, name: &str) -> Option<ChannelKey> {
        let scoped = ChannelKey::new(guid, name);
        if self.store.contains(&scoped).await {
            return Some(scoped);
        }
        let shared = ChannelKey::shared(name);
        if self.store.contains(&shared).await {
            return Some(shared);
        }
        None
    }

    async fn pin_inputs(&self, job: &mut Job) {
        let mut missing = Vec::new();
        for name in job.spec.inputs.clone() {
            let scoped = ChannelKey::new(job.guid(), name.clone());
            let shared = ChannelKey::shared(name.clone());
            if job.pins.contains_key(&scoped) || job.pins.contains_key(&shared) {
                continue;
            }
            let mut pinned = false;
            for key in [scoped, shared] {
                if let Some(hash) = self.store.pin(&key).await {
                    job.pins.insert(key, hash);
                    pinned = true;
                    break;
                }
            }
            if !pinned {
                missing.push(name);
            }
        }
        job.missing = missing;
    }

    async fn pin_outputs(&self, job: &mut Job) {
        for name in job.spec.outputs.clone() {
            let key = ChannelKey::new(job.guid(), name);
            if job.pins.contains_key(&key) {
                continue;
            }
            if let Some(hash) = self.store.pin(&key).await {
                job.pins.insert(key, hash);
            }
        }
    }

    async fn release_pins(&self, job: &mut Job) {
        for (_, hash) in job.pins.drain() {
            self.store.unpin(&hash).await;
        }
    }

    async fn set_state(&self, job: &mut Job, next: JobState) -> bool {
        if !job.state.can_advance_to(next) {
            return false;
        }
        debug!(job = %job.guid(), from = %job.state, to = %next, "Job state change");
        job.state = next;
        job.updated_at = Utc::now();
        if let Origin::Client(owner) = job.origin {
            self.connections
                .notify(
                    owner,
                    PushMessage::JobUpdate {
                        job_guid: job.guid(),
                        state: next,
                        failure: job.failure.clone(),
                    },
                )
                .await;
        }
        true
    }

    /// Moves a live job to Failed. Its pins are released and its staged
    /// transfers discarded at once.
    async fn fail(&self, job: &mut Job, failure: JobFailure) -> bool {
        if !job.state.can_advance_to(JobState::Failed) {
            return false;
        }
        let guid = job.guid();
        warn!(job = %guid, reason = %failure, "Job failed");
        let notify_peer = matches!(failure, JobFailure::Cancelled | JobFailure::OwnerClosed);
        job.failure = Some(failure);
        self.set_state(job, JobState::Failed).await;
        job.finished = Some(Instant::now());
        self.release_pins(job).await;
        let discarded = self.store.abort_transfers_for_job(guid).await;
        if discarded > 0 {
            debug!(job = %guid, discarded, "Discarded staged transfers of failed job");
        }
        if notify_peer {
            if let Some(peer) = job.assigned.take() {
                self.cancel_on_peer(peer, guid);
            }
        }
        true
    }

    fn cancel_on_peer(&self, peer: PeerInfo, guid: Uuid) {
        let peers = Arc::clone(&self.peers);
        tokio::spawn(async move {
            if let Err(e) = peers.cancel_job(&peer.address, guid).await {
                debug!(job = %guid, peer = %peer.agent_id, error = %e, "Peer cancel failed");
            }
        });
    }
}
