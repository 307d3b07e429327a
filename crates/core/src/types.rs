use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of the Agent process.
///
/// `Initializing → Available ⇄ Busy → Blocked → Closed`. `Blocked` is only
/// entered once shutdown has been requested.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Initializing,
    Available,
    Busy,
    Blocked,
    Closed,
}

impl AgentState {
    pub fn accepts_work(&self) -> bool {
        matches!(self, AgentState::Available)
    }

    pub fn is_draining(&self) -> bool {
        matches!(self, AgentState::Blocked | AgentState::Closed)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Initializing => write!(f, "initializing"),
            AgentState::Available => write!(f, "available"),
            AgentState::Busy => write!(f, "busy"),
            AgentState::Blocked => write!(f, "blocked"),
            AgentState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Distributed,
    Executing,
    Completed,
    Failed,
}

impl JobState {
    fn rank(&self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Distributed => 1,
            JobState::Executing => 2,
            JobState::Completed => 3,
            JobState::Failed => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Forward-only transitions; `Failed` is reachable from any
    /// non-terminal state.
    pub fn can_advance_to(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == JobState::Failed || next.rank() > self.rank()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Distributed => write!(f, "distributed"),
            JobState::Executing => write!(f, "executing"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// Why a job ended up `Failed`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobFailure {
    Cancelled,
    OwnerClosed,
    Rejected { reason: String },
    Exhausted { attempts: u32, last_error: String },
    Execution { reason: String },
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::Cancelled => write!(f, "cancelled"),
            JobFailure::OwnerClosed => write!(f, "owning connection closed"),
            JobFailure::Rejected { reason } => write!(f, "rejected: {}", reason),
            JobFailure::Exhausted { attempts, last_error } => {
                write!(f, "gave up after {} attempts: {}", attempts, last_error)
            }
            JobFailure::Execution { reason } => write!(f, "execution failed: {}", reason),
        }
    }
}

/// Identifies a channel: the pair (job GUID, name). The nil GUID marks an
/// agent-wide channel not tied to any job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct ChannelKey {
    pub job_guid: Uuid,
    pub name: String,
}

impl ChannelKey {
    pub fn new(job_guid: Uuid, name: impl Into<String>) -> Self {
        Self {
            job_guid,
            name: name.into(),
        }
    }

    pub fn shared(name: impl Into<String>) -> Self {
        Self::new(Uuid::nil(), name)
    }

    pub fn is_shared(&self) -> bool {
        self.job_guid.is_nil()
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_shared() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.job_guid, self.name)
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConnectionHandle(pub u32);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Local,
    Network,
    /// In-process callers (tests, embedding).
    InProcess,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Local => write!(f, "local"),
            TransportKind::Network => write!(f, "network"),
            TransportKind::InProcess => write!(f, "in-process"),
        }
    }
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteIdentity {
    pub transport: TransportKind,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// RPC session the identity was observed on. Handles opened on one
    /// session are not honoured on another.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<u64>,
}

impl RemoteIdentity {
    pub fn in_process(label: &str) -> Self {
        Self {
            transport: TransportKind::InProcess,
            address: label.to_string(),
            process_id: None,
            agent_id: None,
            session: None,
        }
    }

    pub fn local(process_id: Option<u32>) -> Self {
        Self {
            transport: TransportKind::Local,
            address: "local".to_string(),
            process_id,
            agent_id: None,
            session: None,
        }
    }

    pub fn network(address: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Network,
            address: address.into(),
            process_id: None,
            agent_id: None,
            session: None,
        }
    }

    pub fn with_process(mut self, process_id: u32) -> Self {
        self.process_id = Some(process_id);
        self
    }

    pub fn with_session(mut self, session: u64) -> Self {
        self.session = Some(session);
        self
    }
}

/// A peer Agent as reported by the Coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub agent_id: String,
    pub address: String,
    pub state: AgentState,
    #[serde(default)]
    pub version: String,
}

/// Advisory trust of the running binary, as decided by the security gate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrustStatus {
    Unchecked,
    Trusted { identity: String },
    Untrusted { reason: String },
}

impl TrustStatus {
    pub fn is_trusted(&self) -> bool {
        matches!(self, TrustStatus::Trusted { .. })
    }
}
