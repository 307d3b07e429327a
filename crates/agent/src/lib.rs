pub mod agent;
pub mod connections;
pub mod executor;
pub mod jobs;
pub mod peer;
pub mod process;

pub use agent::{AdminCommand, Agent, AgentDeps, AgentStatus};
pub use connections::{ConnectionInfo, ConnectionManager, ReclaimReason};
pub use executor::{ExecutionRequest, JobExecutor, NoExecutor, ProcessExecutor};
pub use jobs::{JobManager, JobRole, JobSnapshot, JobSpec, JobSummary};
pub use peer::{NoPeers, PeerLink};
pub use process::{OsProcessProbe, ProcessProbe};
