use async_trait::async_trait;
use farm_core::{ChannelKey, Error, Result};
use uuid::Uuid;

use crate::jobs::{JobSnapshot, JobSpec};

/// Calls made to another Agent when a job crosses machines. `peer` is the
/// address advertised in the coordinator roster.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Offers a job to `peer`. `Ok(false)` means the peer refused it.
    async fn execute_job(&self, peer: &str, spec: &JobSpec, origin: &str) -> Result<bool>;

    /// `Ok(None)` when the peer has no record of the job.
    async fn query_job(&self, peer: &str, job_guid: Uuid) -> Result<Option<JobSnapshot>>;

    async fn cancel_job(&self, peer: &str, job_guid: Uuid) -> Result<bool>;

    /// Pulls a channel held by `peer`. `Ok(None)` when the peer lacks it.
    async fn fetch_channel(&self, peer: &str, key: &ChannelKey) -> Result<Option<Vec<u8>>>;
}

/// Used when no peer transport has been wired in.
pub struct NoPeers;

#[async_trait]
impl PeerLink for NoPeers {
    async fn execute_job(&self, peer: &str, _spec: &JobSpec, _origin: &str) -> Result<bool> {
        Err(Error::Transport(format!("no peer transport to reach {}", peer)))
    }

    async fn query_job(&self, peer: &str, _job_guid: Uuid) -> Result<Option<JobSnapshot>> {
        Err(Error::Transport(format!("no peer transport to reach {}", peer)))
    }

    async fn cancel_job(&self, peer: &str, _job_guid: Uuid) -> Result<bool> {
        Err(Error::Transport(format!("no peer transport to reach {}", peer)))
    }

    async fn fetch_channel(&self, peer: &str, _key: &ChannelKey) -> Result<Option<Vec<u8>>> {
        Err(Error::Transport(format!("no peer transport to reach {}", peer)))
    }
}
