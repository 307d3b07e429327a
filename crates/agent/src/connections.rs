use chrono::{DateTime, Utc};
use farm_core::config::ConnectionsConfig;
use farm_core::{ChannelKey, ConnectionHandle, Error, PushMessage, RemoteIdentity, Result};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::process::ProcessProbe;

/// An open logical link from a client process or peer Agent.
#[derive(Debug)]
pub struct Connection {
    pub handle: ConnectionHandle,
    pub remote: RemoteIdentity,
    pub opened_at: DateTime<Utc>,
    pub jobs: BTreeSet<Uuid>,
    pub channels: BTreeSet<ChannelKey>,
    push: Option<mpsc::Sender<PushMessage>>,
    probe_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub handle: ConnectionHandle,
    pub remote: RemoteIdentity,
    pub opened_at: DateTime<Utc>,
    pub jobs: usize,
    pub channels: usize,
    pub probe_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimReason {
    ProcessExited,
    ProbeFailed,
}

struct Table {
    conns: HashMap<ConnectionHandle, Connection>,
    next: u32,
}

impl Table {
    /// Next handle not currently in use. Zero is never issued.
    fn allocate(&mut self) -> ConnectionHandle {
        loop {
            let candidate = ConnectionHandle(self.next);
            self.next = self.next.wrapping_add(1).max(1);
            if !self.conns.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

pub struct ConnectionManager {
    table: Mutex<Table>,
    max_connections: usize,
    max_probe_failures: u32,
    probe: Arc<dyn ProcessProbe>,
}

impl ConnectionManager {
    pub fn new(config: &ConnectionsConfig, probe: Arc<dyn ProcessProbe>) -> Self {
        Self {
            table: Mutex::new(Table {
                conns: HashMap::new(),
                next: 1,
            }),
            max_connections: config.max_connections.max(1),
            max_probe_failures: config.max_probe_failures.max(1),
            probe,
        }
    }

    /// Fails with `Capacity` when the table is full. The caller is expected
    /// to reclaim dead connections and retry before giving up.
    pub async fn open(
        &self,
        remote: RemoteIdentity,
        push: Option<mpsc::Sender<PushMessage>>,
    ) -> Result<ConnectionHandle> {
        let mut table = self.table.lock().await;
        if table.conns.len() >= self.max_connections {
            return Err(Error::Capacity(format!(
                "connection table full ({} open)",
                table.conns.len()
            )));
        }
        let handle = table.allocate();
        info!(handle = %handle, transport = %remote.transport, address = %remote.address, "Connection opened");
        table.conns.insert(
            handle,
            Connection {
                handle,
                remote,
                opened_at: Utc::now(),
                jobs: BTreeSet::new(),
                channels: BTreeSet::new(),
                push,
                probe_failures: 0,
            },
        );
        Ok(handle)
    }

    /// Removes the connection. Closing an unknown or already closed handle
    /// is a no-op returning `None`.
    pub async fn close(&self, handle: ConnectionHandle) -> Option<Connection> {
        let conn = self.table.lock().await.conns.remove(&handle);
        if conn.is_some() {
            info!(handle = %handle, "Connection closed");
        }
        conn
    }

    pub async fn close_all(&self) -> Vec<Connection> {
        let mut table = self.table.lock().await;
        table.conns.drain().map(|(_, c)| c).collect()
    }

    pub async fn test(&self, handle: ConnectionHandle) -> bool {
        self.table.lock().await.conns.contains_key(&handle)
    }

    /// True if `handle` is open and was opened on `session`.
    pub async fn owned_by(&self, handle: ConnectionHandle, session: Option<u64>) -> bool {
        self.table
            .lock()
            .await
            .conns
            .get(&handle)
            .is_some_and(|c| c.remote.session == session)
    }

    pub async fn remote(&self, handle: ConnectionHandle) -> Option<RemoteIdentity> {
        self.table
            .lock()
            .await
            .conns
            .get(&handle)
            .map(|c| c.remote.clone())
    }

    pub async fn associate_job(&self, handle: ConnectionHandle, job: Uuid) -> bool {
        match self.table.lock().await.conns.get_mut(&handle) {
            Some(conn) => {
                conn.jobs.insert(job);
                true
            }
            None => false,
        }
    }

    pub async fn associate_channel(&self, handle: ConnectionHandle, key: ChannelKey) {
        if let Some(conn) = self.table.lock().await.conns.get_mut(&handle) {
            conn.channels.insert(key);
        }
    }

    /// Channels and jobs this connection has touched, used to resolve a
    /// channel name without a job GUID.
    pub async fn scope_of(&self, handle: ConnectionHandle) -> Option<(Vec<ChannelKey>, Vec<Uuid>)> {
        let table = self.table.lock().await;
        let conn = table.conns.get(&handle)?;
        Some((
            conn.channels.iter().cloned().collect(),
            conn.jobs.iter().copied().collect(),
        ))
    }

    pub async fn push_sender(&self, handle: ConnectionHandle) -> Option<mpsc::Sender<PushMessage>> {
        self.table
            .lock()
            .await
            .conns
            .get(&handle)
            .and_then(|c| c.push.clone())
    }

    /// Best-effort notice that never waits on a slow receiver.
    pub async fn notify(&self, handle: ConnectionHandle, message: PushMessage) -> bool {
        let Some(sender) = self.push_sender(handle).await else {
            return false;
        };
        match sender.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(handle = %handle, "Push queue full, dropping notice");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// One liveness pass. Connections whose owning process exited are
    /// reclaimed at once; a closed push link must fail
    /// `max_probe_failures` consecutive probes first.
    pub async fn maintain(&self) -> Vec<(Connection, ReclaimReason)> {
        let mut table = self.table.lock().await;
        let mut doomed = Vec::new();

        for conn in table.conns.values_mut() {
            if let Some(pid) = conn.remote.process_id {
                if !self.probe.is_alive(pid) {
                    doomed.push((conn.handle, ReclaimReason::ProcessExited));
                    continue;
                }
            }
            let link_closed = conn.push.as_ref().map(|p| p.is_closed()).unwrap_or(false);
            if link_closed {
                conn.probe_failures += 1;
                debug!(handle = %conn.handle, failures = conn.probe_failures, "Connection probe failed");
                if conn.probe_failures >= self.max_probe_failures {
                    doomed.push((conn.handle, ReclaimReason::ProbeFailed));
                }
            } else {
                conn.probe_failures = 0;
            }
        }

        let mut reclaimed = Vec::with_capacity(doomed.len());
        for (handle, reason) in doomed {
            if let Some(conn) = table.conns.remove(&handle) {
                info!(handle = %handle, ?reason, address = %conn.remote.address, "Connection reclaimed");
                reclaimed.push((conn, reason));
            }
        }
        reclaimed
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.conns.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn list(&self) -> Vec<ConnectionInfo> {
        let table = self.table.lock().await;
        let mut infos: Vec<ConnectionInfo> = table
            .conns
            .values()
            .map(|c| ConnectionInfo {
                handle: c.handle,
                remote: c.remote.clone(),
                opened_at: c.opened_at,
                jobs: c.jobs.len(),
                channels: c.channels.len(),
                probe_failures: c.probe_failures,
            })
            .collect();
        infos.sort_by_key(|i| i.handle);
        infos
    }
}
