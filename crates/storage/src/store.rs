use farm_core::config::CacheConfig;
use farm_core::{ChannelKey, ConnectionHandle, Error, Result};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::hash::{content_hash, hash_file, same_hash};
use crate::index::{IndexFile, IndexRecord, INDEX_FILE};
use crate::staging::{clear_staging, staging_path, StagedTransfer};

/// Administrative requests. Queued by callers, carried out by `maintain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheCommand {
    Relocate(PathBuf),
    Clear,
    ValidateAll,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    pub evicted: usize,
    pub expired_transfers: usize,
    pub cleared: usize,
    pub dropped_corrupt: usize,
    pub relocated_to: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub root: PathBuf,
    pub entries: usize,
    pub keys: usize,
    pub bytes: u64,
    pub pinned_entries: usize,
    pub transfers: usize,
    pub max_entries: usize,
    pub max_bytes: u64,
}

/// A published channel opened for reading.
#[derive(Debug)]
pub struct ChannelBlob {
    pub hash: String,
    pub size: u64,
    pub file: tokio::fs::File,
}

#[derive(Debug)]
struct CacheEntry {
    size: u64,
    last_access: u64,
    pins: u32,
    keys: BTreeSet<ChannelKey>,
}

type TransferKey = (Option<ConnectionHandle>, ChannelKey);
type SharedTransfer = Arc<Mutex<StagedTransfer>>;

struct StoreState {
    root: PathBuf,
    entries: HashMap<String, CacheEntry>,
    index: HashMap<ChannelKey, String>,
    total_bytes: u64,
    clock: u64,
    transfers: HashMap<TransferKey, SharedTransfer>,
    dirty: bool,
}

impl StoreState {
    fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        blob_path(&self.root, hash)
    }

    fn touch(&mut self, hash: &str) {
        self.clock += 1;
        if let Some(entry) = self.entries.get_mut(hash) {
            entry.last_access = self.clock;
            self.dirty = true;
        }
    }

    fn over_budget(&self, incoming: u64, new_entry: bool, max_entries: usize, max_bytes: u64) -> bool {
        let count = self.entries.len() + usize::from(new_entry);
        count > max_entries || self.total_bytes + incoming > max_bytes
    }

    fn lru_victim(&self) -> Option<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.pins == 0)
            .min_by_key(|(_, e)| e.last_access)
            .map(|(h, _)| h.clone())
    }

    /// Evicts least-recently-used unpinned entries until the incoming blob
    /// fits. Evicts nothing if the pinned entries alone leave no room.
    fn make_room(
        &mut self,
        incoming: u64,
        new_entry: bool,
        max_entries: usize,
        max_bytes: u64,
    ) -> Result<usize> {
        let (pinned_entries, pinned_bytes) = self
            .entries
            .values()
            .filter(|e| e.pins > 0)
            .fold((0usize, 0u64), |(n, b), e| (n + 1, b + e.size));
        if pinned_entries + usize::from(new_entry) > max_entries || pinned_bytes + incoming > max_bytes {
            return Err(Error::Capacity(format!(
                "cache full: {} of {} entries / {} of {} bytes pinned, {} bytes incoming",
                pinned_entries, max_entries, pinned_bytes, max_bytes, incoming
            )));
        }
        Ok(self.trim_to_budget(incoming, new_entry, max_entries, max_bytes))
    }

    /// Evicts unpinned entries, oldest first, while over budget and a
    /// victim is left.
    fn trim_to_budget(&mut self, incoming: u64, new_entry: bool, max_entries: usize, max_bytes: u64) -> usize {
        let mut evicted = 0;
        while self.over_budget(incoming, new_entry, max_entries, max_bytes) {
            let Some(victim) = self.lru_victim() else {
                break;
            };
            debug!(hash = %victim, "Evicting cache entry");
            self.remove_entry(&victim);
            evicted += 1;
        }
        evicted
    }

    fn remove_entry(&mut self, hash: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(hash)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        for key in &entry.keys {
            if self.index.get(key).map(String::as_str) == Some(hash) {
                self.index.remove(key);
            }
        }
        if let Err(e) = std::fs::remove_file(self.blob_path(hash)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(hash = %hash, error = %e, "Failed to delete blob");
            }
        }
        self.dirty = true;
        Some(entry)
    }

    fn bind(&mut self, key: ChannelKey, hash: &str) {
        if let Some(previous) = self.index.get(&key).cloned() {
            if previous != hash {
                let orphaned = match self.entries.get_mut(&previous) {
                    Some(old) => {
                        old.keys.remove(&key);
                        old.keys.is_empty() && old.pins == 0
                    }
                    None => false,
                };
                if orphaned {
                    self.remove_entry(&previous);
                }
            }
        }
        if let Some(entry) = self.entries.get_mut(hash) {
            entry.keys.insert(key.clone());
        }
        self.index.insert(key, hash.to_string());
        self.dirty = true;
    }

    /// Moves a fully written staged file into the content-addressed layout
    /// and only then makes it visible under `key`.
    async fn publish(
        &mut self,
        key: ChannelKey,
        staged: &Path,
        hash: &str,
        size: u64,
        max_entries: usize,
        max_bytes: u64,
    ) -> Result<()> {
        if self.entries.contains_key(hash) {
            let _ = tokio::fs::remove_file(staged).await;
            self.bind(key, hash);
            self.touch(hash);
            return Ok(());
        }

        if let Err(e) = self.make_room(size, true, max_entries, max_bytes) {
            let _ = tokio::fs::remove_file(staged).await;
            return Err(e);
        }

        let target = self.blob_path(hash);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Err(e) = tokio::fs::rename(staged, &target).await {
            debug!(error = %e, "Rename into blob store failed, falling back to copy");
            let copied = tokio::fs::copy(staged, &target).await;
            let _ = tokio::fs::remove_file(staged).await;
            copied.map_err(|e| Error::Cache(format!("failed to publish {}: {}", key, e)))?;
        }

        self.entries.insert(
            hash.to_string(),
            CacheEntry {
                size,
                last_access: 0,
                pins: 0,
                keys: BTreeSet::new(),
            },
        );
        self.total_bytes += size;
        self.bind(key, hash);
        self.touch(hash);
        Ok(())
    }

    fn to_index(&self) -> IndexFile {
        let mut entries: Vec<IndexRecord> = self
            .entries
            .iter()
            .map(|(hash, e)| IndexRecord {
                hash: hash.clone(),
                size: e.size,
                last_access: e.last_access,
                keys: e.keys.iter().cloned().collect(),
            })
            .collect();
        entries.sort_by_key(|r| r.last_access);
        IndexFile { entries }
    }

    fn save_index(&mut self) -> Result<()> {
        self.to_index().save(&self.root.join(INDEX_FILE))?;
        self.dirty = false;
        Ok(())
    }

    /// Unlinks matching transfers from the table. The caller discards them.
    fn take_transfers<F>(&mut self, mut pred: F) -> Vec<SharedTransfer>
    where
        F: FnMut(&TransferKey, &SharedTransfer) -> bool,
    {
        let doomed: Vec<TransferKey> = self
            .transfers
            .iter()
            .filter(|&(k, t)| pred(k, t))
            .map(|(k, _)| k.clone())
            .collect();
        doomed
            .iter()
            .filter_map(|key| self.transfers.remove(key))
            .collect()
    }

    async fn relocate(&mut self, new_root: &Path) -> Result<()> {
        if new_root == self.root {
            return Ok(());
        }
        tokio::fs::create_dir_all(new_root.join("blobs")).await?;
        tokio::fs::create_dir_all(new_root.join("staging")).await?;

        for hash in self.entries.keys() {
            let target = blob_path(new_root, hash);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(self.blob_path(hash), &target).await?;
        }

        discard_all(self.take_transfers(|_, _| true)).await;
        let old_root = std::mem::replace(&mut self.root, new_root.to_path_buf());
        self.save_index()?;

        let _ = tokio::fs::remove_dir_all(old_root.join("blobs")).await;
        let _ = tokio::fs::remove_dir_all(old_root.join("staging")).await;
        let _ = tokio::fs::remove_file(old_root.join(INDEX_FILE)).await;
        Ok(())
    }
}

async fn discard_all(transfers: Vec<SharedTransfer>) -> usize {
    let count = transfers.len();
    for transfer in transfers {
        transfer.lock().await.discard().await;
    }
    count
}

fn blob_path(root: &Path, hash: &str) -> PathBuf {
    let prefix = hash.get(..2).unwrap_or("00");
    root.join("blobs").join(prefix).join(hash)
}

/// Content-addressed, size-bounded channel cache.
///
/// Each `(jobGuid, name)` key points at a content entry; several keys can
/// share one entry. Pins are counted per entry and block eviction.
///
/// Lock order is `state` before any staged transfer. Blob hashing and chunk
/// appends run with `state` released.
pub struct ChannelStore {
    state: Mutex<StoreState>,
    commands: Mutex<VecDeque<CacheCommand>>,
    max_entries: usize,
    max_bytes: u64,
    staging_timeout: Duration,
}

impl ChannelStore {
    /// Opens or creates the cache at `root`. An unusable root is fatal.
    pub async fn open(root: PathBuf, config: &CacheConfig) -> Result<Self> {
        let fatal = |e: std::io::Error| Error::Cache(format!("cache root {} unusable: {}", root.display(), e));

        std::fs::create_dir_all(root.join("blobs")).map_err(fatal)?;
        std::fs::create_dir_all(root.join("staging")).map_err(fatal)?;
        let probe = root.join(".probe");
        std::fs::write(&probe, b"ok").map_err(fatal)?;
        std::fs::remove_file(&probe).map_err(fatal)?;

        let leftovers = clear_staging(&root.join("staging")).map_err(fatal)?;
        if leftovers > 0 {
            info!(count = leftovers, "Removed stale staged transfers");
        }

        let mut state = StoreState {
            root: root.clone(),
            entries: HashMap::new(),
            index: HashMap::new(),
            total_bytes: 0,
            clock: 0,
            transfers: HashMap::new(),
            dirty: false,
        };

        match IndexFile::load(&root.join(INDEX_FILE)) {
            Ok(Some(file)) => {
                let mut dropped = 0;
                for record in file.entries {
                    let path = blob_path(&root, &record.hash);
                    let present = std::fs::metadata(&path)
                        .map(|m| m.len() == record.size)
                        .unwrap_or(false);
                    if !present {
                        dropped += 1;
                        continue;
                    }
                    state.clock = state.clock.max(record.last_access);
                    state.total_bytes += record.size;
                    for key in &record.keys {
                        state.index.insert(key.clone(), record.hash.clone());
                    }
                    state.entries.insert(
                        record.hash,
                        CacheEntry {
                            size: record.size,
                            last_access: record.last_access,
                            pins: 0,
                            keys: record.keys.into_iter().collect(),
                        },
                    );
                }
                if dropped > 0 {
                    warn!(count = dropped, "Dropped index entries with missing blobs");
                    state.dirty = true;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Cache index unreadable, starting empty");
                state.dirty = true;
            }
        }

        info!(
            root = %root.display(),
            entries = state.entries.len(),
            bytes = state.total_bytes,
            "Channel store opened"
        );

        Ok(Self {
            state: Mutex::new(state),
            commands: Mutex::new(VecDeque::new()),
            max_entries: config.max_entries.max(1),
            max_bytes: config.max_bytes,
            staging_timeout: Duration::from_secs(config.staging_timeout_secs),
        })
    }

    pub async fn root(&self) -> PathBuf {
        self.state.lock().await.root.clone()
    }

    /// Stores a whole channel and returns its content hash.
    pub async fn put(&self, key: ChannelKey, data: &[u8]) -> Result<String> {
        let hash = content_hash(data);
        let staging = {
            let mut state = self.state.lock().await;
            if state.entries.contains_key(&hash) {
                state.bind(key, &hash);
                state.touch(&hash);
                return Ok(hash);
            }
            if data.len() as u64 > self.max_bytes {
                return Err(Error::Capacity(format!(
                    "{} is {} bytes, larger than the whole cache",
                    key,
                    data.len()
                )));
            }
            state.staging_dir()
        };

        let staged = staging_path(&staging);
        tokio::fs::write(&staged, data).await?;

        let mut state = self.state.lock().await;
        state
            .publish(key, &staged, &hash, data.len() as u64, self.max_entries, self.max_bytes)
            .await?;
        Ok(hash)
    }

    pub async fn put_file(&self, key: ChannelKey, source: &Path) -> Result<String> {
        let data = tokio::fs::read(source).await?;
        self.put(key, &data).await
    }

    /// Appends one inbound chunk. Returns the content hash once the final
    /// chunk has been received and the channel published. A transfer that
    /// outgrows the whole cache is dropped without touching stored entries.
    pub async fn write_chunk(
        &self,
        owner: Option<ConnectionHandle>,
        key: ChannelKey,
        offset: u64,
        data: &[u8],
        last: bool,
        expected_hash: Option<&str>,
    ) -> Result<Option<String>> {
        let tkey = (owner, key.clone());

        // A final chunk leaves the table right away so nothing else can touch it.
        let transfer = if offset == 0 {
            let staging = self.state.lock().await.staging_dir();
            let fresh = StagedTransfer::create(&staging, key.clone(), owner, self.max_bytes).await?;
            let fresh = Arc::new(Mutex::new(fresh));
            let previous = {
                let mut state = self.state.lock().await;
                if last {
                    state.transfers.remove(&tkey)
                } else {
                    state.transfers.insert(tkey.clone(), Arc::clone(&fresh))
                }
            };
            if let Some(previous) = previous {
                debug!(channel = %key, "Restarting transfer from offset 0");
                previous.lock().await.discard().await;
            }
            fresh
        } else {
            let mut state = self.state.lock().await;
            let found = if last {
                state.transfers.remove(&tkey)
            } else {
                state.transfers.get(&tkey).cloned()
            };
            found.ok_or_else(|| Error::Validation(format!("no transfer in progress for {}", key)))?
        };

        let appended = transfer.lock().await.append(offset, data).await;
        if let Err(e) = appended {
            {
                let mut state = self.state.lock().await;
                if state.transfers.get(&tkey).is_some_and(|t| Arc::ptr_eq(t, &transfer)) {
                    state.transfers.remove(&tkey);
                }
            }
            transfer.lock().await.discard().await;
            return Err(e);
        }

        if !last {
            return Ok(None);
        }

        let (path, hash, size) = transfer.lock().await.finish();
        if let Some(expected) = expected_hash {
            if !same_hash(expected, &hash) {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(Error::Validation(format!(
                    "hash mismatch for {}: expected {}, got {}",
                    key, expected, hash
                )));
            }
        }
        let mut state = self.state.lock().await;
        state
            .publish(key, &path, &hash, size, self.max_entries, self.max_bytes)
            .await?;
        Ok(Some(hash))
    }

    /// Opens a published channel for reading and marks it as accessed.
    pub async fn open_channel(&self, key: &ChannelKey) -> Result<Option<ChannelBlob>> {
        let mut state = self.state.lock().await;
        let Some(hash) = state.index.get(key).cloned() else {
            return Ok(None);
        };
        let size = state.entries.get(&hash).map(|e| e.size).unwrap_or(0);
        match tokio::fs::File::open(state.blob_path(&hash)).await {
            Ok(file) => {
                state.touch(&hash);
                Ok(Some(ChannelBlob { hash, size, file }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(channel = %key, "Blob vanished from disk, dropping entry");
                state.remove_entry(&hash);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read(&self, key: &ChannelKey) -> Result<Option<Vec<u8>>> {
        use tokio::io::AsyncReadExt;

        let Some(mut blob) = self.open_channel(key).await? else {
            return Ok(None);
        };
        let mut data = Vec::with_capacity(blob.size as usize);
        blob.file.read_to_end(&mut data).await?;
        Ok(Some(data))
    }

    /// Copies a published channel to `dest`. Returns false if absent.
    pub async fn export(&self, key: &ChannelKey, dest: &Path) -> Result<bool> {
        let Some(mut blob) = self.open_channel(key).await? else {
            return Ok(false);
        };
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(dest).await?;
        tokio::io::copy(&mut blob.file, &mut out).await?;
        Ok(true)
    }

    pub async fn contains(&self, key: &ChannelKey) -> bool {
        self.state.lock().await.index.contains_key(key)
    }

    pub async fn hash_of(&self, key: &ChannelKey) -> Option<String> {
        self.state.lock().await.index.get(key).cloned()
    }

    /// Recomputes the stored blob's hash and compares it with `remote_hash`.
    /// A blob that no longer matches its own address is dropped.
    pub async fn validate(&self, key: &ChannelKey, remote_hash: &str) -> Result<bool> {
        let (stored, path) = {
            let state = self.state.lock().await;
            let Some(stored) = state.index.get(key).cloned() else {
                return Ok(false);
            };
            let path = state.blob_path(&stored);
            (stored, path)
        };
        let actual = match hash_file(&path).await {
            Ok(h) => h,
            Err(e) => {
                warn!(channel = %key, error = %e, "Blob unreadable during validation");
                self.state.lock().await.remove_entry(&stored);
                return Ok(false);
            }
        };
        if actual != stored {
            warn!(channel = %key, stored = %stored, actual = %actual, "Stored channel is corrupt, dropping");
            self.state.lock().await.remove_entry(&stored);
            return Ok(false);
        }
        let matches = same_hash(&actual, remote_hash);
        if !matches {
            warn!(channel = %key, local = %actual, remote = %remote_hash, "Channel hash mismatch");
        }
        Ok(matches)
    }

    /// Pins the entry behind `key`. Returns its hash, which is what
    /// `unpin` takes.
    pub async fn pin(&self, key: &ChannelKey) -> Option<String> {
        let mut state = self.state.lock().await;
        let hash = state.index.get(key).cloned()?;
        let entry = state.entries.get_mut(&hash)?;
        entry.pins += 1;
        Some(hash)
    }

    pub async fn unpin(&self, hash: &str) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.get_mut(hash) {
            entry.pins = entry.pins.saturating_sub(1);
        }
    }

    pub async fn pin_count(&self, key: &ChannelKey) -> u32 {
        let state = self.state.lock().await;
        state
            .index
            .get(key)
            .and_then(|h| state.entries.get(h))
            .map(|e| e.pins)
            .unwrap_or(0)
    }

    /// Drops staged transfers sent over a connection that went away.
    pub async fn abort_transfers_for(&self, owner: ConnectionHandle) -> usize {
        let doomed = self
            .state
            .lock()
            .await
            .take_transfers(|(o, _), _| *o == Some(owner));
        discard_all(doomed).await
    }

    pub async fn abort_transfers_for_job(&self, job_guid: Uuid) -> usize {
        let doomed = self
            .state
            .lock()
            .await
            .take_transfers(|(_, k), _| k.job_guid == job_guid);
        discard_all(doomed).await
    }

    /// Re-hashes every stored blob with the state unlocked and drops those
    /// that no longer match their address.
    async fn verify_all(&self) -> (usize, usize) {
        let blobs: Vec<(String, PathBuf)> = {
            let state = self.state.lock().await;
            state
                .entries
                .keys()
                .map(|h| (h.clone(), state.blob_path(h)))
                .collect()
        };
        let mut corrupt = Vec::new();
        for (hash, path) in &blobs {
            let ok = match hash_file(path).await {
                Ok(actual) => actual == *hash,
                Err(_) => false,
            };
            if !ok {
                warn!(hash = %hash, "Cache entry failed validation, dropping");
                corrupt.push(hash.clone());
            }
        }
        let mut state = self.state.lock().await;
        for hash in &corrupt {
            state.remove_entry(hash);
        }
        (blobs.len(), corrupt.len())
    }

    pub async fn enqueue(&self, command: CacheCommand) {
        info!(?command, "Cache command queued");
        self.commands.lock().await.push_back(command);
    }

    pub async fn pending_commands(&self) -> usize {
        self.commands.lock().await.len()
    }

    /// One maintenance pass: queued admin commands, stale transfers,
    /// budget enforcement, index persistence.
    pub async fn maintain(&self) -> Result<MaintenanceReport> {
        let commands: Vec<CacheCommand> = self.commands.lock().await.drain(..).collect();
        let mut report = MaintenanceReport::default();

        let timeout = self.staging_timeout;
        let expired = self.state.lock().await.take_transfers(|_, t| {
            // A transfer busy appending is not stale.
            t.try_lock().map(|t| t.is_stale(timeout)).unwrap_or(false)
        });
        report.expired_transfers = discard_all(expired).await;
        if report.expired_transfers > 0 {
            info!(count = report.expired_transfers, "Discarded stale transfers");
        }

        for command in commands {
            match command {
                CacheCommand::Clear => {
                    let mut state = self.state.lock().await;
                    let unpinned: Vec<String> = state
                        .entries
                        .iter()
                        .filter(|(_, e)| e.pins == 0)
                        .map(|(h, _)| h.clone())
                        .collect();
                    for hash in &unpinned {
                        state.remove_entry(hash);
                    }
                    report.cleared += unpinned.len();
                    info!(cleared = unpinned.len(), kept = state.entries.len(), "Cache cleared");
                }
                CacheCommand::ValidateAll => {
                    let (checked, dropped) = self.verify_all().await;
                    report.dropped_corrupt += dropped;
                    info!(checked, dropped, "Cache validated");
                }
                CacheCommand::Relocate(dir) => {
                    let mut state = self.state.lock().await;
                    match state.relocate(&dir).await {
                        Ok(()) => {
                            info!(root = %dir.display(), "Cache relocated");
                            report.relocated_to = Some(dir);
                        }
                        Err(e) => error!(target_dir = %dir.display(), error = %e, "Cache relocation failed"),
                    }
                }
            }
        }

        let mut state = self.state.lock().await;
        report.evicted = state.trim_to_budget(0, false, self.max_entries, self.max_bytes);
        if state.over_budget(0, false, self.max_entries, self.max_bytes) {
            warn!(
                entries = state.entries.len(),
                bytes = state.total_bytes,
                "Cache over budget, remaining entries are pinned"
            );
        }

        if state.dirty {
            state.save_index()?;
        }
        Ok(report)
    }

    pub async fn flush(&self) -> Result<()> {
        self.state.lock().await.save_index()
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            root: state.root.clone(),
            entries: state.entries.len(),
            keys: state.index.len(),
            bytes: state.total_bytes,
            pinned_entries: state.entries.values().filter(|e| e.pins > 0).count(),
            transfers: state.transfers.len(),
            max_entries: self.max_entries,
            max_bytes: self.max_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(max_entries: usize) -> CacheConfig {
        CacheConfig {
            max_entries,
            ..CacheConfig::default()
        }
    }

    async fn store(dir: &TempDir, max_entries: usize) -> ChannelStore {
        ChannelStore::open(dir.path().join("cache"), &config(max_entries))
            .await
            .unwrap()
    }

    fn key(name: &str) -> ChannelKey {
        ChannelKey::shared(name)
    }

    async fn byte_bounded_store(dir: &TempDir, max_bytes: u64) -> ChannelStore {
        let config = CacheConfig {
            max_entries: 8,
            max_bytes,
            ..CacheConfig::default()
        };
        ChannelStore::open(dir.path().join("cache"), &config).await.unwrap()
    }

    #[tokio::test]
    async fn test_put_then_validate() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 16).await;
        let k = ChannelKey::new(Uuid::new_v4(), "scene");
        let hash = store.put(k.clone(), b"geometry").await.unwrap();

        assert!(store.validate(&k, &hash).await.unwrap());
        assert!(!store.validate(&k, &content_hash(b"other")).await.unwrap());
        assert!(!store.validate(&key("missing"), &hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_lru_evicts_oldest_unreferenced() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 3).await;
        for name in ["A", "B", "C", "D"] {
            store.put(key(name), name.repeat(8).as_bytes()).await.unwrap();
        }
        assert!(!store.contains(&key("A")).await);
        assert!(store.read(&key("A")).await.unwrap().is_none());
        for name in ["B", "C", "D"] {
            assert!(store.contains(&key(name)).await, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_access_refreshes_recency() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 3).await;
        for name in ["A", "B", "C"] {
            store.put(key(name), name.as_bytes()).await.unwrap();
        }
        store.read(&key("A")).await.unwrap();
        store.put(key("D"), b"D").await.unwrap();
        assert!(store.contains(&key("A")).await);
        assert!(!store.contains(&key("B")).await);
    }

    #[tokio::test]
    async fn test_pinned_entries_survive_eviction() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 2).await;
        store.put(key("A"), b"A").await.unwrap();
        store.put(key("B"), b"B").await.unwrap();
        let pin_a = store.pin(&key("A")).await.unwrap();
        let pin_b = store.pin(&key("B")).await.unwrap();

        let err = store.put(key("C"), b"C").await.unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
        assert!(!store.contains(&key("C")).await);

        store.unpin(&pin_a).await;
        store.put(key("C"), b"C").await.unwrap();
        assert!(!store.contains(&key("A")).await);
        assert!(store.contains(&key("B")).await);
        store.unpin(&pin_b).await;
    }

    #[tokio::test]
    async fn test_shared_content_is_stored_once() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 8).await;
        let a = store.put(ChannelKey::new(Uuid::new_v4(), "tex"), b"same").await.unwrap();
        let b = store.put(ChannelKey::new(Uuid::new_v4(), "tex"), b"same").await.unwrap();
        assert_eq!(a, b);
        let stats = store.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.keys, 2);
    }

    #[tokio::test]
    async fn test_concurrent_puts_on_distinct_keys() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 8).await;
        let k1 = ChannelKey::new(Uuid::new_v4(), "one");
        let k2 = ChannelKey::new(Uuid::new_v4(), "two");
        let (r1, r2) = tokio::join!(store.put(k1.clone(), b"first"), store.put(k2.clone(), b"second"));
        r1.unwrap();
        r2.unwrap();
        assert_eq!(store.read(&k1).await.unwrap().unwrap(), b"first");
        assert_eq!(store.read(&k2).await.unwrap().unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_chunked_transfer_publishes_only_when_complete() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 8).await;
        let owner = Some(ConnectionHandle(1));
        let k = key("big");

        assert!(store.write_chunk(owner, k.clone(), 0, b"abc", false, None).await.unwrap().is_none());
        assert!(!store.contains(&k).await);
        assert!(!store.validate(&k, &content_hash(b"abcdef")).await.unwrap());

        let expected = content_hash(b"abcdef");
        let hash = store
            .write_chunk(owner, k.clone(), 3, b"def", true, Some(&expected))
            .await
            .unwrap();
        assert_eq!(hash.as_deref(), Some(expected.as_str()));
        assert!(store.validate(&k, &expected).await.unwrap());
    }

    #[tokio::test]
    async fn test_chunked_transfer_rejects_bad_hash() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 8).await;
        let k = key("bad");
        let err = store
            .write_chunk(None, k.clone(), 0, b"payload", true, Some(&content_hash(b"nope")))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(!store.contains(&k).await);
        assert_eq!(store.stats().await.transfers, 0);
    }

    #[tokio::test]
    async fn test_abort_transfers_for_connection() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 8).await;
        store
            .write_chunk(Some(ConnectionHandle(4)), key("x"), 0, b"part", false, None)
            .await
            .unwrap();
        store
            .write_chunk(Some(ConnectionHandle(5)), key("y"), 0, b"part", false, None)
            .await
            .unwrap();
        assert_eq!(store.abort_transfers_for(ConnectionHandle(4)).await, 1);
        assert_eq!(store.stats().await.transfers, 1);
    }

    #[tokio::test]
    async fn test_corrupt_blob_dropped_on_validate() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 8).await;
        let k = key("scene");
        let hash = store.put(k.clone(), b"original").await.unwrap();
        let path = blob_path(&store.root().await, &hash);
        std::fs::write(&path, b"tampered").unwrap();

        assert!(!store.validate(&k, &hash).await.unwrap());
        assert!(!store.contains(&k).await);
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let k = key("persisted");
        {
            let store = store(&dir, 8).await;
            store.put(k.clone(), b"keep me").await.unwrap();
            store.flush().await.unwrap();
        }
        let store = store(&dir, 8).await;
        assert_eq!(store.read(&k).await.unwrap().unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_admin_commands_wait_for_maintenance() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 8).await;
        store.put(key("a"), b"a").await.unwrap();
        let pinned = store.put(key("b"), b"b").await.unwrap();
        store.pin(&key("b")).await;

        store.enqueue(CacheCommand::Clear).await;
        assert!(store.contains(&key("a")).await);

        let report = store.maintain().await.unwrap();
        assert_eq!(report.cleared, 1);
        assert!(!store.contains(&key("a")).await);
        assert!(store.contains(&key("b")).await);
        store.unpin(&pinned).await;
    }

    #[tokio::test]
    async fn test_relocate_moves_blobs() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 8).await;
        store.put(key("a"), b"movable").await.unwrap();

        let target = dir.path().join("elsewhere");
        store.enqueue(CacheCommand::Relocate(target.clone())).await;
        let report = store.maintain().await.unwrap();

        assert_eq!(report.relocated_to.as_deref(), Some(target.as_path()));
        assert_eq!(store.root().await, target);
        assert_eq!(store.read(&key("a")).await.unwrap().unwrap(), b"movable");
        assert!(target.join(INDEX_FILE).exists());
    }

    #[tokio::test]
    async fn test_open_fails_on_unusable_root() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        let err = ChannelStore::open(file, &CacheConfig::default()).await.err().unwrap();
        assert!(matches!(err, Error::Cache(_)));
    }

    #[tokio::test]
    async fn test_oversized_transfer_leaves_cache_intact() {
        let dir = TempDir::new().unwrap();
        let store = byte_bounded_store(&dir, 10).await;
        store.put(key("a"), b"aaa").await.unwrap();
        store.put(key("b"), b"bbb").await.unwrap();

        let err = store
            .write_chunk(None, key("big"), 0, &[7u8; 64], true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
        assert!(store.contains(&key("a")).await);
        assert!(store.contains(&key("b")).await);
        assert!(!store.contains(&key("big")).await);
        let stats = store.stats().await;
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.transfers, 0);
    }

    #[tokio::test]
    async fn test_transfer_outgrowing_cache_is_dropped_midway() {
        let dir = TempDir::new().unwrap();
        let store = byte_bounded_store(&dir, 10).await;
        store.put(key("a"), b"aaa").await.unwrap();
        let k = key("growing");

        store.write_chunk(None, k.clone(), 0, b"123456", false, None).await.unwrap();
        assert_eq!(store.stats().await.transfers, 1);
        let err = store
            .write_chunk(None, k.clone(), 6, b"789012", false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
        assert_eq!(store.stats().await.transfers, 0);
        assert!(store.contains(&key("a")).await);

        // The rejected transfer is gone; continuing it is refused.
        assert!(store
            .write_chunk(None, k.clone(), 6, b"7", true, None)
            .await
            .unwrap_err()
            .is_validation());
        let staged = std::fs::read_dir(store.root().await.join("staging")).unwrap().count();
        assert_eq!(staged, 0);
    }

    #[tokio::test]
    async fn test_pinned_bytes_block_put_without_evicting() {
        let dir = TempDir::new().unwrap();
        let store = byte_bounded_store(&dir, 10).await;
        store.put(key("big"), b"88888888").await.unwrap();
        let pin = store.pin(&key("big")).await.unwrap();
        store.put(key("small"), b"1").await.unwrap();

        let err = store.put(key("new"), b"55555").await.unwrap_err();
        assert!(matches!(err, Error::Capacity(_)));
        assert!(store.contains(&key("small")).await);
        assert!(store.contains(&key("big")).await);
        assert!(!store.contains(&key("new")).await);

        // Two bytes fit once the small entry is evicted.
        store.put(key("tiny"), b"tt").await.unwrap();
        assert!(!store.contains(&key("small")).await);
        store.unpin(&pin).await;
    }

    #[tokio::test]
    async fn test_validate_runs_alongside_other_calls() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store(&dir, 8).await);
        let data = vec![3u8; 4 << 20];
        let hash = store.put(key("large"), &data).await.unwrap();

        let validating = {
            let store = Arc::clone(&store);
            let hash = hash.clone();
            tokio::spawn(async move { store.validate(&key("large"), &hash).await })
        };
        store.put(key("other"), b"other").await.unwrap();
        assert!(store.contains(&key("other")).await);
        assert!(validating.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_validate_all_drops_only_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 8).await;
        let good = store.put(key("good"), b"good").await.unwrap();
        let bad = store.put(key("bad"), b"bad").await.unwrap();
        std::fs::write(blob_path(&store.root().await, &bad), b"changed").unwrap();

        store.enqueue(CacheCommand::ValidateAll).await;
        let report = store.maintain().await.unwrap();
        assert_eq!(report.dropped_corrupt, 1);
        assert_eq!(store.hash_of(&key("good")).await, Some(good));
        assert!(!store.contains(&key("bad")).await);
    }
}
