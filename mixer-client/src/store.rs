//! Persisted commitment records.
//!
//! All records live in memory and are mirrored to one JSON snapshot file
//! (`{"commitments": [...]}`), rewritten atomically on every change. Writers
//! are serialized; a change is only visible in memory after it hit disk.
//! Every change is announced on a broadcast channel.

use crate::error::{MixerError, MixerResult};
use crate::types::{Commitment, CommitmentId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Created(CommitmentId),
    Updated(CommitmentId),
}

impl StoreEvent {
    pub fn id(&self) -> &str {
        match self {
            StoreEvent::Created(id) | StoreEvent::Updated(id) => id,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    commitments: Vec<Commitment>,
}

pub struct CommitmentStore {
    path: Option<PathBuf>,
    records: RwLock<HashMap<CommitmentId, Commitment>>,
    write_lock: Mutex<()>,
    events: broadcast::Sender<StoreEvent>,
}

/// Reject mutations that would break record invariants.
fn check_transition(before: &Commitment, after: &Commitment) -> MixerResult<()> {
    if before.id != after.id || before.secret != after.secret || before.pool_id != after.pool_id {
        return Err(MixerError::InvalidState(format!(
            "{}: id, pool and secret are immutable",
            before.id
        )));
    }
    if after.leaf_index.is_some() != after.funding_block_number.is_some() {
        return Err(MixerError::InvalidState(format!(
            "{}: leaf index and funding block must be set together",
            before.id
        )));
    }
    if before.leaf_index.is_some() && before.leaf_index != after.leaf_index {
        return Err(MixerError::InvalidState(format!(
            "{}: leaf index is already set",
            before.id
        )));
    }
    if after.subsequent_deposit_count < before.subsequent_deposit_count
        || after.last_scanned_block < before.last_scanned_block
    {
        return Err(MixerError::InvalidState(format!(
            "{}: deposit scan progress cannot go backwards",
            before.id
        )));
    }
    Ok(())
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

impl CommitmentStore {
    /// In-memory store (nothing survives the process).
    pub fn in_memory() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            path: None,
            records: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
            events,
        }
    }

    /// Open (or start) the snapshot at `path`.
    pub fn open(path: impl Into<PathBuf>) -> MixerResult<Self> {
        let path = path.into();
        let mut records = HashMap::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| MixerError::Store(format!("read {}: {e}", path.display())))?;
            if !raw.trim().is_empty() {
                let snap: Snapshot = serde_json::from_str(&raw)
                    .map_err(|e| MixerError::Store(format!("parse {}: {e}", path.display())))?;
                for c in snap.commitments {
                    records.insert(c.id.clone(), c);
                }
            }
        }
        debug!(path = %path.display(), records = records.len(), "commitment store opened");
        let (events, _) = broadcast::channel(1024);
        Ok(Self {
            path: Some(path),
            records: RwLock::new(records),
            write_lock: Mutex::new(()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<Commitment> {
        self.records.read().ok()?.get(id).cloned()
    }

    /// All records, newest first.
    pub fn list(&self) -> Vec<Commitment> {
        let mut out: Vec<Commitment> = match self.records.read() {
            Ok(g) => g.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        out.sort_by(|a, b| {
            b.created_ts_ms
                .cmp(&a.created_ts_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn persist_with(&self, changed: &Commitment) -> MixerResult<()> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let mut all: Vec<Commitment> = {
            let g = self
                .records
                .read()
                .map_err(|_| MixerError::Store("store lock poisoned".into()))?;
            g.values()
                .filter(|c| c.id != changed.id)
                .cloned()
                .collect()
        };
        all.push(changed.clone());
        all.sort_by(|a, b| {
            a.created_ts_ms
                .cmp(&b.created_ts_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        let bytes = serde_json::to_vec_pretty(&Snapshot { commitments: all })
            .map_err(|e| MixerError::Store(format!("serialize snapshot: {e}")))?;
        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(|e| MixerError::Store(format!("snapshot task: {e}")))?
            .map_err(|e| MixerError::Store(format!("write snapshot: {e}")))
    }

    fn commit(&self, rec: Commitment) -> MixerResult<()> {
        let mut g = self
            .records
            .write()
            .map_err(|_| MixerError::Store("store lock poisoned".into()))?;
        g.insert(rec.id.clone(), rec);
        Ok(())
    }

    pub async fn insert(&self, c: Commitment) -> MixerResult<()> {
        let _w = self.write_lock.lock().await;
        if self.get(&c.id).is_some() {
            return Err(MixerError::InvalidState(format!("{} already exists", c.id)));
        }
        self.persist_with(&c).await?;
        let id = c.id.clone();
        self.commit(c)?;
        let _ = self.events.send(StoreEvent::Created(id));
        Ok(())
    }

    /// Serialized read-modify-write of one record. Returns the stored record.
    /// No event is published when `f` leaves the record unchanged.
    pub async fn update<F>(&self, id: &str, f: F) -> MixerResult<Commitment>
    where
        F: FnOnce(&mut Commitment),
    {
        self.try_update(id, |r| {
            f(r);
            Ok(())
        })
        .await
    }

    /// Like `update`, but `f` may refuse the change. Its guard runs on the
    /// record as it is under the writer lock; on `Err` nothing is written.
    pub async fn try_update<F>(&self, id: &str, f: F) -> MixerResult<Commitment>
    where
        F: FnOnce(&mut Commitment) -> MixerResult<()>,
    {
        let _w = self.write_lock.lock().await;
        let before = self
            .get(id)
            .ok_or_else(|| MixerError::UnknownCommitment(id.to_string()))?;
        let mut after = before.clone();
        f(&mut after)?;
        if after == before {
            return Ok(after);
        }
        check_transition(&before, &after)?;
        self.persist_with(&after).await?;
        self.commit(after.clone())?;
        let _ = self.events.send(StoreEvent::Updated(id.to_string()));
        Ok(after)
    }
}
