//! Live state: current reading and bounded recent history per node.
//!
//! The store is in-memory first. A background writer mirrors it to a flat
//! JSON snapshot so a restart resumes with recent history; the snapshot is
//! best-effort in both directions and never blocks ingestion.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::{LiveReading, NodeLiveRecord};

// ---

/// Serialized form of the whole store, keyed by node name.
pub type LiveSnapshot = BTreeMap<String, NodeLiveRecord>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct LiveStore {
    // ---
    history_len: usize,
    records: DashMap<String, NodeLiveRecord>,
    revision: watch::Sender<u64>,
}

impl LiveStore {
    // ---
    pub fn new(history_len: usize) -> Self {
        Self {
            history_len: history_len.max(1),
            records: DashMap::new(),
            revision: watch::Sender::new(0),
        }
    }

    /// Start from the snapshot at `path`, or empty if it is missing or unreadable.
    pub fn load(path: &Path, history_len: usize) -> Self {
        // ---
        let store = Self::new(history_len);

        match read_snapshot(path) {
            Ok(Some(snapshot)) => {
                for (node_id, mut record) in snapshot {
                    record.history.truncate(store.history_len);
                    store.records.insert(node_id, record);
                }
                info!(
                    "Restored live state for {} nodes from {}",
                    store.records.len(),
                    path.display()
                );
            }
            Ok(None) => info!("No live snapshot at {}, starting empty", path.display()),
            Err(e) => warn!(
                "Ignoring unreadable live snapshot {}: {}",
                path.display(),
                e
            ),
        }

        store
    }

    /// Apply a reading: becomes `current` and the head of `history`.
    ///
    /// Callers must serialize calls for the same node so history stays in
    /// arrival order.
    pub fn record(&self, reading: LiveReading) {
        // ---
        let timestamp = reading.timestamp;
        match self.records.get_mut(&reading.node_id) {
            Some(mut record) => {
                record.history.push_front(reading.clone());
                record.history.truncate(self.history_len);
                record.current = reading;
                record.last_update = timestamp;
            }
            None => {
                let node_id = reading.node_id.clone();
                let mut history = VecDeque::with_capacity(self.history_len.min(64));
                history.push_front(reading.clone());
                self.records.insert(
                    node_id,
                    NodeLiveRecord {
                        current: reading,
                        history,
                        last_update: timestamp,
                    },
                );
            }
        }

        self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    pub fn get(&self, node_id: &str) -> Option<NodeLiveRecord> {
        self.records.get(node_id).map(|r| r.value().clone())
    }

    pub fn get_all(&self) -> LiveSnapshot {
        self.records
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.records.len()
    }

    /// Receiver that wakes whenever a reading has been recorded.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Write the full mapping to `path`, replacing it atomically.
    pub async fn save_snapshot(&self, path: &Path) -> Result<(), SnapshotError> {
        // ---
        let json = serde_json::to_vec_pretty(&self.get_all())?;
        let tmp = tmp_path(path);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// `Ok(None)` when there is no snapshot yet.
pub fn read_snapshot(path: &Path) -> Result<Option<LiveSnapshot>, SnapshotError> {
    // ---
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&data)?))
}

/// Mirror `store` to `path` after every change.
///
/// Bursts are coalesced: while a write is in progress further changes only
/// mark the store dirty, and the next write picks up all of them.
pub fn spawn_snapshot_writer(store: Arc<LiveStore>, path: PathBuf) -> JoinHandle<()> {
    // ---
    let mut changes = store.subscribe_changes();
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            match store.save_snapshot(&path).await {
                Ok(()) => debug!("Live snapshot written to {}", path.display()),
                Err(e) => warn!("Failed to write live snapshot {}: {}", path.display(), e),
            }
        }
    })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
