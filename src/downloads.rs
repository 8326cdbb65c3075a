use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Statuses after which the extraction service sends no further updates.
pub const TERMINAL_STATUSES: [&str; 2] = ["finished", "error"];

/// Latest known state of one download, as reported by the extraction service.
///
/// The download id is the key of the surrounding map, both on the wire and
/// in [`StatusStore`]. Optional fields that the upstream left out stay `None`
/// and are omitted again when serialized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownloadStatus {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_error: Option<String>,
    /// Fields this service does not know about, passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DownloadStatus {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            percent: None,
            filename: None,
            downloaded_bytes: None,
            total_bytes: None,
            error: None,
            thumbnail: None,
            thumbnail_error: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        TERMINAL_STATUSES.contains(&self.status.as_str())
    }
}

/// One upstream message: download id -> full replacement snapshot.
pub type StatusBatch = HashMap<String, DownloadStatus>;

/// Point-in-time copy of every entry in the store.
pub type StatusMap = HashMap<String, DownloadStatus>;

/// Upper bound on remembered evictions.
const MAX_TOMBSTONES: usize = 4096;

#[derive(Debug)]
struct Entry {
    status: DownloadStatus,
    updated_at: Instant,
}

#[derive(Debug, Default)]
struct Entries {
    live: HashMap<String, Entry>,
    /// Evicted terminal snapshots. The upstream keeps re-sending its whole
    /// map, so an identical snapshot for one of these ids is ignored.
    tombstones: HashMap<String, (DownloadStatus, Instant)>,
}

impl Entries {
    /// Stores `status` for `id`. `updated_at` only moves when the snapshot
    /// differs from the stored one.
    fn write(&mut self, id: String, status: DownloadStatus, now: Instant) {
        match self.live.get_mut(&id) {
            Some(entry) if entry.status == status => {}
            Some(entry) => {
                entry.status = status;
                entry.updated_at = now;
            }
            None => {
                self.live.insert(
                    id,
                    Entry {
                        status,
                        updated_at: now,
                    },
                );
            }
        }
    }

    fn bury(&mut self, id: String, status: DownloadStatus, now: Instant) {
        self.tombstones.insert(id, (status, now));
        while self.tombstones.len() > MAX_TOMBSTONES {
            let oldest = self
                .tombstones
                .iter()
                .min_by_key(|(_, (_, evicted_at))| *evicted_at)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => self.tombstones.remove(&id),
                None => break,
            };
        }
    }
}

/// Authoritative map of download statuses.
///
/// Every operation takes the lock briefly and copies data in or out, so no
/// caller ever holds a reference into the map or keeps the lock across I/O.
#[derive(Clone, Debug, Default)]
pub struct StatusStore {
    inner: Arc<Mutex<Entries>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the entry for `id` with `status`.
    pub fn upsert(&self, id: impl Into<String>, status: DownloadStatus) {
        let id = id.into();
        let mut entries = self.lock();
        entries.tombstones.remove(&id);
        entries.write(id, status, Instant::now());
    }

    /// Applies a whole batch under a single lock so readers never observe
    /// half of a message. A snapshot identical to an evicted one is skipped;
    /// anything else revives the id. Returns the number of entries written.
    pub fn apply_batch(&self, batch: StatusBatch) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let mut written = 0;
        for (id, status) in batch {
            if let Some((buried, _)) = entries.tombstones.get(&id) {
                if *buried == status {
                    continue;
                }
                entries.tombstones.remove(&id);
            }
            entries.write(id, status, now);
            written += 1;
        }
        written
    }

    pub fn get(&self, id: &str) -> Option<DownloadStatus> {
        self.lock().live.get(id).map(|entry| entry.status.clone())
    }

    pub fn snapshot(&self) -> StatusMap {
        self.lock()
            .live
            .iter()
            .map(|(id, entry)| (id.clone(), entry.status.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().live.is_empty()
    }

    /// Drops terminal entries that have not changed for at least `retention`
    /// and remembers them so unchanged re-sends stay dropped.
    pub fn evict_terminal(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let expired: Vec<String> = entries
            .live
            .iter()
            .filter(|(_, entry)| {
                entry.status.is_terminal()
                    && now.saturating_duration_since(entry.updated_at) >= retention
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(entry) = entries.live.remove(id) {
                entries.bury(id.clone(), entry.status, now);
            }
        }
        expired.len()
    }
}
