use super::record::{BufferStats, TelemetryRecord};
use crate::state::now_epoch;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Bounded ring of records that exhausted their retries.
pub const FAILED_CAPACITY: usize = 100;
/// Failed records re-admitted per retry cycle.
pub const READMIT_BATCH: usize = 10;
/// Synced records older than this are evicted.
pub const RETENTION_SECS: f64 = 3600.0;

/// On-disk snapshot schema.
#[derive(Serialize, Deserialize)]
struct BufferSnapshot {
    memory_buffer: Vec<TelemetryRecord>,
    failed_buffer: Vec<TelemetryRecord>,
    stats: BufferStats,
    saved_at: f64,
}

struct Inner {
    memory: VecDeque<TelemetryRecord>,
    failed: VecDeque<TelemetryRecord>,
    stats: BufferStats,
    since_checkpoint: u64,
}

/// Store-and-forward buffer: a bounded in-memory ring with a disk spill,
/// tolerant of minutes-to-hours of central-server outage.
///
/// The lock guards structural changes only; the sync loop works on clones.
pub struct TelemetryBuffer {
    inner: Mutex<Inner>,
    max_memory_records: usize,
    max_retries: u32,
    checkpoint_interval: u64,
    path: PathBuf,
}

impl TelemetryBuffer {
    pub fn new(
        path: impl Into<PathBuf>,
        max_memory_records: usize,
        max_retries: u32,
        checkpoint_interval: u64,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                memory: VecDeque::new(),
                failed: VecDeque::new(),
                stats: BufferStats::default(),
                since_checkpoint: 0,
            }),
            max_memory_records: max_memory_records.max(1),
            max_retries,
            checkpoint_interval: checkpoint_interval.max(1),
            path: path.into(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Restore a previous snapshot. A file that fails to parse is quarantined
    /// with a `.bad` suffix and the buffer starts fresh.
    pub fn load(&self) {
        if !self.path.exists() {
            return;
        }

        let parsed = std::fs::read_to_string(&self.path)
            .map_err(anyhow::Error::from)
            .and_then(|text| Ok(serde_json::from_str::<BufferSnapshot>(&text)?));

        match parsed {
            Ok(snapshot) => {
                let mut inner = self.lock();
                inner.memory = snapshot.memory_buffer.into();
                inner.failed = snapshot.failed_buffer.into();
                inner.stats = snapshot.stats;
                refresh_counts(&mut inner);
                info!(
                    "Telemetry buffer restored from {:?}: {} records, {} pending",
                    self.path,
                    inner.memory.len(),
                    inner.stats.pending_sync
                );
            }
            Err(e) => {
                let quarantine = quarantine_path(&self.path);
                warn!(
                    "Telemetry buffer at {:?} unreadable ({}), quarantining to {:?}",
                    self.path, e, quarantine
                );
                if let Err(rename_err) = std::fs::rename(&self.path, &quarantine) {
                    warn!("Failed to quarantine buffer file: {}", rename_err);
                }
            }
        }
    }

    /// Write the snapshot to disk.
    pub fn save(&self) -> std::io::Result<()> {
        let snapshot = {
            let mut inner = self.lock();
            refresh_counts(&mut inner);
            BufferSnapshot {
                memory_buffer: inner.memory.iter().cloned().collect(),
                failed_buffer: inner.failed.iter().cloned().collect(),
                stats: inner.stats.clone(),
                saved_at: now_epoch(),
            }
        };

        let text = serde_json::to_string(&snapshot)?;
        std::fs::write(&self.path, text)?;
        debug!("Telemetry buffer saved to {:?}", self.path);
        Ok(())
    }

    /// Append a record; newest wins when the ring is full. Returns `true`
    /// when a checkpoint is due.
    pub fn push(&self, record: TelemetryRecord) -> bool {
        let mut inner = self.lock();
        if inner.memory.len() >= self.max_memory_records {
            inner.memory.pop_front();
        }
        inner.memory.push_back(record);
        inner.stats.total_records += 1;
        inner.stats.pending_sync += 1;

        inner.since_checkpoint += 1;
        if inner.since_checkpoint >= self.checkpoint_interval {
            inner.since_checkpoint = 0;
            true
        } else {
            false
        }
    }

    /// Up to `max` unsynced records in capture-time order.
    pub fn pending(&self, max: usize) -> Vec<TelemetryRecord> {
        let inner = self.lock();
        let mut pending: Vec<TelemetryRecord> =
            inner.memory.iter().filter(|r| !r.synced).cloned().collect();
        pending.sort_by(|a, b| {
            a.capture_time
                .partial_cmp(&b.capture_time)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        pending.truncate(max);
        pending
    }

    /// Mark the given records synced. Idempotent: records already synced (or
    /// no longer present) are skipped.
    pub fn mark_synced(&self, records: &[TelemetryRecord]) -> usize {
        let mut inner = self.lock();
        let mut synced = 0;
        for sent in records {
            if let Some(record) = inner
                .memory
                .iter_mut()
                .find(|r| r.same_key(sent) && !r.synced)
            {
                record.synced = true;
                synced += 1;
            }
        }
        inner.stats.pending_sync = inner.stats.pending_sync.saturating_sub(synced as u64);
        inner.stats.last_sync_time = now_epoch();
        synced
    }

    /// Count a failed batch: bump each record's retry counter and move
    /// exhausted ones to the failed ring.
    pub fn mark_failed(&self, records: &[TelemetryRecord]) {
        let mut inner = self.lock();
        for sent in records {
            let Some(position) = inner.memory.iter().position(|r| r.same_key(sent)) else {
                continue;
            };
            let retries = {
                let record = &mut inner.memory[position];
                record.retry_count += 1;
                record.retry_count
            };
            if retries >= self.max_retries {
                if let Some(record) = inner.memory.remove(position) {
                    if inner.failed.len() >= FAILED_CAPACITY {
                        inner.failed.pop_front();
                    }
                    inner.failed.push_back(record);
                    inner.stats.failed_sync += 1;
                    inner.stats.pending_sync = inner.stats.pending_sync.saturating_sub(1);
                }
            }
        }
        inner.stats.sync_failures += 1;
    }

    /// Move up to `READMIT_BATCH` failed records back into rotation with
    /// their counters reset.
    pub fn readmit_failed(&self) -> usize {
        let mut inner = self.lock();
        let mut readmitted = 0;
        while readmitted < READMIT_BATCH {
            let Some(mut record) = inner.failed.pop_front() else {
                break;
            };
            record.retry_count = 0;
            record.synced = false;
            if inner.memory.len() >= self.max_memory_records {
                inner.memory.pop_front();
            }
            inner.memory.push_back(record);
            inner.stats.failed_sync = inner.stats.failed_sync.saturating_sub(1);
            inner.stats.pending_sync += 1;
            readmitted += 1;
        }
        readmitted
    }

    /// Drop synced records older than the retention window.
    pub fn evict_expired(&self) -> usize {
        let cutoff = now_epoch() - RETENTION_SECS;
        let mut inner = self.lock();
        let before = inner.memory.len();
        inner
            .memory
            .retain(|r| !(r.synced && r.capture_time < cutoff));
        before - inner.memory.len()
    }

    pub fn stats(&self) -> BufferStats {
        let mut inner = self.lock();
        refresh_counts(&mut inner);
        inner.stats.clone()
    }

    pub fn memory_len(&self) -> usize {
        self.lock().memory.len()
    }

    pub fn failed_len(&self) -> usize {
        self.lock().failed.len()
    }
}

fn refresh_counts(inner: &mut Inner) {
    inner.stats.pending_sync = inner.memory.iter().filter(|r| !r.synced).count() as u64;
    inner.stats.failed_sync = inner.failed.len() as u64;
    inner.stats.buffer_size_bytes = inner
        .memory
        .iter()
        .chain(inner.failed.iter())
        .map(|r| serde_json::to_vec(r).map(|v| v.len() as u64).unwrap_or(0))
        .sum();
}

fn quarantine_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".bad");
    PathBuf::from(name)
}
