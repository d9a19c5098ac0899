#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The backpressure queue (C3, §4.3): the only multi-writer/multi-reader
//! structure in the pipeline. Many protocol-client callbacks enqueue; one
//! router/batcher task per destination dequeues. Overflow beyond
//! `max_in_memory` spills to an append-only, length-prefixed spool directory;
//! once the spool itself is full (or disabled), the configured `DropPolicy`
//! applies.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use edge_model::spool::{SegmentHeader, SEGMENT_ROTATE_BYTES};
use edge_model::QueueRecord;
use tokio::sync::Notify;
use tracing::{error, warn};

pub use edge_config::DropPolicy;

/// Errors surfaced by queue construction (spool directory unusable at
/// startup). Runtime spool errors never propagate; they permanently disable
/// spooling for the process instead (§4.3 failure semantics).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The configured spool directory could not be created.
    #[error("could not create spool directory `{dir}`: {reason}")]
    SpoolDirUnavailable {
        /// The configured directory.
        dir: String,
        /// The underlying I/O error.
        reason: String,
    },
}

/// The outcome of one `enqueue` call (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// Whether the record was retained somewhere (memory or spool).
    pub accepted: bool,
    /// Whether the record was written to spool rather than held in memory.
    pub spilled: bool,
}

/// Point-in-time counters, safe to read concurrently with ongoing
/// enqueue/dequeue traffic (§5).
#[derive(Debug, Default)]
pub struct QueueMetrics {
    /// Records evicted or rejected under the configured drop policy.
    pub records_dropped: u64,
    /// Records currently held in memory.
    pub memory_depth: usize,
    /// Approximate bytes currently held in the spool.
    pub spool_depth_bytes: u64,
    /// Whether the spool has been permanently disabled after a write error.
    pub spool_disabled_runtime: bool,
}

/// Configuration for one `BackpressureQueue` instance.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum records held in memory before overflow behavior kicks in.
    pub max_in_memory: usize,
    /// What happens once both memory and spool are at capacity.
    pub drop_policy: DropPolicy,
    /// Whether disk-spool overflow is enabled.
    pub spool_enabled: bool,
    /// The directory spool segments are written to.
    pub spool_dir: PathBuf,
    /// Maximum total bytes the spool may occupy.
    pub spool_max_bytes: u64,
}

/// Fraction of `max_in_memory` below which the spool is drained preferentially,
/// recycling previously spilled records back into flow ahead of freshly
/// produced ones (§4.3: "drains spool segments before memory when the memory
/// queue drops below the low-water mark").
const LOW_WATER_FRACTION: f64 = 0.1;

struct Inner {
    memory: VecDeque<QueueRecord>,
    read_buffer: VecDeque<QueueRecord>,
    write_file: Option<File>,
    write_segment_index: u64,
    write_bytes: u64,
    total_spool_bytes: u64,
    recovering: bool,
}

/// The bounded in-memory FIFO with disk-spool overflow (C3).
pub struct BackpressureQueue {
    config: QueueConfig,
    inner: Mutex<Inner>,
    notify: Notify,
    spool_enabled: AtomicBool,
    records_dropped: AtomicU64,
}

impl BackpressureQueue {
    /// Opens (and if necessary creates) the queue, scanning `spool_dir` for
    /// segments left over from a prior process so that restart recovery (§5
    /// ordering guarantee 4) drains them first.
    pub fn open(config: QueueConfig) -> Result<Self, Error> {
        let mut recovering = false;
        if config.spool_enabled {
            fs::create_dir_all(&config.spool_dir).map_err(|e| Error::SpoolDirUnavailable {
                dir: config.spool_dir.display().to_string(),
                reason: e.to_string(),
            })?;
            recovering = segment_files(&config.spool_dir).map(|v| !v.is_empty()).unwrap_or(false);
        }
        if recovering {
            warn!(dir = %config.spool_dir.display(), "non-empty spool directory found at startup, draining before new writes reach destinations");
        }

        let existing_segments = if config.spool_enabled {
            segment_files(&config.spool_dir).unwrap_or_default()
        } else {
            Vec::new()
        };
        let total_spool_bytes = existing_segments.iter().filter_map(|p| fs::metadata(p).ok()).map(|m| m.len()).sum();
        let write_segment_index = next_segment_index(&existing_segments);

        Ok(Self {
            spool_enabled: AtomicBool::new(config.spool_enabled),
            config,
            inner: Mutex::new(Inner {
                memory: VecDeque::new(),
                read_buffer: VecDeque::new(),
                write_file: None,
                write_segment_index,
                write_bytes: 0,
                total_spool_bytes,
                recovering,
            }),
            notify: Notify::new(),
            records_dropped: AtomicU64::new(0),
        })
    }

    /// Appends `record`, applying the overflow policy from §4.3. Never blocks
    /// the caller for longer than a single spool write.
    pub fn enqueue(&self, record: QueueRecord) -> EnqueueOutcome {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");

        if inner.memory.len() < self.config.max_in_memory {
            inner.memory.push_back(record);
            drop(inner);
            self.notify.notify_one();
            return EnqueueOutcome { accepted: true, spilled: false };
        }

        if self.spool_enabled.load(Ordering::Acquire) && inner.total_spool_bytes < self.config.spool_max_bytes {
            match self.spill(&mut inner, &record) {
                Ok(()) => {
                    drop(inner);
                    self.notify.notify_one();
                    return EnqueueOutcome { accepted: true, spilled: true };
                }
                Err(err) => {
                    error!(reason = %err, "spool write failed, disabling spool for the remainder of this process");
                    self.spool_enabled.store(false, Ordering::Release);
                }
            }
        }

        match self.config.drop_policy {
            DropPolicy::DropOldest => {
                let _ = inner.memory.pop_front();
                inner.memory.push_back(record);
                let _ = self.records_dropped.fetch_add(1, Ordering::Relaxed);
                drop(inner);
                self.notify.notify_one();
                EnqueueOutcome { accepted: true, spilled: false }
            }
            DropPolicy::DropNewest => {
                let _ = self.records_dropped.fetch_add(1, Ordering::Relaxed);
                EnqueueOutcome { accepted: false, spilled: false }
            }
        }
    }

    /// Returns the next record, or `None` after a short wait if the queue is
    /// empty. Drains spool before memory while recovering from a restart, and
    /// drains spool ahead of memory once memory drops below the low-water
    /// mark in steady state (§4.3, §5 ordering guarantee 4).
    pub async fn dequeue(&self) -> Option<QueueRecord> {
        loop {
            {
                let mut inner = self.inner.lock().expect("queue mutex poisoned");

                if inner.recovering {
                    if let Some(record) = self.pop_from_spool(&mut inner) {
                        return Some(record);
                    }
                    inner.recovering = false;
                }

                let low_water = ((self.config.max_in_memory as f64) * LOW_WATER_FRACTION) as usize;
                let spool_has_data = inner.total_spool_bytes > 0 || !inner.read_buffer.is_empty();

                if inner.memory.len() < low_water.max(1) && spool_has_data {
                    if let Some(record) = self.pop_from_spool(&mut inner) {
                        return Some(record);
                    }
                }

                if let Some(record) = inner.memory.pop_front() {
                    return Some(record);
                }

                if let Some(record) = self.pop_from_spool(&mut inner) {
                    return Some(record);
                }
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(200)) => return None,
            }
        }
    }

    /// Point-in-time metrics snapshot.
    pub fn metrics(&self) -> QueueMetrics {
        let inner = self.inner.lock().expect("queue mutex poisoned");
        QueueMetrics {
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            memory_depth: inner.memory.len(),
            spool_depth_bytes: inner.total_spool_bytes,
            spool_disabled_runtime: self.config.spool_enabled && !self.spool_enabled.load(Ordering::Acquire),
        }
    }

    fn spill(&self, inner: &mut Inner, record: &QueueRecord) -> std::io::Result<()> {
        let payload = serde_yaml::to_vec(record).map_err(std::io::Error::other)?;
        let frame_len = payload.len() as u64;

        if inner.write_file.is_none() {
            self.open_write_segment(inner)?;
        }

        if inner.write_bytes + 4 + frame_len > SEGMENT_ROTATE_BYTES && inner.write_bytes > 0 {
            self.rotate_write_segment(inner)?;
        }

        let file = inner.write_file.as_mut().expect("write segment just opened");
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&payload)?;
        inner.write_bytes += 4 + frame_len;
        inner.total_spool_bytes += 4 + frame_len;
        Ok(())
    }

    fn open_write_segment(&self, inner: &mut Inner) -> std::io::Result<()> {
        let path = self.config.spool_dir.join(segment_file_name(inner.write_segment_index));
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let header = serde_yaml::to_vec(&SegmentHeader::default()).map_err(std::io::Error::other)?;
        file.write_all(&(header.len() as u32).to_le_bytes())?;
        file.write_all(&header)?;
        inner.write_bytes = 4 + header.len() as u64;
        inner.total_spool_bytes += inner.write_bytes;
        inner.write_file = Some(file);
        Ok(())
    }

    fn rotate_write_segment(&self, inner: &mut Inner) -> std::io::Result<()> {
        if let Some(file) = inner.write_file.take() {
            file.sync_all()?;
        }
        inner.write_segment_index += 1;
        self.open_write_segment(inner)
    }

    /// Pops one record from the in-memory read buffer, loading the oldest
    /// closed segment file wholesale if the buffer is empty. A segment file
    /// is deleted once it has been fully parsed into the buffer; a
    /// short/corrupt trailing frame truncates the segment at the last whole
    /// record (§4.3 invariant iv).
    fn pop_from_spool(&self, inner: &mut Inner) -> Option<QueueRecord> {
        if let Some(record) = inner.read_buffer.pop_front() {
            return Some(record);
        }

        let write_file_name = segment_file_name(inner.write_segment_index);
        let candidates = segment_files(&self.config.spool_dir).unwrap_or_default();
        let oldest = candidates
            .into_iter()
            .find(|p| p.file_name().and_then(|n| n.to_str()).map(|n| n != write_file_name).unwrap_or(false))?;

        let on_disk_bytes = fs::metadata(&oldest).map(|m| m.len()).unwrap_or(0);
        if let Err(err) = load_segment(&oldest, &mut inner.read_buffer) {
            error!(file = %oldest.display(), reason = %err, "unreadable spool segment, discarding");
        }
        inner.total_spool_bytes = inner.total_spool_bytes.saturating_sub(on_disk_bytes);
        let _ = fs::remove_file(&oldest);

        inner.read_buffer.pop_front()
    }
}

fn segment_file_name(index: u64) -> String {
    format!("segment-{index:020}.log")
}

fn segment_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "log").unwrap_or(false))
        .collect();
    files.sort();
    Ok(files)
}

fn next_segment_index(existing: &[PathBuf]) -> u64 {
    existing
        .iter()
        .filter_map(|p| p.file_stem().and_then(|s| s.to_str()))
        .filter_map(|s| s.strip_prefix("segment-"))
        .filter_map(|s| s.parse::<u64>().ok())
        .max()
        .map(|m| m + 1)
        .unwrap_or(0)
}

/// Reads every whole frame out of `path` into `buffer`, validating the
/// segment header first. A short or corrupt trailing frame stops parsing at
/// the last whole record rather than erroring.
fn load_segment(path: &Path, buffer: &mut VecDeque<QueueRecord>) -> std::io::Result<u64> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    let _ = file.read_to_end(&mut bytes)?;

    let mut offset = 0usize;
    let Some(header_len) = read_u32(&bytes, offset) else {
        return Ok(0);
    };
    offset += 4;
    let Some(header_bytes) = bytes.get(offset..offset + header_len as usize) else {
        return Ok(0);
    };
    let header: SegmentHeader = match serde_yaml::from_slice(header_bytes) {
        Ok(h) => h,
        Err(_) => return Ok(0),
    };
    if header.schema_version != edge_model::spool::SPOOL_SCHEMA_VERSION {
        warn!(file = %path.display(), version = header.schema_version, "unsupported spool schema version, discarding segment");
        return Ok(0);
    }
    offset += header_bytes.len();

    loop {
        let Some(len) = read_u32(&bytes, offset) else { break };
        let record_start = offset + 4;
        let Some(record_bytes) = bytes.get(record_start..record_start + len as usize) else {
            break;
        };
        match serde_yaml::from_slice(record_bytes) {
            Ok(record) => buffer.push_back(record),
            Err(_) => break,
        }
        offset = record_start + len as usize;
    }

    Ok(offset as u64)
}

fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let slice = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes(slice.try_into().ok()?))
}

#[cfg(test)]
mod test {
    use super::*;
    use edge_model::{DataType, NormalizedTag, Protocol, Quality, RawValue};
    use std::collections::BTreeMap;

    fn sample(seq: i64) -> QueueRecord {
        QueueRecord {
            tag: NormalizedTag {
                tag_path: "s/a/l/e/signal".into(),
                tag_id: seq as u64,
                data_type: DataType::Int,
                quality: Quality::Good,
                value: RawValue::Int(seq),
                event_time_ms: seq,
                source_name: "src".into(),
                protocol: Protocol::Mqtt,
                metadata: BTreeMap::new(),
            },
            ingest_time_ms: seq,
        }
    }

    fn config(dir: &Path, max_in_memory: usize, spool_enabled: bool) -> QueueConfig {
        QueueConfig {
            max_in_memory,
            drop_policy: DropPolicy::DropOldest,
            spool_enabled,
            spool_dir: dir.to_path_buf(),
            spool_max_bytes: 1024 * 1024,
        }
    }

    #[tokio::test]
    async fn enqueue_dequeue_preserves_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = BackpressureQueue::open(config(dir.path(), 10, false)).unwrap();
        for i in 0..5 {
            assert_eq!(queue.enqueue(sample(i)), EnqueueOutcome { accepted: true, spilled: false });
        }
        for i in 0..5 {
            let record = queue.dequeue().await.unwrap();
            assert_eq!(record.tag.value, RawValue::Int(i));
        }
    }

    #[tokio::test]
    async fn overflow_without_spool_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let queue = BackpressureQueue::open(config(dir.path(), 3, false)).unwrap();
        for i in 0..5 {
            let _ = queue.enqueue(sample(i));
        }
        assert_eq!(queue.metrics().records_dropped, 2);
        let first = queue.dequeue().await.unwrap();
        assert_eq!(first.tag.value, RawValue::Int(2));
    }

    #[tokio::test]
    async fn overflow_with_drop_newest_rejects_new_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path(), 2, false);
        cfg.drop_policy = DropPolicy::DropNewest;
        let queue = BackpressureQueue::open(cfg).unwrap();
        let _ = queue.enqueue(sample(0));
        let _ = queue.enqueue(sample(1));
        let outcome = queue.enqueue(sample(2));
        assert_eq!(outcome, EnqueueOutcome { accepted: false, spilled: false });
        assert_eq!(queue.metrics().records_dropped, 1);
    }

    #[tokio::test]
    async fn overflow_spills_to_disk_and_drains_back() {
        let dir = tempfile::tempdir().unwrap();
        let queue = BackpressureQueue::open(config(dir.path(), 2, true)).unwrap();
        for i in 0..4 {
            let outcome = queue.enqueue(sample(i));
            assert!(outcome.accepted);
        }
        assert!(queue.metrics().spool_depth_bytes > 0);

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(queue.dequeue().await.unwrap().tag.value.clone());
        }
        assert_eq!(seen, vec![RawValue::Int(0), RawValue::Int(1), RawValue::Int(2), RawValue::Int(3)]);
    }

    #[tokio::test]
    async fn restart_drains_spool_before_fresh_memory_writes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = BackpressureQueue::open(config(dir.path(), 1, true)).unwrap();
            for i in 0..3 {
                let _ = queue.enqueue(sample(i));
            }
        }

        let queue = BackpressureQueue::open(config(dir.path(), 10, true)).unwrap();
        let _ = queue.enqueue(sample(99));

        let first = queue.dequeue().await.unwrap();
        assert_ne!(first.tag.value, RawValue::Int(99), "spool backlog must drain before the fresh write");
    }

    #[tokio::test]
    async fn empty_queue_returns_none_after_short_wait() {
        let dir = tempfile::tempdir().unwrap();
        let queue = BackpressureQueue::open(config(dir.path(), 10, false)).unwrap();
        assert!(queue.dequeue().await.is_none());
    }
}
