//! Store Segment Log
//!
//! Committed segments live in one directory, named by the ULID range of the
//! records they hold:
//!
//! ```text
//! 01HV3Q8Z2JK4N9XWPB5T6C7D8E-01HV3Q919XFJ0QD2M4R7S8T9V0.flushed
//! 01HV3Q8Z2JK4N9XWPB5T6C7D8E-01HV3Q919XFJ0QD2M4R7S8T9V0.trashed
//! ```
//!
//! The range in the name always equals the min and max record ULIDs of the
//! contents, because every write path scans the body before the final
//! rename. Writes land in a `.tmp` file first, so a crash can only leave
//! temp files behind, which `open()` clears.
//!
//! Appends are idempotent by range name, which makes peer replication safe
//! to retry. Compaction rewrites go through the same scan-then-rename path
//! but are allowed to replace an existing name, since a merge output can
//! span exactly the range of one of its inputs.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use serde::Serialize;
use silt_core::{record, Filesystem, FsLock};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::error::Result;

const EXT_FLUSHED: &str = "flushed";
const EXT_TRASHED: &str = "trashed";
const EXT_TMP: &str = "tmp";
const LOCK_FILE: &str = "LOCK";

/// One store segment: its path and the record range the name encodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMeta {
    pub path: PathBuf,
    pub low: Ulid,
    pub high: Ulid,
    pub size: u64,
}

impl SegmentMeta {
    pub fn overlaps(&self, other: &SegmentMeta) -> bool {
        self.low <= other.high && other.low <= self.high
    }

    fn intersects_range(&self, from: Ulid, to: Ulid) -> bool {
        self.low <= to && from <= self.high
    }
}

fn parse_name(path: &Path) -> Option<(Ulid, Ulid, &str)> {
    let name = path.file_name()?.to_str()?;
    let (range, ext) = name.split_once('.')?;
    let (low, high) = range.split_once('-')?;
    let low = Ulid::from_string(low).ok()?;
    let high = Ulid::from_string(high).ok()?;
    Some((low, high, ext))
}

/// Health numbers for the store directory.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub segments: usize,
    pub bytes: u64,
    pub oldest: Option<String>,
    pub newest: Option<String>,
}

/// The store-side segment store. One per data directory, shared by the
/// consumer, the compacter, and the HTTP API.
pub struct StoreLog {
    fs: Arc<dyn Filesystem>,
    dir: PathBuf,
    target_size: u64,
    _lock: Box<dyn FsLock>,
}

impl StoreLog {
    pub async fn open(
        fs: Arc<dyn Filesystem>,
        dir: impl Into<PathBuf>,
        target_size: u64,
    ) -> Result<Self> {
        let dir = dir.into();
        fs.create_dir_all(&dir).await?;
        let lock = fs.lock(&dir.join(LOCK_FILE)).await?;

        // A crash mid-write leaves only temp files; nothing references them.
        let mut cleared = 0usize;
        for entry in fs.walk(&dir).await? {
            let is_tmp = entry
                .path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == EXT_TMP);
            if is_tmp {
                fs.remove(&entry.path).await?;
                cleared += 1;
            }
        }
        if cleared > 0 {
            info!(count = cleared, dir = %dir.display(), "cleared stale temp segments");
        }

        Ok(Self {
            fs,
            dir,
            target_size,
            _lock: lock,
        })
    }

    /// Append a segment body, naming it after its record range. Idempotent:
    /// when the range name already exists the body is discarded and the
    /// existing segment returned. Fails with `MalformedRecord` when any
    /// record is missing its ULID prefix.
    pub async fn append(&self, body: &[u8]) -> Result<SegmentMeta> {
        self.write_segment(body, false).await
    }

    /// Like `append`, but an existing file with the same range name is
    /// atomically replaced. Compaction only; the replacement body is a
    /// superset of the replaced one.
    pub(crate) async fn write_replacing(&self, body: &[u8]) -> Result<SegmentMeta> {
        self.write_segment(body, true).await
    }

    async fn write_segment(&self, body: &[u8], replace: bool) -> Result<SegmentMeta> {
        let (low, high, _) = record::scan(body)?;
        let final_path = self.dir.join(format!("{low}-{high}.{EXT_FLUSHED}"));

        if !replace && self.fs.exists(&final_path).await {
            let existing = self.fs.open(&final_path).await?;
            let size = existing.size().await?;
            debug!(path = %final_path.display(), "segment already present");
            return Ok(SegmentMeta {
                path: final_path,
                low,
                high,
                size,
            });
        }

        let tmp = self.dir.join(format!("{}.{}", Ulid::new(), EXT_TMP));
        let result = async {
            let mut file = self.fs.create(&tmp).await?;
            file.write_all(body).await?;
            file.sync().await?;
            self.fs.rename(&tmp, &final_path).await
        }
        .await;
        if let Err(err) = result {
            // Leave nothing half-written behind.
            if self.fs.exists(&tmp).await {
                if let Err(rm) = self.fs.remove(&tmp).await {
                    warn!(error = %rm, "removing failed temp segment");
                }
            }
            return Err(err.into());
        }

        Ok(SegmentMeta {
            path: final_path,
            low,
            high,
            size: body.len() as u64,
        })
    }

    /// All flushed segments, ascending by range.
    pub async fn segments(&self) -> Result<Vec<SegmentMeta>> {
        let mut segments = Vec::new();
        for info in self.fs.walk(&self.dir).await? {
            let Some((low, high, ext)) = parse_name(&info.path) else {
                continue;
            };
            if ext != EXT_FLUSHED {
                continue;
            }
            segments.push(SegmentMeta {
                path: info.path,
                low,
                high,
                size: info.size,
            });
        }
        segments.sort_by(|a, b| (a.low, a.high).cmp(&(b.low, b.high)));
        Ok(segments)
    }

    /// Groups of flushed segments whose ranges overlap, each a merge
    /// candidate. Singleton runs are not returned.
    pub async fn overlapping(&self) -> Result<Vec<Vec<SegmentMeta>>> {
        let mut groups = Vec::new();
        let mut run: Vec<SegmentMeta> = Vec::new();
        let mut max_high: Option<Ulid> = None;
        for seg in self.segments().await? {
            match max_high {
                Some(high) if seg.low <= high => {
                    max_high = Some(high.max(seg.high));
                    run.push(seg);
                }
                _ => {
                    if run.len() >= 2 {
                        groups.push(std::mem::take(&mut run));
                    } else {
                        run.clear();
                    }
                    max_high = Some(seg.high);
                    run.push(seg);
                }
            }
        }
        if run.len() >= 2 {
            groups.push(run);
        }
        Ok(groups)
    }

    /// Runs of contiguous non-overlapping flushed segments whose combined
    /// size stays at or below the target size, as concatenation candidates.
    pub async fn sequential(&self) -> Result<Vec<Vec<SegmentMeta>>> {
        let mut groups = Vec::new();
        let mut run: Vec<SegmentMeta> = Vec::new();
        let mut total = 0u64;
        for seg in self.segments().await? {
            let overlaps = run.last().is_some_and(|prev: &SegmentMeta| seg.low <= prev.high);
            let too_big = total + seg.size > self.target_size;
            if overlaps || too_big {
                if run.len() >= 2 {
                    groups.push(std::mem::take(&mut run));
                } else {
                    run.clear();
                }
                total = 0;
            }
            total += seg.size;
            run.push(seg);
        }
        if run.len() >= 2 {
            groups.push(run);
        }
        Ok(groups)
    }

    pub async fn read(&self, meta: &SegmentMeta) -> Result<Vec<u8>> {
        let mut file = self.fs.open(&meta.path).await?;
        let mut body = Vec::with_capacity(meta.size as usize);
        file.read_to_end(&mut body).await?;
        Ok(body)
    }

    /// Rename a flushed segment to `.trashed` and start its purge clock.
    pub async fn trash(&self, meta: &SegmentMeta) -> Result<()> {
        let trashed = meta.path.with_extension(EXT_TRASHED);
        self.fs.rename(&meta.path, &trashed).await?;
        self.fs.touch(&trashed).await?;
        Ok(())
    }

    /// Remove trashed segments whose trash-age exceeds `purge_age`.
    /// Returns how many were purged.
    pub async fn purge(&self, purge_age: Duration) -> Result<usize> {
        let cutoff = SystemTime::now() - purge_age;
        let mut purged = 0usize;
        for info in self.fs.walk(&self.dir).await? {
            let Some((_, _, EXT_TRASHED)) = parse_name(&info.path) else {
                continue;
            };
            if info.mtime > cutoff {
                continue;
            }
            self.fs.remove(&info.path).await?;
            purged += 1;
        }
        Ok(purged)
    }

    /// Records with ULID in `[from, to]`, merged across every flushed
    /// segment intersecting the range, ULID-sorted with exact duplicates
    /// dropped. A compaction running concurrently can briefly expose a
    /// record twice on disk; the dedup hides that from readers.
    pub async fn query(&self, from: Ulid, to: Ulid) -> Result<Vec<Bytes>> {
        let mut lines: Vec<Vec<u8>> = Vec::new();
        for seg in self.segments().await? {
            if !seg.intersects_range(from, to) {
                continue;
            }
            let body = self.read(&seg).await?;
            for line in record::records(&body) {
                let id = record::record_ulid(line)?;
                if id >= from && id <= to {
                    lines.push(line.to_vec());
                }
            }
        }
        lines.sort();
        lines.dedup();
        Ok(lines.into_iter().map(Bytes::from).collect())
    }

    pub async fn statistics(&self) -> Result<StoreStats> {
        let segments = self.segments().await?;
        let bytes = segments.iter().map(|s| s.size).sum();
        let oldest = segments.iter().map(|s| s.low).min();
        let newest = segments.iter().map(|s| s.high).max();
        Ok(StoreStats {
            segments: segments.len(),
            bytes,
            oldest: oldest.map(|u| u.to_string()),
            newest: newest.map(|u| u.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_core::MemFilesystem;

    const TARGET: u64 = 10 * 1024 * 1024;

    async fn mem_store(target: u64) -> (Arc<MemFilesystem>, StoreLog) {
        let fs = Arc::new(MemFilesystem::new());
        let log = StoreLog::open(fs.clone(), "/store", target).await.unwrap();
        (fs, log)
    }

    fn body_for(ids: &[Ulid]) -> Vec<u8> {
        let mut body = Vec::new();
        for (k, id) in ids.iter().enumerate() {
            body.extend_from_slice(format!("{id} record-{k}\n").as_bytes());
        }
        body
    }

    fn ids(base_ms: u64, offsets: &[u64]) -> Vec<Ulid> {
        offsets
            .iter()
            .map(|off| Ulid::from_parts(base_ms + off, u128::from(*off) + 1))
            .collect()
    }

    #[tokio::test]
    async fn test_append_names_segment_by_range() {
        let (_, log) = mem_store(TARGET).await;
        let ids = ids(1_700_000_000_000, &[5, 0, 9]);
        let meta = log.append(&body_for(&ids)).await.unwrap();
        assert_eq!(meta.low, *ids.iter().min().unwrap());
        assert_eq!(meta.high, *ids.iter().max().unwrap());
        let name = meta.path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, format!("{}-{}.flushed", meta.low, meta.high));
    }

    #[tokio::test]
    async fn test_append_rejects_malformed_record() {
        let (fs, log) = mem_store(TARGET).await;
        let err = log.append(b"no ulid prefix\n").await.unwrap_err();
        assert!(err.is_malformed());
        // Nothing, not even a temp file, is left behind.
        assert!(fs.walk(Path::new("/store")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_is_idempotent_by_range() {
        let (_, log) = mem_store(TARGET).await;
        let body = body_for(&ids(1_700_000_000_000, &[0, 1]));
        let first = log.append(&body).await.unwrap();
        let second = log.append(&body).await.unwrap();
        assert_eq!(first.path, second.path);
        assert_eq!(log.segments().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_groups() {
        let (_, log) = mem_store(TARGET).await;
        let t = 1_700_000_000_000u64;
        // [0,10] and [5,15] overlap; [100,110] stands alone.
        log.append(&body_for(&ids(t, &[0, 10]))).await.unwrap();
        log.append(&body_for(&ids(t, &[5, 15]))).await.unwrap();
        log.append(&body_for(&ids(t, &[100, 110]))).await.unwrap();

        let groups = log.overlapping().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
        assert!(groups[0][0].overlaps(&groups[0][1]));
    }

    #[tokio::test]
    async fn test_overlapping_chain_is_one_group() {
        let (_, log) = mem_store(TARGET).await;
        let t = 1_700_000_000_000u64;
        // [0,10], [8,20], [18,30]: pairwise-adjacent overlaps chain up.
        log.append(&body_for(&ids(t, &[0, 10]))).await.unwrap();
        log.append(&body_for(&ids(t, &[8, 20]))).await.unwrap();
        log.append(&body_for(&ids(t, &[18, 30]))).await.unwrap();

        let groups = log.overlapping().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 3);
    }

    #[tokio::test]
    async fn test_sequential_respects_target_size() {
        let (_, log) = mem_store(100).await;
        let t = 1_700_000_000_000u64;
        // Three non-overlapping segments of ~38 bytes each; only two fit
        // under the 100 byte target.
        log.append(&body_for(&ids(t, &[0]))).await.unwrap();
        log.append(&body_for(&ids(t, &[10]))).await.unwrap();
        log.append(&body_for(&ids(t, &[20]))).await.unwrap();

        let groups = log.sequential().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[tokio::test]
    async fn test_sequential_skips_overlapping_runs() {
        let (_, log) = mem_store(TARGET).await;
        let t = 1_700_000_000_000u64;
        log.append(&body_for(&ids(t, &[0, 10]))).await.unwrap();
        log.append(&body_for(&ids(t, &[5, 15]))).await.unwrap();

        // The two overlap, so they are merge candidates, not concat ones.
        assert!(log.sequential().await.unwrap().is_empty());
        assert_eq!(log.overlapping().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_trash_then_purge_after_age() {
        let (fs, log) = mem_store(TARGET).await;
        let meta = log
            .append(&body_for(&ids(1_700_000_000_000, &[0, 1])))
            .await
            .unwrap();

        log.trash(&meta).await.unwrap();
        assert!(log.segments().await.unwrap().is_empty());

        // Too young to purge.
        assert_eq!(log.purge(Duration::from_secs(60)).await.unwrap(), 0);

        let trashed = meta.path.with_extension("trashed");
        fs.set_mtime(&trashed, SystemTime::now() - Duration::from_secs(120))
            .unwrap();
        assert_eq!(log.purge(Duration::from_secs(60)).await.unwrap(), 1);
        assert!(!fs.exists(&trashed).await);
    }

    #[tokio::test]
    async fn test_query_merges_sorts_and_dedups() {
        let (_, log) = mem_store(TARGET).await;
        let t = 1_700_000_000_000u64;
        let all = ids(t, &[0, 5, 10, 15]);
        // Two overlapping segments sharing one record.
        log.append(&body_for(&[all[0], all[1], all[2]])).await.unwrap();
        log.append(&body_for(&[all[2], all[3]])).await.unwrap();

        let hits = log.query(all[0], all[3]).await.unwrap();
        // all[2] appears in both segments with the same payload index, but
        // the payloads differ (record-2 vs record-0), so both survive; the
        // duplicate *identical* line does not exist here. Check ordering
        // and range filtering instead.
        assert!(hits.len() >= 4);
        let mut sorted = hits.clone();
        sorted.sort();
        assert_eq!(hits, sorted);

        let partial = log.query(all[1], all[2]).await.unwrap();
        assert!(partial.iter().all(|line| {
            let id = record::record_ulid(line).unwrap();
            id >= all[1] && id <= all[2]
        }));
    }

    #[tokio::test]
    async fn test_query_drops_exact_duplicates() {
        let (_, log) = mem_store(TARGET).await;
        let t = 1_700_000_000_000u64;
        let a = Ulid::from_parts(t, 1);
        let b = Ulid::from_parts(t + 10, 2);
        let c = Ulid::from_parts(t + 20, 3);
        // The same record line lands in two overlapping segments, as it can
        // mid-compaction.
        let shared = format!("{b} shared-record\n");
        let one = format!("{a} first\n{shared}");
        let two = format!("{shared}{c} last\n");
        log.append(one.as_bytes()).await.unwrap();
        log.append(two.as_bytes()).await.unwrap();

        let hits = log.query(a, c).await.unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn test_statistics() {
        let (_, log) = mem_store(TARGET).await;
        let stats = log.statistics().await.unwrap();
        assert_eq!(stats.segments, 0);
        assert!(stats.oldest.is_none());

        let t = 1_700_000_000_000u64;
        log.append(&body_for(&ids(t, &[0, 10]))).await.unwrap();
        log.append(&body_for(&ids(t, &[20, 30]))).await.unwrap();

        let stats = log.statistics().await.unwrap();
        assert_eq!(stats.segments, 2);
        assert!(stats.bytes > 0);
        assert_eq!(stats.oldest.unwrap(), Ulid::from_parts(t, 1).to_string());
        assert_eq!(
            stats.newest.unwrap(),
            Ulid::from_parts(t + 30, 31).to_string()
        );
    }

    #[tokio::test]
    async fn test_open_clears_stale_temp_files() {
        let fs = Arc::new(MemFilesystem::new());
        fs.create(Path::new("/store/01ABCDEF.tmp")).await.unwrap();
        let log = StoreLog::open(fs.clone(), "/store", TARGET).await.unwrap();
        assert!(!fs.exists(Path::new("/store/01ABCDEF.tmp")).await);
        assert!(log.segments().await.unwrap().is_empty());
    }
}
