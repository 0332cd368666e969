//! Ingest Segment Log
//!
//! A directory of segment files whose extension encodes their state:
//!
//! ```text
//! 01HV3Q8Z2JK4N9XWPB5T6C7D8E.active          being written
//! 01HV3Q8Z2JK4N9XWPB5T6C7D8E.flushed         durable, unclaimed
//! 01HV3Q8Z2JK4N9XWPB5T6C7D8E.pending.<tok>   claimed by a consumer
//! ```
//!
//! Basenames are freshly generated ULIDs, so name order is creation order and
//! ties cannot happen. Every state transition is an atomic rename in the same
//! directory; a rename whose source is gone means another actor won the race.
//!
//! ## Claim Protocol
//!
//! `oldest()` renames the smallest flushed segment to `.pending.<token>` in
//! the same call. The claimant either `commit()`s (segment deleted) or
//! `fail()`s (renamed back to flushed). Claimants that vanish are covered by
//! `sweep()`, which reverts pending segments older than the pending timeout.
//! For a given token exactly one of commit and fail takes effect; the other
//! sees `NoSuchToken`.
//!
//! ## Crash Recovery
//!
//! `open()` takes the directory's advisory lock and promotes leftover
//! `.active` files to `.flushed` (or removes them when empty). Leftover
//! pending segments are not touched: their claimants are dead and the sweep
//! reaps them once the timeout passes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use silt_core::{record, FileInfo, Filesystem, FsFile, FsLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::error::{Error, Result};
use crate::metrics::IngestMetrics;

const EXT_ACTIVE: &str = "active";
const EXT_FLUSHED: &str = "flushed";
const PENDING_PREFIX: &str = "pending.";
const LOCK_FILE: &str = "LOCK";

/// Why an active segment was flushed. Instrumentation only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Size,
    Age,
    Close,
}

impl FlushReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FlushReason::Size => "size",
            FlushReason::Age => "age",
            FlushReason::Close => "close",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SegmentState {
    Active,
    Flushed,
    Pending(String),
}

fn parse_state(path: &Path) -> Option<SegmentState> {
    let name = path.file_name()?.to_str()?;
    let (_, rest) = name.split_once('.')?;
    match rest {
        EXT_ACTIVE => Some(SegmentState::Active),
        EXT_FLUSHED => Some(SegmentState::Flushed),
        _ => rest
            .strip_prefix(PENDING_PREFIX)
            .map(|token| SegmentState::Pending(token.to_string())),
    }
}

/// Replace everything after the ULID basename. `Path::with_extension` is not
/// enough because pending names carry two dot components.
fn with_state(path: &Path, state: &str) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let base = name.split_once('.').map(|(b, _)| b).unwrap_or(name);
    path.with_file_name(format!("{base}.{state}"))
}

/// The ingest-side segment store. One per data directory, shared by all
/// writer connections and the HTTP API.
#[derive(Debug)]
pub struct IngestLog {
    fs: Arc<dyn Filesystem>,
    dir: PathBuf,
    _lock: Box<dyn FsLock>,
}

impl IngestLog {
    /// Open the log, taking exclusive ownership of `dir` and recovering any
    /// segments left active by a crash.
    pub async fn open(fs: Arc<dyn Filesystem>, dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs.create_dir_all(&dir).await?;
        let lock = fs.lock(&dir.join(LOCK_FILE)).await?;

        let mut recovered = 0usize;
        for info in fs.walk(&dir).await? {
            if parse_state(&info.path) != Some(SegmentState::Active) {
                continue;
            }
            if info.size == 0 {
                fs.remove(&info.path).await?;
                debug!(path = %info.path.display(), "removed empty active segment");
            } else {
                let flushed = with_state(&info.path, EXT_FLUSHED);
                fs.rename(&info.path, &flushed).await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(count = recovered, dir = %dir.display(), "promoted leftover active segments");
        }

        Ok(Self {
            fs,
            dir,
            _lock: lock,
        })
    }

    /// Allocate a fresh active segment. The caller owns the handle; a writer
    /// session guards against holding two at once.
    pub async fn create(&self) -> Result<ActiveSegment> {
        let path = self.dir.join(format!("{}.{}", Ulid::new(), EXT_ACTIVE));
        let file = self.fs.create(&path).await?;
        Ok(ActiveSegment {
            fs: self.fs.clone(),
            path,
            file,
            bytes: 0,
            records: 0,
            created: tokio::time::Instant::now(),
        })
    }

    /// Claim the oldest flushed segment, atomically renaming it to
    /// `.pending.<token>`. Returns `None` when nothing is claimable. Losing
    /// a race for one candidate moves on to the next.
    pub async fn oldest(&self) -> Result<Option<ClaimedSegment>> {
        let mut flushed = self.in_state_flushed().await?;
        flushed.sort_by(|a, b| a.path.cmp(&b.path));
        for info in flushed {
            let token = Ulid::new().to_string();
            let pending = pending_path(&info.path, &token);
            match self.fs.rename(&info.path, &pending).await {
                Ok(()) => {
                    return Ok(Some(ClaimedSegment {
                        token,
                        path: pending,
                        bytes: info.size,
                    }))
                }
                Err(err) if err.is_not_exist() => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(None)
    }

    /// Read the body of a claimed segment.
    pub async fn read_claimed(&self, claimed: &ClaimedSegment) -> Result<Bytes> {
        let mut file = self.fs.open(&claimed.path).await?;
        let mut body = Vec::with_capacity(claimed.bytes as usize);
        file.read_to_end(&mut body).await?;
        Ok(Bytes::from(body))
    }

    /// Delete the pending segment for `token`. Returns the freed byte count.
    pub async fn commit(&self, token: &str) -> Result<u64> {
        let info = self
            .find_pending(token)
            .await?
            .ok_or_else(|| Error::NoSuchToken(token.to_string()))?;
        match self.fs.remove(&info.path).await {
            Ok(()) => Ok(info.size),
            // The sweep reverted it between lookup and remove.
            Err(err) if err.is_not_exist() => Err(Error::NoSuchToken(token.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    /// Return the pending segment for `token` to the flushed state.
    pub async fn fail(&self, token: &str) -> Result<()> {
        let info = self
            .find_pending(token)
            .await?
            .ok_or_else(|| Error::NoSuchToken(token.to_string()))?;
        let flushed = with_state(&info.path, EXT_FLUSHED);
        match self.fs.rename(&info.path, &flushed).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_exist() => Err(Error::NoSuchToken(token.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    /// Revert pending segments whose claimants are presumed dead. Returns
    /// how many were reverted.
    pub async fn sweep(&self, pending_timeout: Duration) -> Result<usize> {
        let cutoff = SystemTime::now() - pending_timeout;
        let mut reverted = 0usize;
        for info in self.fs.walk(&self.dir).await? {
            let Some(SegmentState::Pending(token)) = parse_state(&info.path) else {
                continue;
            };
            if info.mtime > cutoff {
                continue;
            }
            let flushed = with_state(&info.path, EXT_FLUSHED);
            match self.fs.rename(&info.path, &flushed).await {
                Ok(()) => {
                    warn!(token = %token, path = %flushed.display(), "reclaimed timed-out pending segment");
                    reverted += 1;
                }
                // A late commit or fail got there first.
                Err(err) if err.is_not_exist() => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(reverted)
    }

    /// Local inspection: records from flushed segments whose ULID falls in
    /// `[from, to]`. Records without a ULID prefix can never match and are
    /// skipped. Not the primary egress path.
    pub async fn query(&self, from: Ulid, to: Ulid) -> Result<Vec<Bytes>> {
        let mut out = Vec::new();
        for info in self.in_state_flushed().await? {
            let mut file = self.fs.open(&info.path).await?;
            let mut body = Vec::with_capacity(info.size as usize);
            file.read_to_end(&mut body).await?;
            for line in record::records(&body) {
                if let Ok(id) = record::record_ulid(line) {
                    if id >= from && id <= to {
                        out.push(Bytes::copy_from_slice(line));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Count of flushed (claimable) segments, for tests and health checks.
    pub async fn flushed_count(&self) -> Result<usize> {
        Ok(self.in_state_flushed().await?.len())
    }

    async fn in_state_flushed(&self) -> Result<Vec<FileInfo>> {
        Ok(self
            .fs
            .walk(&self.dir)
            .await?
            .into_iter()
            .filter(|info| parse_state(&info.path) == Some(SegmentState::Flushed))
            .collect())
    }

    async fn find_pending(&self, token: &str) -> Result<Option<FileInfo>> {
        for info in self.fs.walk(&self.dir).await? {
            if let Some(SegmentState::Pending(t)) = parse_state(&info.path) {
                if t == token {
                    return Ok(Some(info));
                }
            }
        }
        Ok(None)
    }
}

fn pending_path(flushed: &Path, token: &str) -> PathBuf {
    with_state(flushed, &format!("{PENDING_PREFIX}{token}"))
}

/// A claimed segment: the token travels to the consumer, the path stays here.
#[derive(Debug, Clone)]
pub struct ClaimedSegment {
    pub token: String,
    pub path: PathBuf,
    pub bytes: u64,
}

/// The single open segment of one writer session.
pub struct ActiveSegment {
    fs: Arc<dyn Filesystem>,
    path: PathBuf,
    file: Box<dyn FsFile>,
    bytes: u64,
    records: u64,
    created: tokio::time::Instant,
}

impl ActiveSegment {
    /// Append one newline-terminated record.
    pub async fn write(&mut self, line: &[u8]) -> Result<()> {
        self.file.write_all(line).await?;
        self.bytes += line.len() as u64;
        self.records += 1;
        Ok(())
    }

    /// Fsync without a state change.
    pub async fn sync(&mut self) -> Result<()> {
        self.file.sync().await?;
        Ok(())
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn created(&self) -> tokio::time::Instant {
        self.created
    }

    /// Fsync and rename to `.flushed`. Closing an empty segment removes the
    /// file instead and reports nothing flushed.
    pub async fn close(mut self, reason: FlushReason) -> Result<Option<FlushedSegment>> {
        if self.bytes == 0 {
            self.fs.remove(&self.path).await?;
            return Ok(None);
        }
        self.file.sync().await?;
        let flushed = with_state(&self.path, EXT_FLUSHED);
        self.fs.rename(&self.path, &flushed).await?;
        Ok(Some(FlushedSegment {
            path: flushed,
            bytes: self.bytes,
            records: self.records,
            age: self.created.elapsed(),
            reason,
        }))
    }

    /// Drop the segment without flushing, removing the file. Used when a bulk
    /// upload turns out to be malformed.
    pub async fn discard(self) -> Result<()> {
        self.fs.remove(&self.path).await?;
        Ok(())
    }
}

/// What `close` produced, for instrumentation.
#[derive(Debug)]
pub struct FlushedSegment {
    pub path: PathBuf,
    pub bytes: u64,
    pub records: u64,
    pub age: Duration,
    pub reason: FlushReason,
}

/// Periodic sweep actor. Ticks at half the pending timeout, which is enough
/// to bound the claim-to-reap delay at 1.5 timeouts.
pub async fn run_sweeper(
    log: Arc<IngestLog>,
    pending_timeout: Duration,
    metrics: Arc<IngestMetrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let period = (pending_timeout / 2).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match log.sweep(pending_timeout).await {
                    Ok(0) => {}
                    Ok(reverted) => metrics.failed_segments.inc_by(reverted as u64),
                    Err(err) => warn!(error = %err, "sweep failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    Ok(())
}
