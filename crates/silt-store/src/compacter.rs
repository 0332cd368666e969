//! Store Compacter
//!
//! A periodic actor with four phases per cycle, each timed and counted:
//!
//! 1. **retain**: flushed segments whose high ULID is older than the
//!    retention period are trashed.
//! 2. **overlap**: each group of range-overlapping segments is merged into
//!    one ULID-sorted, deduplicated segment; the inputs are trashed after
//!    the output lands.
//! 3. **sequential**: runs of adjacent small segments are concatenated up
//!    to the target size; inputs trashed likewise.
//! 4. **purge**: trashed segments past the purge age are removed.
//!
//! Every cycle is bounded by its own interval as a wall-time deadline; work
//! that does not fit carries over, since group lists are re-derived from the
//! directory each cycle. A merge failure removes the partial output, leaves
//! the inputs flushed, and is retried next cycle.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::log::{SegmentMeta, StoreLog};
use crate::metrics::StoreMetrics;

#[derive(Debug, Clone)]
pub struct CompacterConfig {
    pub interval: Duration,
    pub retention: Duration,
    pub purge_age: Duration,
}

impl Default for CompacterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            purge_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

pub struct Compacter {
    store: Arc<StoreLog>,
    config: CompacterConfig,
    metrics: Arc<StoreMetrics>,
}

impl Compacter {
    pub fn new(store: Arc<StoreLog>, config: CompacterConfig, metrics: Arc<StoreMetrics>) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(interval_secs = self.config.interval.as_secs(), "compacter started");
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.cycle().await,
                _ = shutdown.changed() => break,
            }
        }
        info!("compacter stopped");
        Ok(())
    }

    /// One bounded cycle through all four phases.
    pub async fn cycle(&self) {
        let deadline = Instant::now() + self.config.interval;
        self.phase("retain", self.retain(deadline)).await;
        self.phase("overlap", self.compact_overlapping(deadline)).await;
        self.phase("sequential", self.compact_sequential(deadline)).await;
        self.phase("purge", self.purge()).await;
    }

    async fn phase(
        &self,
        kind: &str,
        work: impl std::future::Future<Output = Result<usize>>,
    ) {
        let start = Instant::now();
        let (result, count) = match work.await {
            Ok(count) => ("success", count),
            Err(err) => {
                warn!(kind = kind, error = %err, "compaction phase failed");
                ("failure", 0)
            }
        };
        self.metrics
            .compact_duration
            .with_label_values(&[kind, result])
            .observe(start.elapsed().as_secs_f64());
        if count > 0 {
            self.metrics
                .compacted_segments
                .with_label_values(&[kind])
                .inc_by(count as u64);
            debug!(kind = kind, count = count, "compaction phase done");
        }
    }

    /// Trash flushed segments whose newest record is past retention.
    async fn retain(&self, deadline: Instant) -> Result<usize> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let retention_ms = self.config.retention.as_millis() as u64;
        let mut trashed = 0usize;
        for seg in self.store.segments().await? {
            if Instant::now() >= deadline {
                break;
            }
            let age_ms = now_ms.saturating_sub(seg.high.timestamp_ms());
            if age_ms <= retention_ms {
                continue;
            }
            self.trash_counted(&seg).await;
            trashed += 1;
        }
        Ok(trashed)
    }

    /// Merge every group of overlapping segments.
    async fn compact_overlapping(&self, deadline: Instant) -> Result<usize> {
        let mut compacted = 0usize;
        for group in self.store.overlapping().await? {
            if Instant::now() >= deadline {
                break;
            }
            compacted += self.merge_group(&group, true).await?;
        }
        Ok(compacted)
    }

    /// Concatenate every run of adjacent small segments.
    async fn compact_sequential(&self, deadline: Instant) -> Result<usize> {
        let mut compacted = 0usize;
        for group in self.store.sequential().await? {
            if Instant::now() >= deadline {
                break;
            }
            compacted += self.merge_group(&group, false).await?;
        }
        Ok(compacted)
    }

    /// Combine `group` into one segment, then trash the inputs. With `sort`
    /// the records are ULID-ordered and exact duplicates dropped (overlap
    /// merge); without, bodies are concatenated in range order (sequential
    /// concat, already disjoint). The output lands before any input
    /// disappears, so a reader in between sees duplication, never loss.
    async fn merge_group(&self, group: &[SegmentMeta], sort: bool) -> Result<usize> {
        let mut lines: Vec<Vec<u8>> = Vec::new();
        for seg in group {
            let body = self.store.read(seg).await?;
            for line in silt_core::record::records(&body) {
                lines.push(line.to_vec());
            }
        }
        if sort {
            lines.sort();
            lines.dedup();
        }
        let mut body = Vec::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in &lines {
            body.extend_from_slice(line);
            body.push(b'\n');
        }

        // The output may span exactly the range of one input, so the write
        // replaces rather than bouncing off the idempotency check.
        let output = self.store.write_replacing(&body).await?;
        for seg in group {
            if seg.path == output.path {
                continue;
            }
            self.trash_counted(seg).await;
        }
        debug!(
            output = %output.path.display(),
            inputs = group.len(),
            "merged segment group"
        );
        Ok(group.len())
    }

    async fn purge(&self) -> Result<usize> {
        match self.store.purge(self.config.purge_age).await {
            Ok(purged) => {
                if purged > 0 {
                    self.metrics
                        .purged_segments
                        .with_label_values(&["success"])
                        .inc_by(purged as u64);
                }
                Ok(purged)
            }
            Err(err) => {
                self.metrics
                    .purged_segments
                    .with_label_values(&["failure"])
                    .inc();
                Err(err)
            }
        }
    }

    async fn trash_counted(&self, seg: &SegmentMeta) {
        match self.store.trash(seg).await {
            Ok(()) => {
                self.metrics
                    .trashed_segments
                    .with_label_values(&["success"])
                    .inc();
            }
            Err(err) => {
                warn!(segment = %seg.path.display(), error = %err, "trash failed");
                self.metrics
                    .trashed_segments
                    .with_label_values(&["failure"])
                    .inc();
            }
        }
    }
}
