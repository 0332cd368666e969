//! Command line surface for `siltd`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use silt_core::{Filesystem, MemFilesystem, NopFilesystem, RealFilesystem};

#[derive(Debug, Clone, Parser)]
#[command(name = "siltd", about = "silt ingest/store log node", version)]
pub struct Args {
    /// Listen address for the ingest and store HTTP APIs.
    #[arg(long, env = "SILT_API_ADDR", default_value = "0.0.0.0:7650")]
    pub api_addr: String,

    /// Listen address for fast (async) writes.
    #[arg(long, default_value = "0.0.0.0:7651")]
    pub fast_addr: String,

    /// Listen address for durable (sync) writes.
    #[arg(long, default_value = "0.0.0.0:7652")]
    pub durable_addr: String,

    /// Listen address for bulk (whole-segment) writes.
    #[arg(long, default_value = "0.0.0.0:7653")]
    pub bulk_addr: String,

    /// Path holding segment files for the ingest tier.
    #[arg(long, default_value = "data/ingest")]
    pub ingest_path: PathBuf,

    /// Path holding segment files for the store tier.
    #[arg(long, default_value = "data/store")]
    pub store_path: PathBuf,

    /// Flush active segments after they grow to this size in bytes.
    #[arg(long, default_value_t = 25 * 1024 * 1024)]
    pub segment_flush_size: u64,

    /// Flush active segments after they are active for this many seconds.
    #[arg(long, default_value_t = 3)]
    pub segment_flush_age_secs: u64,

    /// Claimed but uncommitted segments are failed back after this long.
    #[arg(long, default_value_t = 60)]
    pub segment_pending_timeout_secs: u64,

    /// Try to keep store segments about this size in bytes.
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub segment_target_size: u64,

    /// Retention period for store segments, in seconds.
    #[arg(long, default_value_t = 7 * 24 * 60 * 60)]
    pub segment_retain_secs: u64,

    /// Purge trashed segments after this many seconds.
    #[arg(long, default_value_t = 24 * 60 * 60)]
    pub segment_purge_secs: u64,

    /// Seconds between compaction cycles; also bounds each cycle's wall time.
    #[arg(long, default_value_t = 3)]
    pub compact_interval_secs: u64,

    /// Filesystem backend.
    #[arg(long, value_enum, default_value_t = FilesystemKind::Real)]
    pub filesystem: FilesystemKind,

    /// Cluster peer API base address, e.g. http://10.0.1.2:7650. Repeatable.
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// Copies of each segment across the store tier, this node included.
    #[arg(long, default_value_t = 1)]
    pub replication_factor: usize,

    /// API base address advertised to peers; defaults to the api listener.
    #[arg(long)]
    pub advertised_api: Option<String>,
}

impl Args {
    pub fn flush_age(&self) -> Duration {
        Duration::from_secs(self.segment_flush_age_secs)
    }

    pub fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.segment_pending_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.segment_retain_secs)
    }

    pub fn purge_age(&self) -> Duration {
        Duration::from_secs(self.segment_purge_secs)
    }

    pub fn compact_interval(&self) -> Duration {
        Duration::from_secs(self.compact_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FilesystemKind {
    Real,
    Mem,
    Nop,
}

impl FilesystemKind {
    pub fn build(self) -> Arc<dyn Filesystem> {
        match self {
            FilesystemKind::Real => Arc::new(RealFilesystem::new()),
            FilesystemKind::Mem => Arc::new(MemFilesystem::new()),
            FilesystemKind::Nop => Arc::new(NopFilesystem::new()),
        }
    }
}
