//! Silt Store Tier
//!
//! Durably retains the segments the ingest tier produces. The consumer loop
//! drains ingest peers through their claim protocol; the compacter merges
//! overlapping segments, concatenates small neighbors, applies retention,
//! and purges the trash; the HTTP API accepts peer replication and serves
//! range queries.
//!
//! Store segments are named by the ULID range of their records, which makes
//! appends idempotent, range queries cheap to plan, and merge ordering a
//! filename comparison.

pub mod api;
pub mod compacter;
pub mod consumer;
pub mod error;
pub mod log;
pub mod metrics;

pub use api::{router, StoreApiState};
pub use compacter::{Compacter, CompacterConfig};
pub use consumer::{Consumer, ConsumerConfig};
pub use error::{Error, Result};
pub use log::{SegmentMeta, StoreLog, StoreStats};
pub use metrics::StoreMetrics;
