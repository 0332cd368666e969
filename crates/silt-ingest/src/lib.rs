//! Silt Ingest Tier
//!
//! Accepts producer records over TCP, buffers them into segment files, and
//! hands flushed segments to remote consumers through a claim protocol.
//!
//! ## Segment Lifecycle
//!
//! ```text
//! writer ──► .active ──close──► .flushed ──claim──► .pending.<tok>
//!                                   ▲                    │
//!                                   └──fail / sweep──────┤
//!                                                     commit ──► deleted
//! ```
//!
//! Producers choose a durability contract per connection: `fast` (fsync at
//! rotation), `durable` (fsync and acknowledgement per record), or `bulk`
//! (one pre-formed segment, one acknowledgement). Remote consumers drive the
//! claim protocol over the HTTP API; a periodic sweep reclaims segments from
//! consumers that vanished.

pub mod api;
pub mod error;
pub mod listener;
pub mod log;
pub mod metrics;
pub mod writer;

pub use api::{router, IngestApiState, SEGMENT_TOKEN_HEADER};
pub use error::{Error, Result};
pub use listener::serve_writers;
pub use log::{
    run_sweeper, ActiveSegment, ClaimedSegment, FlushReason, FlushedSegment, IngestLog,
};
pub use metrics::IngestMetrics;
pub use writer::{handle_connection, Modality, WriterConfig};
