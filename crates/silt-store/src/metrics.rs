//! Store tier metrics, registered against an injected registry.

use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};

pub struct StoreMetrics {
    pub consumed_segments: IntCounter,
    pub consumed_bytes: IntCounter,
    /// Replication traffic by direction (ingress, egress).
    pub replicated_segments: IntCounterVec,
    pub replicated_bytes: IntCounterVec,
    /// Compaction phase duration by kind (retain, overlap, sequential,
    /// purge) and result (success, failure).
    pub compact_duration: HistogramVec,
    pub compacted_segments: IntCounterVec,
    pub trashed_segments: IntCounterVec,
    pub purged_segments: IntCounterVec,
}

impl StoreMetrics {
    pub fn new(registry: &Registry) -> Self {
        let consumed_segments = IntCounter::new(
            "silt_store_consumed_segments_total",
            "Segments consumed from ingest nodes.",
        )
        .expect("metric can be created");

        let consumed_bytes = IntCounter::new(
            "silt_store_consumed_bytes_total",
            "Bytes consumed from ingest nodes.",
        )
        .expect("metric can be created");

        let replicated_segments = IntCounterVec::new(
            Opts::new(
                "silt_store_replicated_segments_total",
                "Segments replicated, by direction.",
            ),
            &["direction"],
        )
        .expect("metric can be created");

        let replicated_bytes = IntCounterVec::new(
            Opts::new(
                "silt_store_replicated_bytes_total",
                "Bytes replicated, by direction.",
            ),
            &["direction"],
        )
        .expect("metric can be created");

        let compact_duration = HistogramVec::new(
            HistogramOpts::new(
                "silt_store_compact_duration_seconds",
                "Duration of each compaction phase in seconds.",
            ),
            &["kind", "result"],
        )
        .expect("metric can be created");

        let compacted_segments = IntCounterVec::new(
            Opts::new(
                "silt_store_compacted_segments_total",
                "Segments compacted, by kind.",
            ),
            &["kind"],
        )
        .expect("metric can be created");

        let trashed_segments = IntCounterVec::new(
            Opts::new(
                "silt_store_trashed_segments_total",
                "Segments moved to trash.",
            ),
            &["result"],
        )
        .expect("metric can be created");

        let purged_segments = IntCounterVec::new(
            Opts::new(
                "silt_store_purged_segments_total",
                "Segments purged from trash.",
            ),
            &["result"],
        )
        .expect("metric can be created");

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(consumed_segments.clone()),
            Box::new(consumed_bytes.clone()),
            Box::new(replicated_segments.clone()),
            Box::new(replicated_bytes.clone()),
            Box::new(compact_duration.clone()),
            Box::new(compacted_segments.clone()),
            Box::new(trashed_segments.clone()),
            Box::new(purged_segments.clone()),
        ];
        for collector in collectors {
            registry.register(collector).expect("metric can be registered");
        }

        Self {
            consumed_segments,
            consumed_bytes,
            replicated_segments,
            replicated_bytes,
            compact_duration,
            compacted_segments,
            trashed_segments,
            purged_segments,
        }
    }
}
