//! Ingest tier metrics.
//!
//! All families are owned by [`IngestMetrics`] and registered against an
//! injected registry so tests can build isolated ones.

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};

pub struct IngestMetrics {
    /// Currently connected clients by modality.
    pub connected_clients: IntGaugeVec,
    pub writer_bytes: IntCounter,
    pub writer_records: IntCounter,
    /// Explicit fsyncs of an active segment (durable modality).
    pub writer_syncs: IntCounter,
    /// Active segment flushes by reason (size, age, close).
    pub writer_flushes: IntCounterVec,
    pub segment_flush_age: Histogram,
    pub segment_flush_size: Histogram,
    /// Segments claimed but returned to flushed, by fail or sweep.
    pub failed_segments: IntCounter,
    pub committed_segments: IntCounter,
    pub committed_bytes: IntCounter,
}

impl IngestMetrics {
    pub fn new(registry: &Registry) -> Self {
        let connected_clients = IntGaugeVec::new(
            Opts::new(
                "silt_connected_clients",
                "Number of currently connected clients by modality.",
            ),
            &["modality"],
        )
        .expect("metric can be created");

        let writer_bytes = IntCounter::new(
            "silt_ingest_writer_bytes_written_total",
            "The total number of bytes written.",
        )
        .expect("metric can be created");

        let writer_records = IntCounter::new(
            "silt_ingest_writer_records_written_total",
            "The total number of records written.",
        )
        .expect("metric can be created");

        let writer_syncs = IntCounter::new(
            "silt_ingest_writer_syncs_total",
            "The number of times an active segment is explicitly fsynced.",
        )
        .expect("metric can be created");

        let writer_flushes = IntCounterVec::new(
            Opts::new(
                "silt_ingest_writer_flushes_total",
                "The number of times an active segment is flushed.",
            ),
            &["reason"],
        )
        .expect("metric can be created");

        let segment_flush_age = Histogram::with_opts(HistogramOpts::new(
            "silt_ingest_segment_flush_age_seconds",
            "Age of segment when flushed in seconds.",
        ))
        .expect("metric can be created");

        let segment_flush_size = Histogram::with_opts(
            HistogramOpts::new(
                "silt_ingest_segment_flush_size_bytes",
                "Size of active segment when flushed in bytes.",
            )
            .buckets(vec![
                (1 << 14) as f64,
                (1 << 15) as f64,
                (1 << 16) as f64,
                (1 << 17) as f64,
                (1 << 18) as f64,
                (1 << 19) as f64,
                (1 << 20) as f64,
                (1 << 21) as f64,
                (1 << 22) as f64,
                (1 << 23) as f64,
                (1 << 24) as f64,
            ]),
        )
        .expect("metric can be created");

        let failed_segments = IntCounter::new(
            "silt_ingest_failed_segments_total",
            "Segments consumed, but failed and returned to flushed.",
        )
        .expect("metric can be created");

        let committed_segments = IntCounter::new(
            "silt_ingest_committed_segments_total",
            "Segments successfully consumed and committed.",
        )
        .expect("metric can be created");

        let committed_bytes = IntCounter::new(
            "silt_ingest_committed_bytes_total",
            "Bytes successfully consumed and committed.",
        )
        .expect("metric can be created");

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(connected_clients.clone()),
            Box::new(writer_bytes.clone()),
            Box::new(writer_records.clone()),
            Box::new(writer_syncs.clone()),
            Box::new(writer_flushes.clone()),
            Box::new(segment_flush_age.clone()),
            Box::new(segment_flush_size.clone()),
            Box::new(failed_segments.clone()),
            Box::new(committed_segments.clone()),
            Box::new(committed_bytes.clone()),
        ];
        for collector in collectors {
            registry.register(collector).expect("metric can be registered");
        }

        Self {
            connected_clients,
            writer_bytes,
            writer_records,
            writer_syncs,
            writer_flushes,
            segment_flush_age,
            segment_flush_size,
            failed_segments,
            committed_segments,
            committed_bytes,
        }
    }
}
